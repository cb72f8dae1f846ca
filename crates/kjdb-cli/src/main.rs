//! kjdb console entry point.

mod console;

use anyhow::Context;
use clap::{Parser, Subcommand};

use kjdb_core::{DebugSession, LaunchConfig};

#[derive(Debug, Parser)]
#[command(name = "kjdb", about = "Console debugger for JVM/Kotlin targets", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach to a JVM whose debug agent is already listening.
    Attach {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
    },
    /// Launch a main class under the debugger.
    Launch {
        /// Fully qualified main class (e.g. MainKt).
        main_class: String,
        /// Classpath entries.
        #[arg(long = "classpath", short = 'c')]
        classpath: Vec<String>,
        /// Start the target running instead of suspended.
        #[arg(long)]
        no_suspend: bool,
        /// Arguments passed to the target program.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let session = match cli.command {
        Command::Attach { host, port } => DebugSession::attach(&host, port)
            .with_context(|| format!("attaching to {host}:{port}"))?,
        Command::Launch {
            main_class,
            classpath,
            no_suspend,
            args,
        } => {
            let mut config = LaunchConfig::new(main_class);
            config.classpath = classpath;
            config.args = args;
            config.suspend_on_start = !no_suspend;
            DebugSession::launch(&config).context("launching target")?
        }
    };

    console::Console::new(session).run()
}
