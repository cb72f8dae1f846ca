//! Debug adapter entry point: stdio by default, TCP with `--port`.

use std::io::{BufReader, Write};
use std::net::TcpListener;

use anyhow::Context;
use clap::Parser;

use kjdb_dap::Adapter;

#[derive(Debug, Parser)]
#[command(name = "kjdb-dap", about = "Debug adapter for JVM/Kotlin targets", version)]
struct Cli {
    /// Listen for one adapter connection on this TCP port instead of
    /// serving stdio.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .with_context(|| format!("binding 127.0.0.1:{port}"))?;
            log::info!("listening on 127.0.0.1:{port}");
            let (stream, peer) = listener.accept().context("accepting client")?;
            log::info!("client connected from {peer}");
            let reader = BufReader::new(stream.try_clone()?);
            let mut adapter = Adapter::new(stream);
            adapter.serve(reader)
        }
        None => {
            let stdin = std::io::stdin();
            let reader = BufReader::new(stdin.lock());
            let mut adapter = Adapter::new(LockedStdout);
            adapter.serve(reader)
        }
    }
}

/// `StdoutLock` is tied to its handle's lifetime; this owns the handle per
/// write instead so the adapter can keep a `'static` writer.
struct LockedStdout;

impl Write for LockedStdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().lock().flush()
    }
}
