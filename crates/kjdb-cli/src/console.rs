//! Line-oriented console over a debug session.
//!
//! Verbs and aliases are documented in the repository README. Session
//! events print as they arrive; the prompt itself is line-editing only,
//! with history but no completion.

use std::sync::Arc;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use kjdb_core::{
    DebugEvent, DebugSession, EventListener, ExceptionFilter, OutputCategory, SessionState,
};

/// Prints session events as they arrive on the pump thread.
struct PrintingListener;

impl EventListener for PrintingListener {
    fn on_event(&self, event: &DebugEvent) {
        match event {
            DebugEvent::VmStarted { main_thread } => {
                println!("target started (main thread {main_thread})");
            }
            DebugEvent::BreakpointHit {
                breakpoint,
                thread,
                position,
            } => match position {
                Some(position) => {
                    println!("breakpoint {breakpoint} hit at {position} (thread {thread})")
                }
                None => println!("breakpoint {breakpoint} hit (thread {thread})"),
            },
            DebugEvent::StepCompleted { thread, position } => match position {
                Some(position) => println!("stepped to {position} (thread {thread})"),
                None => println!("stepped (thread {thread})"),
            },
            DebugEvent::ExceptionThrown {
                class_name,
                message,
                thread,
                position,
            } => {
                print!("exception {class_name}");
                if let Some(message) = message {
                    print!(": {message}");
                }
                if let Some(position) = position {
                    print!(" at {position}");
                }
                println!(" (thread {thread})");
            }
            DebugEvent::Paused { thread } => println!("paused (thread {thread})"),
            DebugEvent::Continued => println!("continuing"),
            DebugEvent::ThreadStarted { thread } => println!("thread {thread} started"),
            DebugEvent::ThreadDied { thread } => println!("thread {thread} exited"),
            DebugEvent::ClassPrepared { name } => log::debug!("class prepared: {name}"),
            DebugEvent::Output { category, text } => match category {
                OutputCategory::Stderr => eprintln!("{text}"),
                _ => println!("{text}"),
            },
            DebugEvent::Exited { exit_code } => println!("target exited with code {exit_code}"),
            DebugEvent::Terminated => println!("session terminated"),
        }
    }
}

/// The interactive command loop.
pub struct Console {
    session: Arc<DebugSession>,
}

impl Console {
    pub fn new(session: DebugSession) -> Self {
        let session = Arc::new(session);
        session.add_listener(Box::new(PrintingListener));
        Self { session }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let mut editor = DefaultEditor::new()?;
        println!("kjdb {} — type 'help' for commands", kjdb_core::VERSION);

        loop {
            match editor.readline("(kjdb) ") {
                Ok(line) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(&line);
                    match self.execute(&line) {
                        Ok(ConsoleOutcome::Continue) => {}
                        Ok(ConsoleOutcome::Quit) => break,
                        Err(err) => println!("error: {err}"),
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err.into()),
            }
            if self.session.state() == SessionState::Terminated {
                break;
            }
        }

        self.session.stop();
        Ok(())
    }

    fn execute(&self, line: &str) -> anyhow::Result<ConsoleOutcome> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match verb {
            "help" | "h" => {
                print_help();
            }
            "break" | "b" => self.cmd_break(&rest)?,
            "delete" | "d" => {
                let id = parse_id(&rest)?;
                if self.session.remove_breakpoint(id)? {
                    println!("deleted breakpoint {id}");
                } else {
                    println!("no breakpoint {id}");
                }
            }
            "enable" => {
                let id = parse_id(&rest)?;
                self.session.enable_breakpoint(id)?;
            }
            "disable" => {
                let id = parse_id(&rest)?;
                self.session.disable_breakpoint(id)?;
            }
            "condition" => {
                let id = parse_id(&rest)?;
                let expr = if rest.len() > 1 {
                    Some(rest[1..].join(" "))
                } else {
                    None
                };
                self.session
                    .update_breakpoint_condition(id, expr.as_deref())?;
            }
            "catch" => self.cmd_catch(&rest)?,
            "run" | "r" => {
                self.session.start()?;
            }
            "continue" | "c" => {
                // First continue on a fresh session starts it instead.
                if self.session.state() == SessionState::NotStarted {
                    self.session.start()?;
                } else {
                    self.session.resume()?;
                }
            }
            "pause" => self.session.suspend()?,
            "step" | "s" => self.session.step_into()?,
            "next" | "n" => self.session.step_over()?,
            "finish" => self.session.step_out()?,
            "backtrace" | "bt" | "where" => {
                for frame in self.session.stack_frames()? {
                    println!("{frame}");
                }
            }
            "frame" | "f" => {
                let index = parse_id(&rest)? as usize;
                self.session.select_frame(index)?;
                println!("{}", self.session.current_frame()?);
            }
            "up" => println!("{}", self.session.frame_up()?),
            "down" => println!("{}", self.session.frame_down()?),
            "threads" => {
                for thread in self.session.threads()? {
                    let marker = if thread.is_suspended { "*" } else { " " };
                    println!("{marker} [{}] {} ({})", thread.id, thread.name, thread.status);
                }
            }
            "thread" | "t" => {
                let id = parse_id(&rest)? as u64;
                self.session.select_thread(id)?;
            }
            "locals" => {
                for variable in self.session.local_variables()? {
                    println!("{}: {} = {}", variable.name, variable.type_name, variable.value);
                }
            }
            "print" | "p" => {
                if rest.is_empty() {
                    anyhow::bail!("usage: print <expression>");
                }
                let result = self.session.evaluate(&rest.join(" "), None)?;
                println!("{} : {}", result.value, result.type_name);
            }
            "set" => {
                if rest.len() < 2 {
                    anyhow::bail!("usage: set <name> <value>");
                }
                let updated = self.session.set_variable(rest[0], &rest[1..].join(" "))?;
                println!("{} = {}", updated.name, updated.value);
            }
            "info" => {
                for info in self.session.list_breakpoints() {
                    let status = if !info.enabled {
                        "disabled"
                    } else if info.resolved {
                        "enabled"
                    } else {
                        "pending"
                    };
                    print!("#{} {} [{status}]", info.id, info.spec);
                    if let Some(condition) = &info.condition {
                        print!(" if {condition}");
                    }
                    println!();
                }
            }
            "quit" | "q" | "exit" => return Ok(ConsoleOutcome::Quit),
            other => anyhow::bail!("unknown command: {other} (try 'help')"),
        }
        Ok(ConsoleOutcome::Continue)
    }

    /// `break File.kt:12 [if <condition>]`
    fn cmd_break(&self, rest: &[&str]) -> anyhow::Result<()> {
        let target = rest
            .first()
            .ok_or_else(|| anyhow::anyhow!("usage: break <file>:<line> [if <condition>]"))?;
        let (file, line) = target
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected <file>:<line>, got {target:?}"))?;
        let line: u32 = line.parse()?;

        let condition = match rest.get(1) {
            Some(&"if") if rest.len() > 2 => Some(rest[2..].join(" ")),
            Some(_) => anyhow::bail!("usage: break <file>:<line> [if <condition>]"),
            None => None,
        };

        let info = self
            .session
            .add_breakpoint(file, line, condition.as_deref())?;
        if info.resolved {
            println!("breakpoint {} at {}:{line}", info.id, file);
        } else {
            println!("breakpoint {} at {}:{line} (pending until class load)", info.id, file);
        }
        Ok(())
    }

    /// `catch caught|uncaught|all|off`
    fn cmd_catch(&self, rest: &[&str]) -> anyhow::Result<()> {
        let filters = match rest.first().copied() {
            Some("caught") => vec![ExceptionFilter::Caught],
            Some("uncaught") => vec![ExceptionFilter::Uncaught],
            Some("all") => vec![ExceptionFilter::Caught, ExceptionFilter::Uncaught],
            Some("off") => Vec::new(),
            _ => anyhow::bail!("usage: catch caught|uncaught|all|off"),
        };
        self.session.set_exception_breakpoints(&filters)?;
        Ok(())
    }
}

enum ConsoleOutcome {
    Continue,
    Quit,
}

fn parse_id(rest: &[&str]) -> anyhow::Result<u32> {
    rest.first()
        .ok_or_else(|| anyhow::anyhow!("missing id argument"))?
        .parse()
        .map_err(|_| anyhow::anyhow!("not a number: {}", rest[0]))
}

fn print_help() {
    println!("commands:");
    println!("  break <file>:<line> [if <cond>]   set a line breakpoint (b)");
    println!("  delete <id>                        remove a breakpoint (d)");
    println!("  enable <id> / disable <id>         toggle a breakpoint");
    println!("  condition <id> [<expr>]            set or clear a condition");
    println!("  catch caught|uncaught|all|off      exception breakpoints");
    println!("  info                               list breakpoints");
    println!("  run / continue                     start or resume (r, c)");
    println!("  pause                              suspend the target");
    println!("  step / next / finish               step into / over / out (s, n)");
    println!("  backtrace                          print the call stack (bt)");
    println!("  frame <n> / up / down              select a frame (f)");
    println!("  threads / thread <id>              list or select threads (t)");
    println!("  locals                             show local variables");
    println!("  print <expr>                       evaluate an expression (p)");
    println!("  set <name> <value>                 assign a local variable");
    println!("  quit                               end the session (q)");
}
