//! Request routing between the adapter protocol and a debug session.
//!
//! One adapter serves one client connection. Requests are handled on the
//! read loop's thread; session events arrive on the pump thread and are
//! forwarded through the shared writer.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};

use kjdb_core::session::DebugSession;
use kjdb_core::{
    DebugEvent, EventListener, ExceptionFilter, LaunchConfig, OutputCategory, StackFrame,
};

use crate::framing::{self, FramingError};
use crate::protocol::{capabilities, Event, Message, Request, Response};

// ── Outgoing writer ──────────────────────────────────────────────────────────

/// Serializes outgoing messages and assigns their `seq` numbers.
pub struct MessageWriter<W: Write> {
    writer: W,
    next_seq: i64,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_seq: 1,
        }
    }

    fn send_response(
        &mut self,
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> Result<(), FramingError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        framing::write_message(
            &mut self.writer,
            &Message::Response(Response {
                seq,
                request_seq: request.seq,
                success,
                command: request.command.clone(),
                message,
                body,
            }),
        )
    }

    fn send_event(&mut self, event: &str, body: Option<Value>) -> Result<(), FramingError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        framing::write_message(
            &mut self.writer,
            &Message::Event(Event {
                seq,
                event: event.to_string(),
                body,
            }),
        )
    }
}

// ── Event forwarding ─────────────────────────────────────────────────────────

struct EventForwarder<W: Write + Send> {
    out: Arc<Mutex<MessageWriter<W>>>,
}

impl<W: Write + Send> EventForwarder<W> {
    fn send(&self, event: &str, body: Option<Value>) {
        let mut out = self.out.lock().expect("writer poisoned");
        if let Err(err) = out.send_event(event, body) {
            log::warn!("failed to forward {event} event: {err}");
        }
    }

    fn stopped(&self, reason: &str, thread: u64) {
        self.send(
            "stopped",
            Some(json!({
                "reason": reason,
                "threadId": thread,
                "allThreadsStopped": true,
            })),
        );
    }
}

impl<W: Write + Send> EventListener for EventForwarder<W> {
    fn on_event(&self, event: &DebugEvent) {
        match event {
            DebugEvent::BreakpointHit { thread, .. } => self.stopped("breakpoint", *thread),
            DebugEvent::StepCompleted { thread, .. } => self.stopped("step", *thread),
            DebugEvent::ExceptionThrown { thread, .. } => self.stopped("exception", *thread),
            DebugEvent::Paused { thread } => self.stopped("pause", *thread),
            DebugEvent::Continued => {
                self.send("continued", Some(json!({"allThreadsContinued": true})))
            }
            DebugEvent::Terminated => self.send("terminated", None),
            DebugEvent::Exited { exit_code } => {
                self.send("exited", Some(json!({"exitCode": exit_code})))
            }
            DebugEvent::Output { category, text } => {
                let category = match category {
                    OutputCategory::Stdout => "stdout",
                    OutputCategory::Stderr => "stderr",
                    OutputCategory::Console => "console",
                };
                self.send(
                    "output",
                    Some(json!({"output": format!("{text}\n"), "category": category})),
                );
            }
            DebugEvent::ThreadStarted { thread } => self.send(
                "thread",
                Some(json!({"reason": "started", "threadId": thread})),
            ),
            DebugEvent::ThreadDied { thread } => self.send(
                "thread",
                Some(json!({"reason": "exited", "threadId": thread})),
            ),
            DebugEvent::VmStarted { .. } | DebugEvent::ClassPrepared { .. } => {}
        }
    }
}

// ── Request arguments ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchArguments {
    #[serde(alias = "program")]
    main_class: String,
    #[serde(default)]
    classpath: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_true")]
    stop_on_entry: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AttachArguments {
    #[serde(default = "default_host")]
    host: String,
    port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Deserialize)]
struct SourceArgument {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceBreakpoint {
    line: u32,
    #[serde(default)]
    condition: Option<String>,
    /// Only a plain decimal count is supported.
    #[serde(default)]
    hit_condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetBreakpointsArguments {
    source: SourceArgument,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Deserialize)]
struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    filters: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadScopedArguments {
    thread_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameScopedArguments {
    frame_id: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArguments {
    variables_reference: i32,
    #[serde(default)]
    start: Option<u32>,
    #[serde(default)]
    count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArguments {
    expression: String,
    #[serde(default)]
    frame_id: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SetVariableArguments {
    name: String,
    value: String,
}

// ── Adapter ──────────────────────────────────────────────────────────────────

/// One adapter connection.
pub struct Adapter<W: Write + Send + 'static> {
    out: Arc<Mutex<MessageWriter<W>>>,
    session: Option<Arc<DebugSession>>,
    done: bool,
}

impl<W: Write + Send + 'static> Adapter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(MessageWriter::new(writer))),
            session: None,
            done: false,
        }
    }

    /// Use an existing session instead of launching/attaching one. The
    /// forwarder listener is installed immediately.
    pub fn with_session(writer: W, session: Arc<DebugSession>) -> Self {
        let adapter = Self::new(writer);
        session.add_listener(Box::new(EventForwarder {
            out: Arc::clone(&adapter.out),
        }));
        Self {
            session: Some(session),
            ..adapter
        }
    }

    /// Read and dispatch requests until disconnect or EOF.
    pub fn serve<R: BufRead>(&mut self, mut reader: R) -> anyhow::Result<()> {
        while !self.done {
            let message = match framing::read_message(&mut reader) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(FramingError::BadBody(err)) => {
                    log::warn!("dropping malformed message: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match message {
                Message::Request(request) => self.dispatch(&request)?,
                other => log::warn!("ignoring non-request message: {other:?}"),
            }
        }
        if let Some(session) = &self.session {
            session.stop();
        }
        Ok(())
    }

    fn dispatch(&mut self, request: &Request) -> anyhow::Result<()> {
        let outcome = self.handle(request);
        let (success, message, body) = match outcome {
            Ok(body) => (true, None, body),
            Err(err) => (false, Some(err.to_string()), None),
        };
        {
            let mut out = self.out.lock().expect("writer poisoned");
            out.send_response(request, success, message, body)?;
        }

        // Post-response effects.
        match request.command.as_str() {
            "initialize" if success => {
                let mut out = self.out.lock().expect("writer poisoned");
                out.send_event("initialized", None)?;
            }
            "disconnect" => self.done = true,
            _ => {}
        }
        Ok(())
    }

    fn handle(&mut self, request: &Request) -> anyhow::Result<Option<Value>> {
        match request.command.as_str() {
            "initialize" => Ok(Some(capabilities())),
            "launch" => {
                let args: LaunchArguments = parse_arguments(request)?;
                let mut config = LaunchConfig::new(args.main_class);
                config.classpath = args.classpath;
                config.args = args.args;
                config.suspend_on_start = args.stop_on_entry;
                self.install(Arc::new(DebugSession::launch(&config)?));
                Ok(None)
            }
            "attach" => {
                let args: AttachArguments = parse_arguments(request)?;
                self.install(Arc::new(DebugSession::attach(&args.host, args.port)?));
                Ok(None)
            }
            "configurationDone" => {
                self.session()?.start()?;
                Ok(None)
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArguments = parse_arguments(request)?;
                let file = source_leaf(&args.source)
                    .ok_or_else(|| anyhow::anyhow!("source has neither name nor path"))?;
                let session = self.session()?;
                session.remove_breakpoints_in_file(&file)?;
                let mut breakpoints = Vec::with_capacity(args.breakpoints.len());
                for requested in &args.breakpoints {
                    let hit_count = requested
                        .hit_condition
                        .as_deref()
                        .and_then(|text| text.trim().parse::<u64>().ok());
                    let info = session.add_breakpoint_with_hit_count(
                        &file,
                        requested.line,
                        requested.condition.as_deref(),
                        hit_count,
                    )?;
                    breakpoints.push(json!({
                        "id": info.id,
                        "verified": info.resolved,
                        "line": requested.line,
                    }));
                }
                Ok(Some(json!({ "breakpoints": breakpoints })))
            }
            "setExceptionBreakpoints" => {
                let args: SetExceptionBreakpointsArguments = parse_arguments(request)?;
                let filters: Vec<ExceptionFilter> = args
                    .filters
                    .iter()
                    .filter_map(|name| ExceptionFilter::from_name(name))
                    .collect();
                self.session()?.set_exception_breakpoints(&filters)?;
                Ok(None)
            }
            "threads" => {
                let threads: Vec<Value> = self
                    .session()?
                    .threads()?
                    .into_iter()
                    .map(|thread| json!({"id": thread.id, "name": thread.name}))
                    .collect();
                Ok(Some(json!({ "threads": threads })))
            }
            "stackTrace" => {
                let args: ThreadScopedArguments = parse_arguments(request)?;
                let session = self.session()?;
                session.select_thread(args.thread_id)?;
                let frames: Vec<Value> = session
                    .stack_frames()?
                    .iter()
                    .map(frame_to_json)
                    .collect();
                Ok(Some(json!({
                    "stackFrames": frames,
                    "totalFrames": frames.len(),
                })))
            }
            "scopes" => {
                let args: FrameScopedArguments = parse_arguments(request)?;
                let session = self.session()?;
                session.select_frame(args.frame_id)?;
                let reference = session.frame_reference(args.frame_id)?;
                Ok(Some(json!({
                    "scopes": [{
                        "name": "Locals",
                        "variablesReference": reference,
                        "expensive": false,
                    }],
                })))
            }
            "variables" => {
                let args: VariablesArguments = parse_arguments(request)?;
                let session = self.session()?;
                let records = match (args.start, args.count) {
                    (Some(start), Some(count)) => {
                        session.expand_variable_range(args.variables_reference, start, count)?
                    }
                    _ => session.expand_variable(args.variables_reference)?,
                };
                let variables: Vec<Value> = records
                    .iter()
                    .map(|record| {
                        json!({
                            "name": record.name,
                            "value": record.value,
                            "type": record.type_name,
                            "variablesReference": record.reference,
                        })
                    })
                    .collect();
                Ok(Some(json!({ "variables": variables })))
            }
            "continue" => {
                self.session()?.resume()?;
                Ok(Some(json!({"allThreadsContinued": true})))
            }
            "pause" => {
                self.session()?.suspend()?;
                Ok(None)
            }
            "next" => {
                self.session()?.step_over()?;
                Ok(None)
            }
            "stepIn" => {
                self.session()?.step_into()?;
                Ok(None)
            }
            "stepOut" => {
                self.session()?.step_out()?;
                Ok(None)
            }
            "evaluate" => {
                let args: EvaluateArguments = parse_arguments(request)?;
                let result = self.session()?.evaluate(&args.expression, args.frame_id)?;
                Ok(Some(json!({
                    "result": result.value,
                    "type": result.type_name,
                    "variablesReference": 0,
                })))
            }
            "setVariable" => {
                let args: SetVariableArguments = parse_arguments(request)?;
                let record = self.session()?.set_variable(&args.name, &args.value)?;
                Ok(Some(json!({
                    "value": record.value,
                    "type": record.type_name,
                    "variablesReference": record.reference,
                })))
            }
            "disconnect" => {
                if let Some(session) = &self.session {
                    session.stop();
                }
                Ok(None)
            }
            other => Err(anyhow::anyhow!("unsupported command: {other}")),
        }
    }

    fn install(&mut self, session: Arc<DebugSession>) {
        session.add_listener(Box::new(EventForwarder {
            out: Arc::clone(&self.out),
        }));
        self.session = Some(session);
    }

    fn session(&self) -> anyhow::Result<&Arc<DebugSession>> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no debug session; launch or attach first"))
    }
}

fn parse_arguments<'a, T: Deserialize<'a>>(request: &'a Request) -> anyhow::Result<T> {
    let arguments = request
        .arguments
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("missing arguments for {}", request.command))?;
    Ok(T::deserialize(arguments)?)
}

/// The leaf source file name the compiler embeds; editor paths are
/// absolute and must be reduced.
fn source_leaf(source: &SourceArgument) -> Option<String> {
    if let Some(name) = &source.name {
        return Some(name.clone());
    }
    source.path.as_ref().and_then(|path| {
        Path::new(path)
            .file_name()
            .map(|leaf| leaf.to_string_lossy().into_owned())
    })
}

fn frame_to_json(frame: &StackFrame) -> Value {
    let name = if frame.is_inline {
        format!("{} [inline]", frame.method_name)
    } else {
        format!("{}.{}", frame.class_name, frame.method_name)
    };
    json!({
        "id": frame.index,
        "name": name,
        "source": {"name": frame.source_name},
        "line": frame.position.as_ref().map(|p| p.line).unwrap_or(0),
        "column": 1,
    })
}
