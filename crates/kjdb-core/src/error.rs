//! Error types surfaced at the debugger core boundary.

use thiserror::Error;

/// Errors produced by the debugger core.
#[derive(Debug, Error)]
pub enum DebugError {
    /// No listener at the target address.
    #[error("connection refused by {host}:{port}")]
    ConnectRefused { host: String, port: u16 },

    /// The target answered but did not speak the expected protocol.
    #[error("wire protocol handshake failed: {0}")]
    HandshakeFailed(String),

    /// The child process could not be started or died before accepting.
    #[error("failed to launch target: {0}")]
    LaunchFailed(String),

    /// Operation requires the session to be suspended.
    #[error("target is not suspended")]
    NotSuspended,

    /// Operation requires the session to be running (e.g. pause).
    #[error("target is not running")]
    NotRunning,

    /// Breakpoint ID not found.
    #[error("unknown breakpoint: {0}")]
    UnknownBreakpoint(u32),

    /// Thread ID not found.
    #[error("unknown thread: {0}")]
    UnknownThread(u64),

    /// Frame index out of range for the current stack.
    #[error("invalid frame index: {0}")]
    InvalidFrameIndex(usize),

    /// No loaded class maps to the requested source position and no
    /// deferred resolution is possible.
    #[error("no code location for {file}:{line}")]
    UnresolvedSourcePosition { file: String, line: u32 },

    /// A breakpoint condition failed to parse or evaluate.
    #[error("condition error: {0}")]
    ConditionError(String),

    /// A variable reference was used after a resume invalidated it.
    #[error("stale variable reference: {0}")]
    StaleReference(i32),

    /// A remote method invocation threw or was aborted.
    #[error("remote invocation failed: {0}")]
    InvocationFailed(String),

    /// The target VM closed the session.
    #[error("target VM disconnected")]
    VmDisconnected,

    /// The session has already ended.
    #[error("session terminated")]
    Terminated,

    /// Wire-level protocol error from the target VM.
    #[error("wire protocol error: {0}")]
    Protocol(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, DebugError>;
