//! kjdb adapter - editor-facing debug adapter for the kjdb core
//!
//! Speaks Content-Length framed JSON over stdio or TCP: requests are routed
//! to a [`kjdb_core::DebugSession`], session events come back as adapter
//! events.

pub mod adapter;
pub mod framing;
pub mod protocol;

pub use adapter::Adapter;
pub use framing::{read_message, write_message, FramingError};
pub use protocol::{capabilities, Event, Message, Request, Response};
