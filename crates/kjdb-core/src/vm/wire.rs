//! JDWP client implementing [`TargetVm`] over a socket.
//!
//! One reader thread owns the receive side: replies are routed to waiting
//! callers by packet id, composite event packets are decoded and queued for
//! [`TargetVm::next_events`]. Commands may be issued from any thread; the
//! write side is guarded by a mutex. Only the capability subset the
//! debugger consumes is implemented.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DebugError, Result};
use crate::vm::{
    ClassId, ClassInfo, ClassPrepareFilter, CodeLocation, EventSet, FieldValue, LocalSlot,
    MethodId, ObjectId, RawFrame, RequestId, StepDepth, SuspendPolicy, TargetVm, ThreadId,
    ThreadInfo, ThreadStatus, Value, VmEvent,
};

const HANDSHAKE: &[u8] = b"JDWP-Handshake";

/// How long a caller waits for a command reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// Command sets and commands.
const VM_SET: u8 = 1;
const VM_CLASSES_BY_SIGNATURE: u8 = 2;
const VM_ALL_CLASSES: u8 = 3;
const VM_ALL_THREADS: u8 = 4;
const VM_DISPOSE: u8 = 6;
const VM_ID_SIZES: u8 = 7;
const VM_SUSPEND: u8 = 8;
const VM_RESUME: u8 = 9;
const VM_CREATE_STRING: u8 = 11;

const REFTYPE_SET: u8 = 2;
const REFTYPE_SIGNATURE: u8 = 1;
const REFTYPE_FIELDS: u8 = 4;
const REFTYPE_METHODS: u8 = 5;
const REFTYPE_SOURCE_FILE: u8 = 7;
const REFTYPE_SOURCE_DEBUG_EXTENSION: u8 = 12;

const METHOD_SET: u8 = 6;
const METHOD_LINE_TABLE: u8 = 1;
const METHOD_VARIABLE_TABLE: u8 = 2;

const OBJECT_SET: u8 = 9;
const OBJECT_REFERENCE_TYPE: u8 = 1;
const OBJECT_GET_VALUES: u8 = 2;
const OBJECT_INVOKE_METHOD: u8 = 6;

const STRING_SET: u8 = 10;
const STRING_VALUE: u8 = 1;

const THREAD_SET: u8 = 11;
const THREAD_NAME: u8 = 1;
const THREAD_STATUS: u8 = 4;
const THREAD_FRAMES: u8 = 6;

const ARRAY_SET: u8 = 13;
const ARRAY_LENGTH: u8 = 1;
const ARRAY_GET_VALUES: u8 = 2;

const EVENT_REQUEST_SET: u8 = 15;
const EVENT_REQUEST_SET_CMD: u8 = 1;
const EVENT_REQUEST_CLEAR_CMD: u8 = 2;

const STACK_FRAME_SET: u8 = 16;
const STACK_FRAME_GET_VALUES: u8 = 1;
const STACK_FRAME_SET_VALUES: u8 = 2;
const STACK_FRAME_THIS_OBJECT: u8 = 3;

const EVENT_SET: u8 = 64;
const EVENT_COMPOSITE: u8 = 100;

// Event kinds.
const EK_SINGLE_STEP: u8 = 1;
const EK_BREAKPOINT: u8 = 2;
const EK_EXCEPTION: u8 = 4;
const EK_THREAD_START: u8 = 6;
const EK_THREAD_DEATH: u8 = 7;
const EK_CLASS_PREPARE: u8 = 8;
const EK_VM_START: u8 = 90;
const EK_VM_DEATH: u8 = 99;

// Step sizes and depths.
const STEP_SIZE_LINE: u32 = 1;
const STEP_INTO: u32 = 0;
const STEP_OVER: u32 = 1;
const STEP_OUT: u32 = 2;

const SUSPEND_ALL: u8 = 2;

const INVOKE_SINGLE_THREADED: u32 = 2;

const ACC_STATIC: u32 = 0x0008;
const ACC_NATIVE: u32 = 0x0100;

// JDWP error codes we map specially.
const ERR_VM_DEAD: u16 = 112;
const ERR_ABSENT_INFORMATION: u16 = 101;

// ── Byte cursors ─────────────────────────────────────────────────────────────

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(DebugError::Protocol("truncated reply".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn id(&mut self, size: usize) -> Result<u64> {
        let bytes = self.take(size)?;
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | u64::from(*byte);
        }
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DebugError::Protocol("non-utf8 string in reply".into()))
    }
}

#[derive(Default)]
struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn id(&mut self, v: u64, size: usize) -> &mut Self {
        let bytes = v.to_be_bytes();
        self.buf.extend_from_slice(&bytes[8 - size..]);
        self
    }

    fn string(&mut self, v: &str) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }
}

// ── Id sizes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct IdSizes {
    field: usize,
    method: usize,
    object: usize,
    reference: usize,
    frame: usize,
}

// ── Raw events (decoded on the reader thread, converted lazily) ──────────────

#[derive(Debug, Clone, Copy)]
struct RawLocation {
    class: u64,
    method: u64,
    index: u64,
}

#[derive(Debug, Clone)]
enum RawEvent {
    VmStart {
        thread: u64,
    },
    Step {
        request: u32,
        thread: u64,
        location: RawLocation,
    },
    Breakpoint {
        request: u32,
        thread: u64,
        location: RawLocation,
    },
    Exception {
        thread: u64,
        location: Option<RawLocation>,
        exception: u64,
        is_caught: bool,
    },
    ThreadStart {
        thread: u64,
    },
    ThreadDeath {
        thread: u64,
    },
    ClassPrepare {
        request: u32,
        type_id: u64,
        signature: String,
    },
    VmDeath,
    Disconnected,
}

#[derive(Debug, Clone)]
struct RawComposite {
    suspend_policy: SuspendPolicy,
    events: Vec<RawEvent>,
}

// ── Class metadata cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MethodMeta {
    id: MethodId,
    name: String,
    signature: String,
    mod_bits: u32,
}

#[derive(Debug, Clone)]
struct FieldMeta {
    id: u64,
    name: String,
    mod_bits: u32,
}

#[derive(Debug, Clone, Default)]
struct ClassMeta {
    name: String,
    /// `Some(None)` caches the absence of a source file.
    source: Option<Option<String>>,
    methods: Option<Vec<MethodMeta>>,
    fields: Option<Vec<FieldMeta>>,
}

struct ReplyPacket {
    error: u16,
    data: Vec<u8>,
}

// ── JdwpVm ───────────────────────────────────────────────────────────────────

struct WireInner {
    writer: Mutex<TcpStream>,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Sender<ReplyPacket>>>,
    events: Mutex<Receiver<RawComposite>>,
    id_sizes: IdSizes,
    request_kinds: Mutex<HashMap<RequestId, u8>>,
    classes: Mutex<HashMap<ClassId, ClassMeta>>,
    disconnected: AtomicBool,
}

/// A connected JDWP target.
pub struct JdwpVm {
    inner: Arc<WireInner>,
}

impl JdwpVm {
    /// Perform the protocol handshake and id-size negotiation, then start
    /// the reader thread.
    pub fn handshake(mut stream: TcpStream) -> Result<Self> {
        stream.write_all(HANDSHAKE)?;
        let mut reply = [0u8; 14];
        stream.read_exact(&mut reply)?;
        if reply != *HANDSHAKE {
            return Err(DebugError::HandshakeFailed(format!(
                "unexpected banner: {:?}",
                String::from_utf8_lossy(&reply)
            )));
        }

        // IDSizes is exchanged synchronously before the reader thread owns
        // the receive side. The target may push event packets (VMStart)
        // ahead of the reply; those are buffered and replayed below.
        write_packet(&mut stream, 1, VM_SET, VM_ID_SIZES, &[])?;
        let mut early_events: Vec<Vec<u8>> = Vec::new();
        let data = loop {
            let (id, flags, code, data) = read_packet(&mut stream)?;
            if flags & 0x80 != 0 {
                if id != 1 || code != 0 {
                    return Err(DebugError::HandshakeFailed(
                        "IDSizes exchange failed".into(),
                    ));
                }
                break data;
            }
            let set = (code >> 8) as u8;
            let cmd = (code & 0xff) as u8;
            if set == EVENT_SET && cmd == EVENT_COMPOSITE {
                early_events.push(data);
            }
        };
        let mut reader = ByteReader::new(&data);
        let id_sizes = IdSizes {
            field: reader.i32()? as usize,
            method: reader.i32()? as usize,
            object: reader.i32()? as usize,
            reference: reader.i32()? as usize,
            frame: reader.i32()? as usize,
        };

        let (event_tx, event_rx) = mpsc::channel();
        for data in early_events {
            match decode_composite(&data, id_sizes) {
                Ok(raw) => {
                    let _ = event_tx.send(raw);
                }
                Err(err) => log::warn!("undecodable early event: {err}"),
            }
        }
        let inner = Arc::new(WireInner {
            writer: Mutex::new(stream.try_clone()?),
            next_id: AtomicU32::new(2),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(event_rx),
            id_sizes,
            request_kinds: Mutex::new(HashMap::new()),
            classes: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        });

        let reader_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("kjdb-jdwp-reader".into())
            .spawn(move || reader_loop(stream, reader_inner, event_tx))
            .expect("failed to spawn JDWP reader thread");

        Ok(Self { inner })
    }

    // ── Command plumbing ─────────────────────────────────────────────────────

    fn command(&self, set: u8, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(DebugError::VmDisconnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        {
            let mut writer = self.inner.writer.lock().expect("writer poisoned");
            if let Err(err) = write_packet(&mut writer, id, set, cmd, payload) {
                self.inner
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                return Err(err);
            }
        }

        let reply = match rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.inner
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
                return Err(DebugError::Protocol(format!(
                    "timed out waiting for reply to command {set}/{cmd}"
                )));
            }
            Err(RecvTimeoutError::Disconnected) => return Err(DebugError::VmDisconnected),
        };

        match reply.error {
            0 => Ok(reply.data),
            ERR_VM_DEAD => Err(DebugError::VmDisconnected),
            code => Err(DebugError::Protocol(format!(
                "command {set}/{cmd} failed with JDWP error {code}"
            ))),
        }
    }

    /// Like [`command`], but maps ABSENT_INFORMATION to `None`.
    fn command_optional(&self, set: u8, cmd: u8, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.command(set, cmd, payload) {
            Ok(data) => Ok(Some(data)),
            Err(DebugError::Protocol(message))
                if message.ends_with(&format!("JDWP error {ERR_ABSENT_INFORMATION}")) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    // ── Class metadata ───────────────────────────────────────────────────────

    fn class_name(&self, class: ClassId) -> Result<String> {
        {
            let classes = self.inner.classes.lock().expect("class cache poisoned");
            if let Some(meta) = classes.get(&class) {
                if !meta.name.is_empty() {
                    return Ok(meta.name.clone());
                }
            }
        }
        let mut payload = ByteWriter::default();
        payload.id(class, self.inner.id_sizes.reference);
        let data = self.command(REFTYPE_SET, REFTYPE_SIGNATURE, &payload.buf)?;
        let signature = ByteReader::new(&data).string()?;
        let name = signature_to_name(&signature);
        let mut classes = self.inner.classes.lock().expect("class cache poisoned");
        classes.entry(class).or_default().name = name.clone();
        Ok(name)
    }

    fn class_source(&self, class: ClassId) -> Result<Option<String>> {
        {
            let classes = self.inner.classes.lock().expect("class cache poisoned");
            if let Some(meta) = classes.get(&class) {
                if let Some(source) = &meta.source {
                    return Ok(source.clone());
                }
            }
        }
        let mut payload = ByteWriter::default();
        payload.id(class, self.inner.id_sizes.reference);
        let source = match self.command_optional(REFTYPE_SET, REFTYPE_SOURCE_FILE, &payload.buf)? {
            Some(data) => Some(ByteReader::new(&data).string()?),
            None => None,
        };
        let mut classes = self.inner.classes.lock().expect("class cache poisoned");
        classes.entry(class).or_default().source = Some(source.clone());
        Ok(source)
    }

    fn class_methods(&self, class: ClassId) -> Result<Vec<MethodMeta>> {
        {
            let classes = self.inner.classes.lock().expect("class cache poisoned");
            if let Some(meta) = classes.get(&class) {
                if let Some(methods) = &meta.methods {
                    return Ok(methods.clone());
                }
            }
        }
        let mut payload = ByteWriter::default();
        payload.id(class, self.inner.id_sizes.reference);
        let data = self.command(REFTYPE_SET, REFTYPE_METHODS, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut methods = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = reader.id(self.inner.id_sizes.method)?;
            let name = reader.string()?;
            let signature = reader.string()?;
            let mod_bits = reader.u32()?;
            methods.push(MethodMeta {
                id,
                name,
                signature,
                mod_bits,
            });
        }
        let mut classes = self.inner.classes.lock().expect("class cache poisoned");
        classes.entry(class).or_default().methods = Some(methods.clone());
        Ok(methods)
    }

    fn class_fields(&self, class: ClassId) -> Result<Vec<FieldMeta>> {
        {
            let classes = self.inner.classes.lock().expect("class cache poisoned");
            if let Some(meta) = classes.get(&class) {
                if let Some(fields) = &meta.fields {
                    return Ok(fields.clone());
                }
            }
        }
        let mut payload = ByteWriter::default();
        payload.id(class, self.inner.id_sizes.reference);
        let data = self.command(REFTYPE_SET, REFTYPE_FIELDS, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = reader.id(self.inner.id_sizes.field)?;
            let name = reader.string()?;
            let _signature = reader.string()?;
            let mod_bits = reader.u32()?;
            fields.push(FieldMeta { id, name, mod_bits });
        }
        let mut classes = self.inner.classes.lock().expect("class cache poisoned");
        classes.entry(class).or_default().fields = Some(fields.clone());
        Ok(fields)
    }

    fn method_meta(&self, class: ClassId, method: MethodId) -> Result<Option<MethodMeta>> {
        Ok(self
            .class_methods(class)?
            .into_iter()
            .find(|m| m.id == method))
    }

    fn object_class(&self, object: ObjectId) -> Result<ClassId> {
        let mut payload = ByteWriter::default();
        payload.id(object, self.inner.id_sizes.object);
        let data = self.command(OBJECT_SET, OBJECT_REFERENCE_TYPE, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let _tag = reader.u8()?;
        reader.id(self.inner.id_sizes.reference)
    }

    fn string_contents(&self, object: ObjectId) -> Result<String> {
        let mut payload = ByteWriter::default();
        payload.id(object, self.inner.id_sizes.object);
        let data = self.command(STRING_SET, STRING_VALUE, &payload.buf)?;
        ByteReader::new(&data).string()
    }

    fn array_length(&self, array: ObjectId) -> Result<u32> {
        let mut payload = ByteWriter::default();
        payload.id(array, self.inner.id_sizes.object);
        let data = self.command(ARRAY_SET, ARRAY_LENGTH, &payload.buf)?;
        Ok(ByteReader::new(&data).i32()? as u32)
    }

    // ── Location and value conversion ────────────────────────────────────────

    fn convert_location(&self, raw: &RawLocation) -> Result<CodeLocation> {
        let class_name = self.class_name(raw.class)?;
        let source_name = self.class_source(raw.class)?.unwrap_or_default();
        let method = self.method_meta(raw.class, raw.method)?;
        let (method_name, line) = match &method {
            Some(meta) => (
                meta.name.clone(),
                self.line_for_index(raw.class, meta, raw.index)?,
            ),
            None => (String::new(), -1),
        };
        Ok(CodeLocation {
            class_id: raw.class,
            class_name,
            method_id: raw.method,
            method_name,
            line,
            source_name,
            code_index: raw.index,
        })
    }

    /// Line-table entry covering a code index: the last entry at or before
    /// it.
    fn line_for_index(&self, class: ClassId, method: &MethodMeta, index: u64) -> Result<i32> {
        let entries = self.method_line_entries(class, method)?;
        Ok(entries
            .iter()
            .filter(|(code_index, _)| *code_index <= index)
            .max_by_key(|(code_index, _)| *code_index)
            .map(|(_, line)| *line)
            .unwrap_or(-1))
    }

    fn method_line_entries(
        &self,
        class: ClassId,
        method: &MethodMeta,
    ) -> Result<Vec<(u64, i32)>> {
        if method.mod_bits & ACC_NATIVE != 0 {
            return Ok(Vec::new());
        }
        let mut payload = ByteWriter::default();
        payload
            .id(class, self.inner.id_sizes.reference)
            .id(method.id, self.inner.id_sizes.method);
        let Some(data) = self.command_optional(METHOD_SET, METHOD_LINE_TABLE, &payload.buf)?
        else {
            return Ok(Vec::new());
        };
        let mut reader = ByteReader::new(&data);
        let _start = reader.i64()?;
        let _end = reader.i64()?;
        let count = reader.u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let code_index = reader.u64()?;
            let line = reader.i32()?;
            entries.push((code_index, line));
        }
        Ok(entries)
    }

    fn decode_tagged_value(&self, reader: &mut ByteReader<'_>) -> Result<Value> {
        let tag = reader.u8()?;
        self.decode_value_with_tag(tag, reader)
    }

    fn decode_value_with_tag(&self, tag: u8, reader: &mut ByteReader<'_>) -> Result<Value> {
        let sizes = self.inner.id_sizes;
        Ok(match tag {
            b'V' => Value::Void,
            b'Z' => Value::Bool(reader.u8()? != 0),
            b'B' => Value::Byte(reader.u8()? as i8),
            b'S' => Value::Short(reader.u16()? as i16),
            b'I' => Value::Int(reader.i32()?),
            b'J' => Value::Long(reader.i64()?),
            b'F' => Value::Float(f32::from_bits(reader.u32()?)),
            b'D' => Value::Double(f64::from_bits(reader.u64()?)),
            b'C' => {
                let code = reader.u16()?;
                Value::Char(char::from_u32(u32::from(code)).unwrap_or('\u{fffd}'))
            }
            b's' => {
                let id = reader.id(sizes.object)?;
                if id == 0 {
                    Value::Null
                } else {
                    Value::Str {
                        id,
                        value: self.string_contents(id)?,
                    }
                }
            }
            b'[' => {
                let id = reader.id(sizes.object)?;
                if id == 0 {
                    Value::Null
                } else {
                    let class = self.object_class(id)?;
                    Value::Array {
                        id,
                        class_name: self.class_name(class)?,
                        length: self.array_length(id)?,
                    }
                }
            }
            b'L' | b't' | b'g' | b'l' | b'c' => {
                let id = reader.id(sizes.object)?;
                if id == 0 {
                    Value::Null
                } else {
                    let class = self.object_class(id)?;
                    Value::Object {
                        id,
                        class_name: self.class_name(class)?,
                    }
                }
            }
            other => {
                return Err(DebugError::Protocol(format!(
                    "unknown value tag {other:#x}"
                )))
            }
        })
    }

    fn encode_value(&self, writer: &mut ByteWriter, signature: &str, value: &Value) -> Result<()> {
        let sizes = self.inner.id_sizes;
        let tag = signature.as_bytes().first().copied().unwrap_or(b'L');
        writer.u8(tag);
        match (tag, value) {
            (b'Z', Value::Bool(b)) => {
                writer.u8(u8::from(*b));
            }
            (b'B', v) => {
                writer.u8(int_of(v)? as u8);
            }
            (b'S', v) => {
                let n = int_of(v)? as i16;
                writer.buf.extend_from_slice(&n.to_be_bytes());
            }
            (b'C', Value::Char(c)) => {
                let n = *c as u32 as u16;
                writer.buf.extend_from_slice(&n.to_be_bytes());
            }
            (b'I', v) => {
                writer.i32(int_of(v)? as i32);
            }
            (b'J', v) => {
                writer.u64(int_of(v)? as u64);
            }
            (b'F', v) => {
                writer.u32((float_of(v)? as f32).to_bits());
            }
            (b'D', v) => {
                writer.u64(float_of(v)?.to_bits());
            }
            (_, Value::Null) => {
                writer.id(0, sizes.object);
            }
            (_, Value::Str { id, value }) => {
                let id = if *id != 0 { *id } else { self.create_string(value)? };
                writer.id(id, sizes.object);
            }
            (_, Value::Object { id, .. }) | (_, Value::Array { id, .. }) => {
                writer.id(*id, sizes.object);
            }
            (tag, value) => {
                return Err(DebugError::Protocol(format!(
                    "cannot encode {value:?} into slot of type {}",
                    tag as char
                )))
            }
        }
        Ok(())
    }

    fn create_string(&self, value: &str) -> Result<ObjectId> {
        let mut payload = ByteWriter::default();
        payload.string(value);
        let data = self.command(VM_SET, VM_CREATE_STRING, &payload.buf)?;
        ByteReader::new(&data).id(self.inner.id_sizes.object)
    }

    /// Visible variable slots of a frame's method.
    fn visible_slots(
        &self,
        class: ClassId,
        method: &MethodMeta,
        code_index: u64,
    ) -> Result<Vec<(u32, String, String, bool)>> {
        let mut payload = ByteWriter::default();
        payload
            .id(class, self.inner.id_sizes.reference)
            .id(method.id, self.inner.id_sizes.method);
        let Some(data) =
            self.command_optional(METHOD_SET, METHOD_VARIABLE_TABLE, &payload.buf)?
        else {
            return Ok(Vec::new());
        };
        let mut reader = ByteReader::new(&data);
        let arg_count = reader.u32()?;
        let count = reader.u32()?;
        let mut slots = Vec::new();
        for _ in 0..count {
            let start = reader.u64()?;
            let name = reader.string()?;
            let signature = reader.string()?;
            let length = reader.u32()?;
            let slot = reader.u32()?;
            let visible = code_index >= start && code_index < start + u64::from(length);
            if visible && name != "this" {
                let is_argument = slot < arg_count;
                slots.push((slot, name, signature, is_argument));
            }
        }
        slots.sort_by_key(|(slot, ..)| *slot);
        Ok(slots)
    }

    /// The (frame id, location) pairs of a suspended thread.
    fn raw_frames(&self, thread: ThreadId) -> Result<Vec<(u64, RawLocation)>> {
        let sizes = self.inner.id_sizes;
        let mut payload = ByteWriter::default();
        payload
            .id(thread, sizes.object)
            .i32(0)
            .i32(-1);
        let data = self.command(THREAD_SET, THREAD_FRAMES, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let frame_id = reader.id(sizes.frame)?;
            let _tag = reader.u8()?;
            let class = reader.id(sizes.reference)?;
            let method = reader.id(sizes.method)?;
            let index = reader.u64()?;
            frames.push((
                frame_id,
                RawLocation {
                    class,
                    method,
                    index,
                },
            ));
        }
        Ok(frames)
    }

    fn frame_at(&self, thread: ThreadId, frame_index: usize) -> Result<(u64, RawLocation)> {
        self.raw_frames(thread)?
            .into_iter()
            .nth(frame_index)
            .ok_or(DebugError::InvalidFrameIndex(frame_index))
    }
}

fn int_of(value: &Value) -> Result<i64> {
    match value {
        Value::Byte(n) => Ok(i64::from(*n)),
        Value::Short(n) => Ok(i64::from(*n)),
        Value::Int(n) => Ok(i64::from(*n)),
        Value::Long(n) => Ok(*n),
        Value::Char(c) => Ok(*c as i64),
        other => Err(DebugError::Protocol(format!("{other:?} is not integral"))),
    }
}

fn float_of(value: &Value) -> Result<f64> {
    match value {
        Value::Float(n) => Ok(f64::from(*n)),
        Value::Double(n) => Ok(*n),
        other => int_of(other).map(|n| n as f64),
    }
}

// ── TargetVm implementation ──────────────────────────────────────────────────

impl TargetVm for JdwpVm {
    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let sizes = self.inner.id_sizes;
        let data = self.command(VM_SET, VM_ALL_THREADS, &[])?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut threads = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = reader.id(sizes.object)?;
            threads.push(self.thread_info(id)?);
        }
        Ok(threads)
    }

    fn thread_info(&self, thread: ThreadId) -> Result<ThreadInfo> {
        let sizes = self.inner.id_sizes;
        let mut payload = ByteWriter::default();
        payload.id(thread, sizes.object);
        let data = self.command(THREAD_SET, THREAD_NAME, &payload.buf)?;
        let name = ByteReader::new(&data).string()?;

        let mut payload = ByteWriter::default();
        payload.id(thread, sizes.object);
        let data = self.command(THREAD_SET, THREAD_STATUS, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let thread_status = reader.i32()?;
        let suspend_status = reader.i32()?;

        let status = match thread_status {
            0 => ThreadStatus::Zombie,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Sleeping,
            3 => ThreadStatus::Monitor,
            4 => ThreadStatus::Waiting,
            -1 => ThreadStatus::NotStarted,
            _ => ThreadStatus::Unknown,
        };
        Ok(ThreadInfo {
            id: thread,
            name,
            status,
            is_suspended: suspend_status & 0x1 != 0,
        })
    }

    fn all_classes(&self) -> Result<Vec<ClassInfo>> {
        let sizes = self.inner.id_sizes;
        let data = self.command(VM_SET, VM_ALL_CLASSES, &[])?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let _tag = reader.u8()?;
            let id = reader.id(sizes.reference)?;
            let signature = reader.string()?;
            let _status = reader.u32()?;
            let name = signature_to_name(&signature);
            {
                let mut classes = self.inner.classes.lock().expect("class cache poisoned");
                classes.entry(id).or_default().name = name.clone();
            }
            let source_name = self.class_source(id).unwrap_or(None);
            infos.push(ClassInfo {
                id,
                name,
                source_name,
            });
        }
        Ok(infos)
    }

    fn classes_by_name(&self, name: &str) -> Result<Vec<ClassInfo>> {
        let sizes = self.inner.id_sizes;
        let signature = format!("L{};", name.replace('.', "/"));
        let mut payload = ByteWriter::default();
        payload.string(&signature);
        let data = self.command(VM_SET, VM_CLASSES_BY_SIGNATURE, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()?;
        let mut infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let _tag = reader.u8()?;
            let id = reader.id(sizes.reference)?;
            let _status = reader.u32()?;
            {
                let mut classes = self.inner.classes.lock().expect("class cache poisoned");
                classes.entry(id).or_default().name = name.to_string();
            }
            infos.push(ClassInfo {
                id,
                name: name.to_string(),
                source_name: self.class_source(id).unwrap_or(None),
            });
        }
        Ok(infos)
    }

    fn source_debug_extension(&self, class: ClassId) -> Result<Option<String>> {
        let mut payload = ByteWriter::default();
        payload.id(class, self.inner.id_sizes.reference);
        match self.command_optional(REFTYPE_SET, REFTYPE_SOURCE_DEBUG_EXTENSION, &payload.buf)? {
            Some(data) => Ok(Some(ByteReader::new(&data).string()?)),
            None => Ok(None),
        }
    }

    fn line_table(&self, class: ClassId) -> Result<Vec<CodeLocation>> {
        let class_name = self.class_name(class)?;
        let source_name = self.class_source(class)?.unwrap_or_default();
        let mut locations = Vec::new();
        for method in self.class_methods(class)? {
            for (code_index, line) in self.method_line_entries(class, &method)? {
                locations.push(CodeLocation {
                    class_id: class,
                    class_name: class_name.clone(),
                    method_id: method.id,
                    method_name: method.name.clone(),
                    line,
                    source_name: source_name.clone(),
                    code_index,
                });
            }
        }
        Ok(locations)
    }

    fn locations_of_line(&self, class: ClassId, line: i32) -> Result<Vec<CodeLocation>> {
        Ok(self
            .line_table(class)?
            .into_iter()
            .filter(|location| location.line == line)
            .collect())
    }

    fn set_breakpoint(&self, location: &CodeLocation) -> Result<RequestId> {
        let sizes = self.inner.id_sizes;
        let mut payload = ByteWriter::default();
        payload.u8(EK_BREAKPOINT).u8(SUSPEND_ALL).u32(1);
        // LocationOnly modifier.
        payload
            .u8(7)
            .u8(1)
            .id(location.class_id, sizes.reference)
            .id(location.method_id, sizes.method)
            .u64(location.code_index);
        let data = self.command(EVENT_REQUEST_SET, EVENT_REQUEST_SET_CMD, &payload.buf)?;
        let request = ByteReader::new(&data).u32()?;
        self.inner
            .request_kinds
            .lock()
            .expect("request kinds poisoned")
            .insert(request, EK_BREAKPOINT);
        Ok(request)
    }

    fn set_step(&self, thread: ThreadId, depth: StepDepth) -> Result<RequestId> {
        let sizes = self.inner.id_sizes;
        let depth = match depth {
            StepDepth::Into => STEP_INTO,
            StepDepth::Over => STEP_OVER,
            StepDepth::Out => STEP_OUT,
        };
        let mut payload = ByteWriter::default();
        payload.u8(EK_SINGLE_STEP).u8(SUSPEND_ALL).u32(2);
        // Step modifier, then a one-shot count filter.
        payload
            .u8(10)
            .id(thread, sizes.object)
            .u32(STEP_SIZE_LINE)
            .u32(depth);
        payload.u8(1).i32(1);
        let data = self.command(EVENT_REQUEST_SET, EVENT_REQUEST_SET_CMD, &payload.buf)?;
        let request = ByteReader::new(&data).u32()?;
        self.inner
            .request_kinds
            .lock()
            .expect("request kinds poisoned")
            .insert(request, EK_SINGLE_STEP);
        Ok(request)
    }

    fn set_exception_watch(
        &self,
        notify_caught: bool,
        notify_uncaught: bool,
    ) -> Result<RequestId> {
        let sizes = self.inner.id_sizes;
        let mut payload = ByteWriter::default();
        payload.u8(EK_EXCEPTION).u8(SUSPEND_ALL).u32(1);
        // ExceptionOnly over all throwables.
        payload
            .u8(8)
            .id(0, sizes.reference)
            .u8(u8::from(notify_caught))
            .u8(u8::from(notify_uncaught));
        let data = self.command(EVENT_REQUEST_SET, EVENT_REQUEST_SET_CMD, &payload.buf)?;
        let request = ByteReader::new(&data).u32()?;
        self.inner
            .request_kinds
            .lock()
            .expect("request kinds poisoned")
            .insert(request, EK_EXCEPTION);
        Ok(request)
    }

    fn set_class_prepare_watch(&self, filter: &ClassPrepareFilter) -> Result<RequestId> {
        let mut payload = ByteWriter::default();
        match filter {
            ClassPrepareFilter::Any => {
                payload.u8(EK_CLASS_PREPARE).u8(SUSPEND_ALL).u32(0);
            }
            ClassPrepareFilter::ClassPattern(pattern) => {
                payload.u8(EK_CLASS_PREPARE).u8(SUSPEND_ALL).u32(1);
                payload.u8(5).string(pattern);
            }
            ClassPrepareFilter::SourceName(source) => {
                payload.u8(EK_CLASS_PREPARE).u8(SUSPEND_ALL).u32(1);
                payload.u8(12).string(source);
            }
        }
        let data = self.command(EVENT_REQUEST_SET, EVENT_REQUEST_SET_CMD, &payload.buf)?;
        let request = ByteReader::new(&data).u32()?;
        self.inner
            .request_kinds
            .lock()
            .expect("request kinds poisoned")
            .insert(request, EK_CLASS_PREPARE);
        Ok(request)
    }

    fn clear_request(&self, request: RequestId) -> Result<()> {
        let kind = self
            .inner
            .request_kinds
            .lock()
            .expect("request kinds poisoned")
            .remove(&request)
            .ok_or_else(|| DebugError::Protocol(format!("unknown request {request}")))?;
        let mut payload = ByteWriter::default();
        payload.u8(kind).u32(request);
        self.command(EVENT_REQUEST_SET, EVENT_REQUEST_CLEAR_CMD, &payload.buf)?;
        Ok(())
    }

    fn suspend_all(&self) -> Result<()> {
        self.command(VM_SET, VM_SUSPEND, &[])?;
        Ok(())
    }

    fn resume_all(&self) -> Result<()> {
        self.command(VM_SET, VM_RESUME, &[])?;
        Ok(())
    }

    fn next_events(&self, timeout: Duration) -> Result<Option<EventSet>> {
        let raw = {
            let events = self.inner.events.lock().expect("event queue poisoned");
            match events.recv_timeout(timeout) {
                Ok(raw) => raw,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(DebugError::VmDisconnected),
            }
        };

        let mut converted = Vec::with_capacity(raw.events.len());
        for event in raw.events {
            match self.convert_event(event) {
                Ok(event) => converted.push(event),
                Err(err) => {
                    // A failed conversion is dropped, never fatal.
                    log::warn!("dropping undecodable event: {err}");
                }
            }
        }
        Ok(Some(EventSet {
            suspend_policy: raw.suspend_policy,
            events: converted,
        }))
    }

    fn frames(&self, thread: ThreadId) -> Result<Vec<RawFrame>> {
        let mut frames = Vec::new();
        for (_, raw) in self.raw_frames(thread)? {
            let location = self.convert_location(&raw)?;
            let is_native = self
                .method_meta(raw.class, raw.method)?
                .map(|meta| meta.mod_bits & ACC_NATIVE != 0)
                .unwrap_or(false);
            frames.push(RawFrame {
                location,
                is_native,
            });
        }
        Ok(frames)
    }

    fn this_object(&self, thread: ThreadId, frame_index: usize) -> Result<Option<Value>> {
        let sizes = self.inner.id_sizes;
        let (frame_id, _) = self.frame_at(thread, frame_index)?;
        let mut payload = ByteWriter::default();
        payload.id(thread, sizes.object).id(frame_id, sizes.frame);
        let data = self.command(STACK_FRAME_SET, STACK_FRAME_THIS_OBJECT, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        match self.decode_tagged_value(&mut reader)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    fn local_variables(&self, thread: ThreadId, frame_index: usize) -> Result<Vec<LocalSlot>> {
        let sizes = self.inner.id_sizes;
        let (frame_id, raw) = self.frame_at(thread, frame_index)?;
        let Some(method) = self.method_meta(raw.class, raw.method)? else {
            return Ok(Vec::new());
        };
        let slots = self.visible_slots(raw.class, &method, raw.index)?;
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let mut payload = ByteWriter::default();
        payload
            .id(thread, sizes.object)
            .id(frame_id, sizes.frame)
            .u32(slots.len() as u32);
        for (slot, _, signature, _) in &slots {
            payload.u32(*slot).u8(signature.as_bytes()[0]);
        }
        let data = self.command(STACK_FRAME_SET, STACK_FRAME_GET_VALUES, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()? as usize;
        let mut locals = Vec::with_capacity(count);
        for (slot_meta, _) in slots.iter().zip(0..count) {
            let (_, name, signature, is_argument) = slot_meta;
            let value = self.decode_tagged_value(&mut reader)?;
            locals.push(LocalSlot {
                name: name.clone(),
                type_name: signature_to_name(signature),
                value,
                is_argument: *is_argument,
            });
        }
        Ok(locals)
    }

    fn set_local_variable(
        &self,
        thread: ThreadId,
        frame_index: usize,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let sizes = self.inner.id_sizes;
        let (frame_id, raw) = self.frame_at(thread, frame_index)?;
        let method = self
            .method_meta(raw.class, raw.method)?
            .ok_or_else(|| DebugError::Protocol("frame method vanished".into()))?;
        let slots = self.visible_slots(raw.class, &method, raw.index)?;
        let (slot, _, signature, _) = slots
            .into_iter()
            .find(|(_, n, ..)| n == name)
            .ok_or_else(|| DebugError::InvocationFailed(format!("no local named {name}")))?;

        let mut payload = ByteWriter::default();
        payload
            .id(thread, sizes.object)
            .id(frame_id, sizes.frame)
            .u32(1)
            .u32(slot);
        self.encode_value(&mut payload, &signature, &value)?;
        self.command(STACK_FRAME_SET, STACK_FRAME_SET_VALUES, &payload.buf)?;
        Ok(())
    }

    fn fields(&self, object: ObjectId) -> Result<Vec<FieldValue>> {
        let sizes = self.inner.id_sizes;
        let class = self.object_class(object)?;
        let fields: Vec<FieldMeta> = self
            .class_fields(class)?
            .into_iter()
            .filter(|field| field.mod_bits & ACC_STATIC == 0)
            .collect();
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut payload = ByteWriter::default();
        payload
            .id(object, sizes.object)
            .u32(fields.len() as u32);
        for field in &fields {
            payload.id(field.id, sizes.field);
        }
        let data = self.command(OBJECT_SET, OBJECT_GET_VALUES, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let count = reader.u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for field in fields.iter().take(count) {
            let value = self.decode_tagged_value(&mut reader)?;
            values.push(FieldValue {
                name: field.name.clone(),
                type_name: value.type_name(),
                value,
            });
        }
        Ok(values)
    }

    fn array_elements(&self, object: ObjectId, start: u32, count: u32) -> Result<Vec<Value>> {
        let length = self.array_length(object)?;
        if start >= length || count == 0 {
            return Ok(Vec::new());
        }
        let count = count.min(length - start);
        let mut payload = ByteWriter::default();
        payload
            .id(object, self.inner.id_sizes.object)
            .i32(start as i32)
            .i32(count as i32);
        let data = self.command(ARRAY_SET, ARRAY_GET_VALUES, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let tag = reader.u8()?;
        let returned = reader.u32()?;
        let mut values = Vec::with_capacity(returned as usize);
        let primitive = !matches!(tag, b'L' | b'[' | b's' | b't' | b'g' | b'l' | b'c');
        for _ in 0..returned {
            let value = if primitive {
                self.decode_value_with_tag(tag, &mut reader)?
            } else {
                self.decode_tagged_value(&mut reader)?
            };
            values.push(value);
        }
        Ok(values)
    }

    fn has_nullary_method(&self, object: ObjectId, name: &str) -> Result<bool> {
        let class = self.object_class(object)?;
        Ok(self
            .class_methods(class)?
            .iter()
            .any(|m| m.name == name && m.signature.starts_with("()") && m.signature != "()V"))
    }

    fn invoke_nullary(&self, thread: ThreadId, object: ObjectId, name: &str) -> Result<Value> {
        let sizes = self.inner.id_sizes;
        let class = self.object_class(object)?;
        let method = self
            .class_methods(class)?
            .into_iter()
            .find(|m| m.name == name && m.signature.starts_with("()"))
            .ok_or_else(|| DebugError::InvocationFailed(format!("no method {name}()")))?;

        let mut payload = ByteWriter::default();
        payload
            .id(object, sizes.object)
            .id(thread, sizes.object)
            .id(class, sizes.reference)
            .id(method.id, sizes.method)
            .u32(0)
            .u32(INVOKE_SINGLE_THREADED);
        let data = self.command(OBJECT_SET, OBJECT_INVOKE_METHOD, &payload.buf)?;
        let mut reader = ByteReader::new(&data);
        let value = self.decode_tagged_value(&mut reader)?;
        let _exception_tag = reader.u8()?;
        let exception = reader.id(sizes.object)?;
        if exception != 0 {
            let class_name = self
                .object_class(exception)
                .and_then(|c| self.class_name(c))
                .unwrap_or_else(|_| "java.lang.Throwable".into());
            return Err(DebugError::InvocationFailed(format!("{name}() threw {class_name}")));
        }
        Ok(value)
    }

    fn dispose(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut writer) = self.inner.writer.lock() {
            let _ = write_packet(&mut writer, id, VM_SET, VM_DISPOSE, &[]);
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl JdwpVm {
    fn convert_event(&self, raw: RawEvent) -> Result<VmEvent> {
        Ok(match raw {
            RawEvent::VmStart { thread } => VmEvent::VmStart { thread },
            RawEvent::Step {
                request,
                thread,
                location,
            } => VmEvent::Step {
                request,
                thread,
                location: self.convert_location(&location)?,
            },
            RawEvent::Breakpoint {
                request,
                thread,
                location,
            } => VmEvent::Breakpoint {
                request,
                thread,
                location: self.convert_location(&location)?,
            },
            RawEvent::Exception {
                thread,
                location,
                exception,
                is_caught,
            } => {
                let class_name = self
                    .object_class(exception)
                    .and_then(|class| self.class_name(class))
                    .unwrap_or_else(|_| "java.lang.Throwable".into());
                let message = self.exception_message(exception);
                VmEvent::Exception {
                    thread,
                    class_name,
                    message,
                    is_caught,
                    location: match location {
                        Some(raw) => Some(self.convert_location(&raw)?),
                        None => None,
                    },
                }
            }
            RawEvent::ThreadStart { thread } => VmEvent::ThreadStart { thread },
            RawEvent::ThreadDeath { thread } => VmEvent::ThreadDeath { thread },
            RawEvent::ClassPrepare {
                request,
                type_id,
                signature,
            } => {
                let name = signature_to_name(&signature);
                {
                    let mut classes = self.inner.classes.lock().expect("class cache poisoned");
                    classes.entry(type_id).or_default().name = name.clone();
                }
                VmEvent::ClassPrepare {
                    request,
                    class: ClassInfo {
                        id: type_id,
                        name,
                        source_name: self.class_source(type_id).unwrap_or(None),
                    },
                }
            }
            RawEvent::VmDeath => VmEvent::VmDeath,
            RawEvent::Disconnected => VmEvent::Disconnected,
        })
    }

    /// Best-effort read of `Throwable.detailMessage`.
    fn exception_message(&self, exception: ObjectId) -> Option<String> {
        let fields = self.fields(exception).ok()?;
        fields.into_iter().find_map(|field| {
            if field.name == "detailMessage" {
                match field.value {
                    Value::Str { value, .. } => Some(value),
                    _ => None,
                }
            } else {
                None
            }
        })
    }
}

// ── Socket framing ───────────────────────────────────────────────────────────

fn write_packet(stream: &mut TcpStream, id: u32, set: u8, cmd: u8, payload: &[u8]) -> Result<()> {
    let length = 11 + payload.len() as u32;
    let mut packet = Vec::with_capacity(length as usize);
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(0);
    packet.push(set);
    packet.push(cmd);
    packet.extend_from_slice(payload);
    stream.write_all(&packet)?;
    Ok(())
}

/// Read one packet: `(id, flags, error-or-command, data)`. For command
/// packets the error slot carries `(set << 8) | cmd`.
fn read_packet(stream: &mut TcpStream) -> Result<(u32, u8, u16, Vec<u8>)> {
    let mut header = [0u8; 11];
    stream.read_exact(&mut header)?;
    let length = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
    let id = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let flags = header[8];
    let code = u16::from_be_bytes(header[9..11].try_into().unwrap());
    if length < 11 {
        return Err(DebugError::Protocol("bad packet length".into()));
    }
    let mut data = vec![0u8; length - 11];
    stream.read_exact(&mut data)?;
    Ok((id, flags, code, data))
}

fn reader_loop(mut stream: TcpStream, inner: Arc<WireInner>, events: Sender<RawComposite>) {
    loop {
        let (id, flags, code, data) = match read_packet(&mut stream) {
            Ok(packet) => packet,
            Err(_) => break,
        };
        if flags & 0x80 != 0 {
            let sender = inner
                .pending
                .lock()
                .expect("pending map poisoned")
                .remove(&id);
            if let Some(sender) = sender {
                let _ = sender.send(ReplyPacket {
                    error: code,
                    data,
                });
            }
        } else {
            let set = (code >> 8) as u8;
            let cmd = (code & 0xff) as u8;
            if set == EVENT_SET && cmd == EVENT_COMPOSITE {
                match decode_composite(&data, inner.id_sizes) {
                    Ok(raw) => {
                        if events.send(raw).is_err() {
                            break;
                        }
                    }
                    Err(err) => log::warn!("undecodable composite event: {err}"),
                }
            }
        }
    }

    inner.disconnected.store(true, Ordering::SeqCst);
    // Wake every waiting caller.
    inner
        .pending
        .lock()
        .expect("pending map poisoned")
        .clear();
    let _ = events.send(RawComposite {
        suspend_policy: SuspendPolicy::None,
        events: vec![RawEvent::Disconnected],
    });
}

fn decode_composite(data: &[u8], sizes: IdSizes) -> Result<RawComposite> {
    let mut reader = ByteReader::new(data);
    let suspend_policy = match reader.u8()? {
        0 => SuspendPolicy::None,
        1 => SuspendPolicy::EventThread,
        _ => SuspendPolicy::All,
    };
    let count = reader.u32()?;
    let mut events = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = reader.u8()?;
        let request = reader.u32()?;
        match kind {
            EK_VM_START => {
                let thread = reader.id(sizes.object)?;
                events.push(RawEvent::VmStart { thread });
            }
            EK_SINGLE_STEP | EK_BREAKPOINT => {
                let thread = reader.id(sizes.object)?;
                let location = read_location(&mut reader, sizes)?;
                events.push(if kind == EK_SINGLE_STEP {
                    RawEvent::Step {
                        request,
                        thread,
                        location,
                    }
                } else {
                    RawEvent::Breakpoint {
                        request,
                        thread,
                        location,
                    }
                });
            }
            EK_EXCEPTION => {
                let thread = reader.id(sizes.object)?;
                let location = read_location(&mut reader, sizes)?;
                let _tag = reader.u8()?;
                let exception = reader.id(sizes.object)?;
                let catch_location = read_location(&mut reader, sizes)?;
                events.push(RawEvent::Exception {
                    thread,
                    location: Some(location),
                    exception,
                    is_caught: catch_location.class != 0,
                });
            }
            EK_THREAD_START => {
                let thread = reader.id(sizes.object)?;
                events.push(RawEvent::ThreadStart { thread });
            }
            EK_THREAD_DEATH => {
                let thread = reader.id(sizes.object)?;
                events.push(RawEvent::ThreadDeath { thread });
            }
            EK_CLASS_PREPARE => {
                let _thread = reader.id(sizes.object)?;
                let _tag = reader.u8()?;
                let type_id = reader.id(sizes.reference)?;
                let signature = reader.string()?;
                let _status = reader.u32()?;
                events.push(RawEvent::ClassPrepare {
                    request,
                    type_id,
                    signature,
                });
            }
            EK_VM_DEATH => {
                events.push(RawEvent::VmDeath);
            }
            other => {
                return Err(DebugError::Protocol(format!(
                    "unhandled event kind {other}"
                )))
            }
        }
    }
    Ok(RawComposite {
        suspend_policy,
        events,
    })
}

fn read_location(reader: &mut ByteReader<'_>, sizes: IdSizes) -> Result<RawLocation> {
    let _tag = reader.u8()?;
    let class = reader.id(sizes.reference)?;
    let method = reader.id(sizes.method)?;
    let index = reader.u64()?;
    Ok(RawLocation {
        class,
        method,
        index,
    })
}

/// JVM type signature to a user-facing name: `Lcom/example/Main;` becomes
/// `com.example.Main`, `[I` becomes `int[]`.
fn signature_to_name(signature: &str) -> String {
    let mut dimensions = 0;
    let mut rest = signature;
    while let Some(stripped) = rest.strip_prefix('[') {
        dimensions += 1;
        rest = stripped;
    }
    let base = match rest.as_bytes().first() {
        Some(b'L') => rest
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .unwrap_or(rest)
            .replace('/', "."),
        Some(b'Z') => "boolean".into(),
        Some(b'B') => "byte".into(),
        Some(b'C') => "char".into(),
        Some(b'S') => "short".into(),
        Some(b'I') => "int".into(),
        Some(b'J') => "long".into(),
        Some(b'F') => "float".into(),
        Some(b'D') => "double".into(),
        Some(b'V') => "void".into(),
        _ => rest.to_string(),
    };
    format!("{base}{}", "[]".repeat(dimensions))
}
