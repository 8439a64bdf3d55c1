//! Streaming implementation of the value-graph encoder

use std::collections::HashSet;
use std::fmt::Debug;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::Stream;

use super::{EncodeError, Replacer};
use crate::value::{ByteStream, Deferred, RecordStream, SourceError, StreamClaim, Value};

const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Whitespace configuration for pretty printing
///
/// When active, containers emit a newline before each element and before the
/// closing bracket, indented once per nesting level, and a single space follows
/// the `:` of object members. When disabled no whitespace is emitted at all.
#[derive(Clone, Debug, Default)]
pub enum Space {
    /// Compact output without any whitespace
    #[default]
    None,
    /// Indent each level with the given number of spaces, clamped to 10
    ///
    /// `Spaces(0)` behaves like [`Space::None`].
    Spaces(u8),
    /// Indent each level with the given string, truncated to its first 10 characters
    ///
    /// An empty string behaves like [`Space::None`].
    Text(String),
}

impl Space {
    /// Resolves the configuration to the per-level indentation string,
    /// or `None` when pretty printing is disabled
    fn indent(&self) -> Option<String> {
        match self {
            Space::None => None,
            Space::Spaces(count) => {
                let count = usize::from(*count).min(10);
                if count == 0 {
                    None
                } else {
                    Some(" ".repeat(count))
                }
            }
            Space::Text(text) => {
                let text: String = text.chars().take(10).collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
        }
    }
}

/// Settings to customize the encoder behavior
///
/// These settings only affect how the JSON output looks and how it is chunked,
/// without affecting its data in any way.
///
/// These settings are used by [`JsonStreamEncoder::new_custom`]. To avoid
/// repeating the default values for unchanged settings `..Default::default()`
/// can be used:
/// ```
/// # use fluxon::encoder::{EncoderSettings, Space};
/// EncoderSettings {
///     space: Space::Spaces(2),
///     // For all other settings use the default
///     ..Default::default()
/// }
/// # ;
/// ```
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    /// Whitespace configuration for pretty printing
    pub space: Space,

    /// Default chunk size used by the [`Stream`] implementation
    ///
    /// The internal buffer accumulates output until it reaches this many bytes
    /// and is then flushed as one chunk. Consumers which pull directly with
    /// [`JsonStreamEncoder::pull`] or [`JsonStreamEncoder::poll_pull`] pass
    /// their own size instead.
    pub high_water_mark: usize,
}

impl Default for EncoderSettings {
    /// Creates the default encoder settings
    ///
    /// - space: [`Space::None`] (= compact JSON will be written)
    /// - high water mark: 16 KiB
    fn default() -> Self {
        EncoderSettings {
            space: Space::None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Separator context a value is submitted in
///
/// Carries what must be written before the value itself once it is known that
/// the value actually produces output. The enclosing container frame is the
/// top of the stack whenever the separator runs.
enum Sep {
    /// Document root, no separator
    Root,
    /// Object member: `,` if the object already has members, then the quoted
    /// key and `:`
    Member(String),
    /// Array or record stream element: `,` if the container already has elements
    Element,
}

/// A node of the explicit encoder stack
///
/// Each open container, open stream and pending asynchronous wait is one frame;
/// frames destroy themselves by popping once their work is done.
enum Frame {
    /// One-shot frame which submits the root value on its first step
    Root { value: Value },
    Object {
        entries: Arc<Vec<(String, Value)>>,
        /// Member snapshot taken when the frame was pushed: indices into
        /// `entries`, in emission order (allow-list order if one is configured)
        members: Vec<usize>,
        index: usize,
        /// Whether at least one member has been emitted
        started: bool,
        id: usize,
    },
    Array {
        items: Arc<Vec<Value>>,
        index: usize,
        started: bool,
        id: usize,
    },
    Records {
        source: RecordStream,
        stream: BoxStream<'static, Result<Value, SourceError>>,
        index: usize,
        started: bool,
        id: usize,
    },
    Text {
        source: ByteStream,
        stream: BoxStream<'static, Result<String, SourceError>>,
    },
    /// Parked until the deferred completes; on resolution the value is
    /// re-submitted with the same key and separator context
    AwaitingDeferred {
        future: BoxFuture<'static, Result<Value, SourceError>>,
        deferred: Deferred,
        key: String,
        sep: Sep,
    },
    /// Emits the closing `]` of a record stream at the correct depth
    TrailingBracket {
        /// Whether to break the line before the bracket (pretty printing with
        /// at least one element emitted)
        indent: bool,
    },
}

enum EncoderState {
    Encoding,
    Done,
    Failed,
}

/// A pull-driven encoder which turns one [`Value`] graph into one JSON document
///
/// The consumer repeatedly requests chunks with a size hint ([`pull`](Self::pull)
/// or [`poll_pull`](Self::poll_pull)), or treats the encoder as a
/// [`futures::Stream`] of chunks using the configured
/// [high water mark](EncoderSettings::high_water_mark) as the size. The
/// concatenation of all chunks is the complete document and is identical
/// regardless of the requested chunk sizes.
///
/// Internally the encoder keeps an explicit stack of frames instead of using
/// native recursion: each open container, open stream and pending asynchronous
/// wait is one frame, driven by a flat dispatch loop. The loop suspends when
/// the top frame waits for an external completion (a pending [`Deferred`] or a
/// stream without available data) and resumes when the registered waker fires.
///
/// # Examples
/// ```
/// # use fluxon::encoder::JsonStreamEncoder;
/// # use fluxon::value::Value;
/// use futures::StreamExt;
///
/// let value = Value::object(vec![("a".to_owned(), 1.into())]);
/// let mut encoder = JsonStreamEncoder::new(value);
///
/// futures::executor::block_on(async {
///     let mut json = String::new();
///     while let Some(chunk) = encoder.next().await {
///         json.push_str(&chunk?);
///     }
///     assert_eq!(json, r#"{"a":1}"#);
///     # Ok::<(), fluxon::encoder::EncodeError>(())
/// })?;
/// # Ok::<(), fluxon::encoder::EncodeError>(())
/// ```
///
/// # Error handling
/// The first error destroys the encoder: it is yielded once and afterwards the
/// encoder only reports end-of-stream. Output which was still buffered when the
/// error occurred is dropped; output already handed to the consumer is not
/// retracted.
///
/// # Cancellation
/// Dropping the encoder cancels encoding: all frames and with them all claimed
/// sources are released and no further reads occur.
pub struct JsonStreamEncoder {
    stack: Vec<Frame>,
    /// Currently-open containers and record streams, keyed on pointer identity;
    /// membership is tied to the lifetime of the owning frame
    visited: HashSet<usize>,
    /// Number of open container/stream frames, used for indentation
    depth: usize,
    buf: String,
    /// Flush threshold of the current pull
    read_size: usize,
    high_water_mark: usize,
    replacer: Option<Replacer>,
    /// Per-level indentation, `None` when pretty printing is disabled
    indent: Option<String>,
    state: EncoderState,
}

// Implementation with public constructor methods
impl JsonStreamEncoder {
    /// Creates an encoder with [default settings](EncoderSettings::default) and
    /// no replacer
    pub fn new(value: Value) -> Self {
        JsonStreamEncoder::new_custom(value, None, EncoderSettings::default())
    }

    /// Creates an encoder with a replacer and custom settings
    pub fn new_custom(
        value: Value,
        replacer: Option<Replacer>,
        settings: EncoderSettings,
    ) -> Self {
        let high_water_mark = settings.high_water_mark.max(1);
        Self {
            stack: vec![Frame::Root { value }],
            visited: HashSet::new(),
            depth: 0,
            buf: String::new(),
            read_size: high_water_mark,
            high_water_mark,
            replacer,
            indent: settings.space.indent(),
            state: EncoderState::Encoding,
        }
    }
}

// Implementation with the consumer-facing pull API
impl JsonStreamEncoder {
    /// Polls for the next chunk of up to `read_size` bytes
    ///
    /// Runs the state machine until the internal buffer holds at least
    /// `read_size` bytes (the chunk is returned), the document is complete
    /// (the remaining buffer is returned, then `None`), an error occurs
    /// (the error is returned once, then `None`), or the top frame waits for
    /// an external completion (`Poll::Pending`; the waker of `cx` is notified
    /// through the pending source).
    ///
    /// A `read_size` of `0` is treated as `1`. Chunks can be larger than
    /// `read_size` because a single emitted fragment is never split.
    pub fn poll_pull(
        &mut self,
        cx: &mut Context<'_>,
        read_size: usize,
    ) -> Poll<Option<Result<String, EncodeError>>> {
        match self.state {
            EncoderState::Encoding => {}
            EncoderState::Done | EncoderState::Failed => return Poll::Ready(None),
        }
        self.read_size = read_size.max(1);

        loop {
            if self.buf.len() >= self.read_size {
                return Poll::Ready(Some(Ok(mem::take(&mut self.buf))));
            }
            if self.stack.is_empty() {
                self.state = EncoderState::Done;
                return if self.buf.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(mem::take(&mut self.buf))))
                };
            }
            match self.step(cx) {
                Ok(Poll::Ready(())) => {}
                Ok(Poll::Pending) => return Poll::Pending,
                Err(error) => {
                    self.destroy();
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }

    /// Requests the next chunk of up to `read_size` bytes
    ///
    /// Awaitable variant of [`poll_pull`](Self::poll_pull). Returns `None` once
    /// the document is complete or after an error has been reported.
    pub async fn pull(&mut self, read_size: usize) -> Option<Result<String, EncodeError>> {
        futures::future::poll_fn(|cx| self.poll_pull(cx, read_size)).await
    }

    /// Discards all encoder state after a fatal error
    fn destroy(&mut self) {
        self.stack.clear();
        self.visited.clear();
        self.buf.clear();
        self.depth = 0;
        self.state = EncoderState::Failed;
    }
}

// Implementation with the state machine step and frame handlers
impl JsonStreamEncoder {
    /// Processes the top frame once
    ///
    /// Returns `Poll::Pending` when the top frame parked itself waiting for an
    /// external completion.
    fn step(&mut self, cx: &mut Context<'_>) -> Result<Poll<()>, EncodeError> {
        let frame = self
            .stack
            .pop()
            .expect("stack must be non-empty while encoding");

        match frame {
            Frame::Root { value } => {
                self.submit("", value, Sep::Root)?;
            }
            Frame::Object {
                entries,
                members,
                index,
                started,
                id,
            } => {
                if index == members.len() {
                    self.depth -= 1;
                    if started && self.indent.is_some() {
                        self.buf.push('\n');
                        self.emit_indent();
                    }
                    self.buf.push('}');
                    self.visited.remove(&id);
                } else {
                    let (key, value) = {
                        let entry = &entries[members[index]];
                        (entry.0.clone(), entry.1.clone())
                    };
                    self.stack.push(Frame::Object {
                        entries,
                        members,
                        index: index + 1,
                        started,
                        id,
                    });
                    let sep = Sep::Member(key.clone());
                    self.submit(&key, value, sep)?;
                }
            }
            Frame::Array {
                items,
                index,
                started,
                id,
            } => {
                if index == items.len() {
                    self.depth -= 1;
                    if started && self.indent.is_some() {
                        self.buf.push('\n');
                        self.emit_indent();
                    }
                    self.buf.push(']');
                    self.visited.remove(&id);
                } else {
                    let value = items[index].clone();
                    let key = index.to_string();
                    self.stack.push(Frame::Array {
                        items,
                        index: index + 1,
                        started,
                        id,
                    });
                    self.submit(&key, value, Sep::Element)?;
                }
            }
            Frame::Records {
                source,
                mut stream,
                index,
                started,
                id,
            } => match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(value))) => {
                    let key = index.to_string();
                    self.stack.push(Frame::Records {
                        source,
                        stream,
                        index: index + 1,
                        started,
                        id,
                    });
                    self.submit(&key, value, Sep::Element)?;
                }
                Poll::Ready(Some(Err(error))) => return Err(EncodeError::StreamError(error)),
                Poll::Ready(None) => {
                    source.mark_ended();
                    self.visited.remove(&id);
                    let indent = started && self.indent.is_some();
                    if let Some(Frame::TrailingBracket { indent: trailing }) = self.stack.last_mut()
                    {
                        *trailing = indent;
                    }
                }
                Poll::Pending => {
                    self.stack.push(Frame::Records {
                        source,
                        stream,
                        index,
                        started,
                        id,
                    });
                    return Ok(Poll::Pending);
                }
            },
            Frame::Text { source, mut stream } => match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    // Spliced verbatim; the producer asserts the chunks are
                    // valid JSON content in this position
                    self.buf.push_str(&chunk);
                    self.stack.push(Frame::Text { source, stream });
                }
                Poll::Ready(Some(Err(error))) => return Err(EncodeError::StreamError(error)),
                Poll::Ready(None) => source.mark_ended(),
                Poll::Pending => {
                    self.stack.push(Frame::Text { source, stream });
                    return Ok(Poll::Pending);
                }
            },
            Frame::AwaitingDeferred {
                mut future,
                deferred,
                key,
                sep,
            } => match future.as_mut().poll(cx) {
                Poll::Ready(Ok(value)) => {
                    deferred.settle(value.clone());
                    self.submit(&key, value, sep)?;
                }
                Poll::Ready(Err(error)) => return Err(EncodeError::DeferredRejected(error)),
                Poll::Pending => {
                    self.stack.push(Frame::AwaitingDeferred {
                        future,
                        deferred,
                        key,
                        sep,
                    });
                    return Ok(Poll::Pending);
                }
            },
            Frame::TrailingBracket { indent } => {
                self.depth -= 1;
                if indent {
                    self.buf.push('\n');
                    self.emit_indent();
                }
                self.buf.push(']');
            }
        }

        Ok(Poll::Ready(()))
    }

    /// Submits one value for encoding: applies the transform pipeline,
    /// classifies the result and dispatches on its category
    ///
    /// `key` is the object member name, the stringified element index, or `""`
    /// for the document root.
    fn submit(&mut self, key: &str, value: Value, sep: Sep) -> Result<(), EncodeError> {
        let value = self.apply_pipeline(key, value)?;
        match value {
            Value::Custom(_) => Err(EncodeError::UnsupportedType(
                "custom value substituted another custom value".to_owned(),
            )),
            // An absent object member is elided entirely, including its separator
            Value::Undefined if matches!(sep, Sep::Member(_)) => Ok(()),
            value @ (Value::Undefined
            | Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_)) => {
                self.run_separator(&sep);
                self.write_primitive(&value);
                Ok(())
            }
            Value::Object(entries) => {
                self.run_separator(&sep);
                let id = Arc::as_ptr(&entries) as *const () as usize;
                if !self.visited.insert(id) {
                    return Err(EncodeError::CircularStructure);
                }
                self.buf.push('{');
                self.depth += 1;
                let members = self.member_snapshot(&entries);
                self.stack.push(Frame::Object {
                    entries,
                    members,
                    index: 0,
                    started: false,
                    id,
                });
                Ok(())
            }
            Value::Array(items) => {
                self.run_separator(&sep);
                let id = Arc::as_ptr(&items) as *const () as usize;
                if !self.visited.insert(id) {
                    return Err(EncodeError::CircularStructure);
                }
                self.buf.push('[');
                self.depth += 1;
                self.stack.push(Frame::Array {
                    items,
                    index: 0,
                    started: false,
                    id,
                });
                Ok(())
            }
            Value::Deferred(deferred) => {
                let future = deferred.claim().ok_or_else(|| {
                    EncodeError::DeferredRejected(SourceError::from(
                        "deferred is already being awaited",
                    ))
                })?;
                self.stack.push(Frame::AwaitingDeferred {
                    future,
                    deferred,
                    key: key.to_owned(),
                    sep,
                });
                Ok(())
            }
            Value::RecordStream(source) => {
                self.run_separator(&sep);
                let stream = match source.claim() {
                    StreamClaim::Stream(stream) => stream,
                    StreamClaim::AlreadyClaimed => return Err(EncodeError::StreamStateInvalid),
                    StreamClaim::Ended => return Err(EncodeError::StreamEnded),
                };
                let id = source.id();
                self.visited.insert(id);
                self.buf.push('[');
                self.depth += 1;
                self.stack.push(Frame::TrailingBracket { indent: false });
                self.stack.push(Frame::Records {
                    source,
                    stream,
                    index: 0,
                    started: false,
                    id,
                });
                Ok(())
            }
            Value::ByteStream(source) => {
                self.run_separator(&sep);
                let stream = match source.claim() {
                    StreamClaim::Stream(stream) => stream,
                    StreamClaim::AlreadyClaimed => return Err(EncodeError::StreamStateInvalid),
                    StreamClaim::Ended => return Err(EncodeError::StreamEnded),
                };
                self.stack.push(Frame::Text { source, stream });
                Ok(())
            }
        }
    }

    /// Applies the `ToJson` hook and the transform replacer, in that order
    fn apply_pipeline(&mut self, key: &str, value: Value) -> Result<Value, EncodeError> {
        let value = match value {
            Value::Custom(hook) => hook.to_json(key).map_err(EncodeError::ReplacerFailure)?,
            value => value,
        };
        match &mut self.replacer {
            Some(Replacer::Transform(transform)) => {
                transform(key, value).map_err(EncodeError::ReplacerFailure)
            }
            _ => Ok(value),
        }
    }

    /// Takes the member snapshot of an object at frame push time
    fn member_snapshot(&self, entries: &[(String, Value)]) -> Vec<usize> {
        match &self.replacer {
            Some(Replacer::AllowList(keys)) => {
                let mut members = Vec::new();
                let mut seen = HashSet::new();
                for key in keys {
                    if !seen.insert(key.as_str()) {
                        continue;
                    }
                    if let Some(position) = entries.iter().position(|(name, _)| name == key) {
                        members.push(position);
                    }
                }
                members
            }
            _ => (0..entries.len()).collect(),
        }
    }

    /// Writes the separator owed by the enclosing container, which is the top
    /// frame whenever this runs
    fn run_separator(&mut self, sep: &Sep) {
        match sep {
            Sep::Root => {}
            Sep::Member(key) => {
                let started = match self.stack.last_mut() {
                    Some(Frame::Object { started, .. }) => mem::replace(started, true),
                    _ => unreachable!("member separator without enclosing object frame"),
                };
                if started {
                    self.buf.push(',');
                }
                if self.indent.is_some() {
                    self.buf.push('\n');
                    self.emit_indent();
                }
                self.write_string(key);
                self.buf.push(':');
                if self.indent.is_some() {
                    self.buf.push(' ');
                }
            }
            Sep::Element => {
                let started = match self.stack.last_mut() {
                    Some(Frame::Array { started, .. }) | Some(Frame::Records { started, .. }) => {
                        mem::replace(started, true)
                    }
                    _ => unreachable!("element separator without enclosing array frame"),
                };
                if started {
                    self.buf.push(',');
                }
                if self.indent.is_some() {
                    self.buf.push('\n');
                    self.emit_indent();
                }
            }
        }
    }

    fn emit_indent(&mut self) {
        if let Some(indent) = &self.indent {
            for _ in 0..self.depth {
                self.buf.push_str(indent);
            }
        }
    }
}

// Implementation with primitive writing methods
impl JsonStreamEncoder {
    fn write_primitive(&mut self, value: &Value) {
        match value {
            Value::Undefined | Value::Null => self.buf.push_str("null"),
            Value::Bool(true) => self.buf.push_str("true"),
            Value::Bool(false) => self.buf.push_str("false"),
            Value::Number(number) => self.write_number(*number),
            Value::String(string) => self.write_string(string),
            _ => unreachable!("value is not a primitive"),
        }
    }

    fn write_number(&mut self, value: f64) {
        if value.is_finite() {
            let formatted = value.to_string();
            self.buf.push_str(&formatted);
        } else {
            // JSON has no representation for non-finite numbers
            self.buf.push_str("null");
        }
    }

    fn write_string(&mut self, value: &str) {
        self.buf.push('"');
        if is_plain_string(value) {
            self.buf.push_str(value);
        } else {
            self.write_escaped(value);
        }
        self.buf.push('"');
    }

    fn write_escaped(&mut self, value: &str) {
        let mut next_to_write_index = 0;

        for (index, char) in value.char_indices() {
            if needs_escape(char) {
                if index > next_to_write_index {
                    self.buf.push_str(&value[next_to_write_index..index]);
                }
                push_escaped_char(&mut self.buf, char);
                next_to_write_index = index + char.len_utf8();
            }
        }
        // Write remaining chars
        if next_to_write_index < value.len() {
            self.buf.push_str(&value[next_to_write_index..]);
        }
    }
}

/// Whether the string can be emitted with only surrounding quotes
///
/// Short strings whose chars are all in the printable non-surrogate range and
/// need no escaping skip the char-wise escape scan.
fn is_plain_string(value: &str) -> bool {
    value.len() <= 64
        && value
            .chars()
            .all(|c| matches!(c, '\u{20}'..='\u{D799}') && c != '"' && c != '\\')
}

fn needs_escape(c: char) -> bool {
    matches!(c, '"' | '\\' | '\u{0}'..='\u{1F}') || c as u32 >= 0x10000
}

fn push_escaped_char(buf: &mut String, c: char) {
    let escape = match c {
        '"' => "\\\"",
        '\\' => "\\\\",
        '\u{0008}' => "\\b",
        '\u{000C}' => "\\f",
        '\n' => "\\n",
        '\r' => "\\r",
        '\t' => "\\t",
        '\0'..='\u{FFFF}' => {
            push_unicode_escape(buf, c as u32);
            return;
        }
        _ => {
            // Encode as surrogate pair
            let temp = (c as u32) - 0x10000;
            let high = (temp >> 10) + 0xD800;
            let low = (temp & ((1 << 10) - 1)) + 0xDC00;

            push_unicode_escape(buf, high);
            push_unicode_escape(buf, low);
            return;
        }
    };
    buf.push_str(escape);
}

fn push_unicode_escape(buf: &mut String, value: u32) {
    // For convenience `value` is u32, but it is actually u16
    debug_assert!(value <= u16::MAX as u32);

    fn to_hex(i: u32) -> char {
        match i {
            0..=9 => (b'0' + i as u8) as char,
            10..=15 => (b'A' + (i - 10) as u8) as char,
            _ => unreachable!("Unexpected value {i}"),
        }
    }

    buf.push_str("\\u");
    buf.push(to_hex((value >> 12) & 15));
    buf.push(to_hex((value >> 8) & 15));
    buf.push(to_hex((value >> 4) & 15));
    buf.push(to_hex(value & 15));
}

impl Stream for JsonStreamEncoder {
    type Item = Result<String, EncodeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let encoder = self.get_mut();
        let read_size = encoder.high_water_mark;
        encoder.poll_pull(cx, read_size)
    }
}

impl Debug for JsonStreamEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            EncoderState::Encoding => "encoding",
            EncoderState::Done => "done",
            EncoderState::Failed => "failed",
        };
        f.debug_struct("JsonStreamEncoder")
            .field("state", &state)
            .field("stack_len", &self.stack.len())
            .field("depth", &self.depth)
            .field("buffered", &self.buf.len())
            .field("read_size", &self.read_size)
            .field("indent", &self.indent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{encode_to_string, encode_to_string_with};
    use crate::value::ToJson;
    use futures::channel::{mpsc, oneshot};
    use futures::executor::block_on;
    use futures::{future, stream, FutureExt};
    use std::sync::Mutex;

    fn encode(value: Value) -> Result<String, EncodeError> {
        block_on(encode_to_string(value))
    }

    fn encode_with(
        value: Value,
        replacer: Option<Replacer>,
        settings: EncoderSettings,
    ) -> Result<String, EncodeError> {
        block_on(encode_to_string_with(value, replacer, settings))
    }

    fn encode_pretty(value: Value, space: Space) -> Result<String, EncodeError> {
        encode_with(
            value,
            None,
            EncoderSettings {
                space,
                ..Default::default()
            },
        )
    }

    /// Drives the encoder with the given read size, collecting delivered chunks
    /// and the error (if any)
    fn encode_chunked(value: Value, read_size: usize) -> (Vec<String>, Option<EncodeError>) {
        let mut encoder = JsonStreamEncoder::new(value);
        block_on(async {
            let mut chunks = Vec::new();
            let mut error = None;
            while let Some(result) = encoder.pull(read_size).await {
                match result {
                    Ok(chunk) => chunks.push(chunk),
                    Err(e) => error = Some(e),
                }
            }
            (chunks, error)
        })
    }

    fn obj(entries: Vec<(&str, Value)>) -> Value {
        Value::object(
            entries
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value))
                .collect(),
        )
    }

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn literals() -> TestResult {
        let value = Value::array(vec![true.into(), false.into(), Value::Null]);
        assert_eq!("[true,false,null]", encode(value)?);
        Ok(())
    }

    #[test]
    fn numbers() -> TestResult {
        let value = Value::array(vec![
            8_u8.into(),
            (-8_i8).into(),
            64_u64.into(),
            (-64_i64).into(),
            1.5_f64.into(),
            (-2.5_f64).into(),
            0.into(),
        ]);
        assert_eq!("[8,-8,64,-64,1.5,-2.5,0]", encode(value)?);
        Ok(())
    }

    #[test]
    fn non_finite_numbers() -> TestResult {
        let value = Value::array(vec![
            1.into(),
            f64::NAN.into(),
            f64::INFINITY.into(),
            f64::NEG_INFINITY.into(),
            2.into(),
        ]);
        assert_eq!("[1,null,null,null,2]", encode(value)?);
        Ok(())
    }

    #[test]
    fn strings() -> TestResult {
        let value = Value::array(vec![
            "".into(),
            "ab".into(),
            "a b".into(),
            "\u{0000}\u{001F}".into(),
            "\"\\/\u{0008}\u{000C}\n\r\t".into(),
            "\u{E000}".into(),
            "\u{10FFFF}".into(),
        ]);
        assert_eq!(
            r#"["","ab","a b","\u0000\u001F","\"\\/\b\f\n\r\t","#.to_owned()
                + "\"\u{E000}\",\"\\uDBFF\\uDFFF\"]",
            encode(value)?
        );
        Ok(())
    }

    #[test]
    fn long_strings_skip_fast_path() -> TestResult {
        // Longer than the fast-path limit, but without anything to escape
        let long = "a".repeat(65);
        assert_eq!(format!("\"{long}\""), encode(long.as_str().into())?);

        let mut quoted = "b".repeat(64);
        quoted.push('"');
        assert_eq!(
            format!("\"{}\\\"\"", "b".repeat(64)),
            encode(quoted.as_str().into())?
        );
        Ok(())
    }

    #[test]
    fn objects_and_arrays() -> TestResult {
        let value = obj(vec![
            ("a", 1.into()),
            (
                "b",
                Value::array(vec![true.into(), Value::Null, "x".into()]),
            ),
        ]);
        assert_eq!(r#"{"a":1,"b":[true,null,"x"]}"#, encode(value)?);

        assert_eq!("{}", encode(obj(vec![]))?);
        assert_eq!("[]", encode(Value::array(vec![]))?);
        assert_eq!("[[],{}]", encode(Value::array(vec![
            Value::array(vec![]),
            obj(vec![]),
        ]))?);
        Ok(())
    }

    #[test]
    fn undefined_members_are_elided() -> TestResult {
        let value = obj(vec![("a", Value::Undefined), ("b", 2.into())]);
        assert_eq!(r#"{"b":2}"#, encode(value)?);

        let value = obj(vec![("a", Value::Undefined)]);
        assert_eq!("{}", encode(value)?);
        Ok(())
    }

    #[test]
    fn undefined_elements_become_null() -> TestResult {
        let value = Value::array(vec![Value::Undefined, 1.into()]);
        assert_eq!("[null,1]", encode(value)?);

        // At the root there is no member to elide
        assert_eq!("null", encode(Value::Undefined)?);
        Ok(())
    }

    #[test]
    fn shared_substructure_is_not_a_cycle() -> TestResult {
        let shared = Value::array(vec![1.into()]);
        let value = Value::array(vec![shared.clone(), shared]);
        assert_eq!("[[1],[1]]", encode(value)?);
        Ok(())
    }

    #[test]
    fn chunk_concatenation_is_size_invariant() -> TestResult {
        let expected = r#"{"a":1,"b":[true,null,"x"],"c":"long enough to cross chunks"}"#;
        for read_size in [1, 2, 3, 7, 1024] {
            let value = obj(vec![
                ("a", 1.into()),
                (
                    "b",
                    Value::array(vec![true.into(), Value::Null, "x".into()]),
                ),
                ("c", "long enough to cross chunks".into()),
            ]);
            let (chunks, error) = encode_chunked(value, read_size);
            assert!(error.is_none(), "Unexpected error: {error:?}");
            assert_eq!(expected, chunks.concat(), "read_size {read_size}");
        }
        Ok(())
    }

    #[test]
    fn pretty_print() -> TestResult {
        let value = obj(vec![
            ("a", Value::array(vec![1.into(), 2.into()])),
            ("b", obj(vec![])),
            ("c", 3.into()),
        ]);
        assert_eq!(
            "{\n  \"a\": [\n    1,\n    2\n  ],\n  \"b\": {},\n  \"c\": 3\n}",
            encode_pretty(value, Space::Spaces(2))?
        );
        Ok(())
    }

    #[test]
    fn pretty_print_space_variants() -> TestResult {
        // Clamped to 10 spaces
        assert_eq!(
            format!("[\n{}1\n]", " ".repeat(10)),
            encode_pretty(Value::array(vec![1.into()]), Space::Spaces(12))?
        );
        // Indent string truncated to 10 chars
        assert_eq!(
            "[\nabcdefghij1\n]",
            encode_pretty(Value::array(vec![1.into()]), Space::Text("abcdefghijkl".to_owned()))?
        );
        assert_eq!(
            "[\n\t1\n]",
            encode_pretty(Value::array(vec![1.into()]), Space::Text("\t".to_owned()))?
        );
        // Zero-width configurations disable pretty printing
        assert_eq!(
            "[1]",
            encode_pretty(Value::array(vec![1.into()]), Space::Spaces(0))?
        );
        assert_eq!(
            "[1]",
            encode_pretty(Value::array(vec![1.into()]), Space::Text(String::new()))?
        );
        Ok(())
    }

    #[test]
    fn replacer_transform() -> TestResult {
        let value = obj(vec![("keep", 1.into()), ("drop", 2.into())]);
        let replacer = Replacer::transform(|key, value| {
            if key == "drop" {
                Ok(Value::Undefined)
            } else {
                Ok(value)
            }
        });
        assert_eq!(
            r#"{"keep":1}"#,
            encode_with(value, Some(replacer), EncoderSettings::default())?
        );
        Ok(())
    }

    #[test]
    fn replacer_sees_root_member_and_element_keys() -> TestResult {
        let keys = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen = keys.clone();
        let replacer = Replacer::transform(move |key, value| {
            seen.lock().unwrap().push(key.to_owned());
            Ok(value)
        });

        let value = obj(vec![("a", Value::array(vec![true.into(), false.into()]))]);
        encode_with(value, Some(replacer), EncoderSettings::default())?;

        assert_eq!(*keys.lock().unwrap(), vec!["", "a", "0", "1"]);
        Ok(())
    }

    #[test]
    fn replacer_failure() {
        let replacer = Replacer::transform(|_, _| Err(SourceError::from("rejected by test")));
        match encode_with(Value::Null, Some(replacer), EncoderSettings::default()) {
            Err(EncodeError::ReplacerFailure(e)) => {
                assert_eq!("rejected by test", e.to_string());
            }
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn replacer_allow_list() -> TestResult {
        let value = obj(vec![
            ("b", 2.into()),
            ("a", 1.into()),
            ("c", 3.into()),
        ]);
        // Members are emitted in allow-list order; duplicates and unknown keys
        // are ignored; arrays are unaffected
        let replacer = Replacer::allow_list(["a", "missing", "b", "a"]);
        assert_eq!(
            r#"{"a":1,"b":2}"#,
            encode_with(value, Some(replacer), EncoderSettings::default())?
        );

        let value = Value::array(vec![1.into(), 2.into()]);
        let replacer = Replacer::allow_list(["0"]);
        assert_eq!(
            "[1,2]",
            encode_with(value, Some(replacer), EncoderSettings::default())?
        );
        Ok(())
    }

    struct Wrapper(Value);
    impl ToJson for Wrapper {
        fn to_json(&self, _key: &str) -> Result<Value, SourceError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn to_json_hook() -> TestResult {
        let value = obj(vec![("a", Value::custom(Wrapper(1.into())))]);
        assert_eq!(r#"{"a":1}"#, encode(value)?);
        Ok(())
    }

    struct SelfReplacing;
    impl ToJson for SelfReplacing {
        fn to_json(&self, _key: &str) -> Result<Value, SourceError> {
            Ok(Value::custom(SelfReplacing))
        }
    }

    #[test]
    fn to_json_hook_returning_custom_is_unsupported() {
        match encode(Value::custom(SelfReplacing)) {
            Err(EncodeError::UnsupportedType(_)) => {}
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn deferred_transparency() -> TestResult {
        let direct = Value::array(vec![1.into(), 2.into(), 3.into()]);
        let deferred = Value::array(vec![
            1.into(),
            Value::deferred(future::ready(Ok(2.into()))),
            3.into(),
        ]);
        assert_eq!(encode(direct)?, encode(deferred)?);
        Ok(())
    }

    #[test]
    fn deferred_pretty_print() -> TestResult {
        let value = Value::deferred(future::ready(Ok(Value::array(vec![
            1.into(),
            2.into(),
            3.into(),
        ]))));
        assert_eq!(
            "[\n  1,\n  2,\n  3\n]",
            encode_pretty(value, Space::Spaces(2))?
        );
        Ok(())
    }

    #[test]
    fn deferred_undefined_member_is_elided() -> TestResult {
        let value = obj(vec![
            ("a", Value::deferred(future::ready(Ok(Value::Undefined)))),
            ("b", 2.into()),
        ]);
        assert_eq!(r#"{"b":2}"#, encode(value)?);
        Ok(())
    }

    #[test]
    fn deferred_resolution_is_shared() -> TestResult {
        let deferred = crate::value::Deferred::new(future::ready(Ok(5.into())));
        let value = Value::array(vec![
            Value::Deferred(deferred.clone()),
            Value::Deferred(deferred),
        ]);
        assert_eq!("[5,5]", encode(value)?);
        Ok(())
    }

    #[test]
    fn deferred_rejection() {
        let value = Value::array(vec![Value::deferred(future::ready(Err(
            SourceError::from("boom"),
        )))]);
        match encode(value) {
            Err(EncodeError::DeferredRejected(e)) => assert_eq!("boom", e.to_string()),
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn cycle_through_deferred_resolution() {
        let (tx, rx) = oneshot::channel::<Value>();
        let future = rx.map(|result| result.map_err(|e| Box::new(e) as SourceError));
        let value = obj(vec![("self", Value::deferred(future))]);
        tx.send(value.clone()).unwrap();

        let (chunks, error) = encode_chunked(value, 1);
        assert!(
            matches!(error, Some(EncodeError::CircularStructure)),
            "Unexpected error: {error:?}"
        );
        // The member separator was still buffered when the cycle was detected,
        // so only the opening bracket was delivered
        assert_eq!("{", chunks.concat());
    }

    #[test]
    fn record_stream() -> TestResult {
        let value = Value::record_stream(stream::iter(vec![
            Ok(1.into()),
            Ok("two".into()),
            Ok(obj(vec![("k", 3.into())])),
        ]));
        assert_eq!(r#"[1,"two",{"k":3}]"#, encode(value)?);
        Ok(())
    }

    #[test]
    fn record_stream_without_records() -> TestResult {
        // The opening bracket is written before the first read, so a stream
        // which ends immediately still encodes as an empty array
        let value = Value::record_stream(stream::iter(Vec::new()));
        assert_eq!("[]", encode(value)?);
        Ok(())
    }

    #[test]
    fn record_stream_pretty_print() -> TestResult {
        let value = obj(vec![(
            "s",
            Value::record_stream(stream::iter(vec![Ok(1.into()), Ok(2.into())])),
        )]);
        assert_eq!(
            "{\n  \"s\": [\n    1,\n    2\n  ]\n}",
            encode_pretty(value, Space::Spaces(2))?
        );
        Ok(())
    }

    #[test]
    fn record_stream_already_ended() {
        let records = crate::value::RecordStream::new(stream::iter(vec![Ok(1.into())]));
        let value = Value::array(vec![
            Value::RecordStream(records.clone()),
            Value::RecordStream(records),
        ]);
        match encode(value) {
            Err(EncodeError::StreamEnded) => {}
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn record_stream_already_claimed() {
        let (tx, rx) = mpsc::unbounded::<Result<Value, SourceError>>();
        let records = crate::value::RecordStream::new(rx);
        tx.unbounded_send(Ok(Value::RecordStream(records.clone())))
            .unwrap();
        drop(tx);

        match encode(Value::RecordStream(records)) {
            Err(EncodeError::StreamStateInvalid) => {}
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn record_stream_error() {
        let value = Value::record_stream(stream::iter(vec![
            Ok(1.into()),
            Err(SourceError::from("source failed")),
        ]));
        match encode(value) {
            Err(EncodeError::StreamError(e)) => assert_eq!("source failed", e.to_string()),
            r => panic!("Unexpected result: {r:?}"),
        }
    }

    #[test]
    fn byte_stream_spliced_verbatim() -> TestResult {
        let value = Value::array(vec![
            Value::byte_stream(stream::iter(vec![Ok("1".to_owned()), Ok("2".to_owned())])),
            3.into(),
        ]);
        assert_eq!("[12,3]", encode(value)?);

        // The producer is responsible for quoting and escaping
        let value = Value::byte_stream(stream::iter(vec![
            Ok("\"a".to_owned()),
            Ok("b\"".to_owned()),
        ]));
        assert_eq!("\"ab\"", encode(value)?);
        Ok(())
    }

    #[test]
    fn byte_stream_without_chunks() -> TestResult {
        let value = Value::array(vec![Value::byte_stream(stream::iter(Vec::new()))]);
        assert_eq!("[]", encode(value)?);
        Ok(())
    }

    #[test]
    fn error_stops_the_stream() {
        let value = Value::array(vec![Value::deferred(future::ready(Err(
            SourceError::from("boom"),
        )))]);
        let mut encoder = JsonStreamEncoder::new(value);
        block_on(async {
            let mut saw_error = false;
            while let Some(result) = encoder.pull(1).await {
                match result {
                    Ok(_) if saw_error => panic!("Chunk after error"),
                    Ok(_) => {}
                    Err(_) if saw_error => panic!("Second error"),
                    Err(_) => saw_error = true,
                }
            }
            assert!(saw_error);
        });
    }

    #[test]
    fn encoder_debug_output() {
        let encoder = JsonStreamEncoder::new(Value::Null);
        let debug = format!("{encoder:?}");
        assert!(debug.contains("encoding"), "Unexpected output: {debug}");
    }
}
