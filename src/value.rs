//! Module for building the input value graph
//!
//! [`Value`] is the input type of the encoder. Besides the regular JSON shapes it
//! has variants for asynchronous sub-sources ([`Deferred`], [`RecordStream`] and
//! [`ByteStream`]) and for values which compute their JSON representation lazily
//! through the [`ToJson`] hook.

use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};

use duplicate::duplicate_item;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

/// Error produced by a user-supplied source
///
/// Deferred values, streams, replacers and [`ToJson`] hooks report failures with
/// this type; the encoder wraps it into the matching
/// [`EncodeError`](crate::encoder::EncodeError) variant and destroys itself.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Hook for values which compute their JSON representation on demand
///
/// This is applied by the encoder's transform pipeline before classification:
/// the hook result is encoded in place of the original value. The hook is called
/// exactly once per submission; returning another [`Value::Custom`] fails the
/// encoder with [`EncodeError::UnsupportedType`](crate::encoder::EncodeError::UnsupportedType).
///
/// # Examples
/// ```
/// # use fluxon::value::{SourceError, ToJson, Value};
/// struct Timestamp(u64);
///
/// impl ToJson for Timestamp {
///     fn to_json(&self, _key: &str) -> Result<Value, SourceError> {
///         Ok(Value::from(self.0))
///     }
/// }
///
/// let value = Value::custom(Timestamp(123));
/// let json = futures::executor::block_on(fluxon::encoder::encode_to_string(value))?;
/// assert_eq!(json, "123");
/// # Ok::<(), fluxon::encoder::EncodeError>(())
/// ```
pub trait ToJson: Send + Sync {
    /// Produces the value to encode in place of `self`
    ///
    /// `key` is the object member name, the stringified array index, or `""`
    /// for the document root.
    fn to_json(&self, key: &str) -> Result<Value, SourceError>;
}

/// A node of the input value graph
///
/// Arrays and objects hold their children behind an [`Arc`], so cloning a value
/// is cheap and the same node may appear in several places of one document
/// (shared substructure is encoded repeatedly, not deduplicated). A node which
/// is re-introduced *while it is still open* — for example by a deferred
/// resolving to one of its enclosing containers — is a cycle and fails the
/// encoder with [`EncodeError::CircularStructure`](crate::encoder::EncodeError::CircularStructure).
#[derive(Clone)]
pub enum Value {
    /// The absent value
    ///
    /// Object members with this value are elided entirely (neither key nor
    /// separator is written); everywhere else it is encoded as `null`.
    Undefined,
    /// The JSON `null` value
    Null,
    /// A JSON boolean value
    Bool(bool),
    /// A JSON number value
    ///
    /// Non-finite numbers are encoded as `null`.
    Number(f64),
    /// A JSON string value
    String(String),
    /// An ordered sequence, encoded as a JSON array
    Array(Arc<Vec<Value>>),
    /// A keyed mapping, encoded as a JSON object in entry order
    Object(Arc<Vec<(String, Value)>>),
    /// A single-shot asynchronous value
    Deferred(Deferred),
    /// An incremental source of values, encoded as a JSON array
    RecordStream(RecordStream),
    /// An incremental source of text fragments, spliced into the output verbatim
    ByteStream(ByteStream),
    /// A value encoded through its [`ToJson`] hook
    Custom(Arc<dyn ToJson>),
}

impl Value {
    /// Creates an array value from the given items
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(items))
    }

    /// Creates an object value with the given members, preserving their order
    pub fn object(entries: Vec<(String, Value)>) -> Self {
        Value::Object(Arc::new(entries))
    }

    /// Creates a deferred value from a future
    ///
    /// See [`Deferred::new`].
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, SourceError>> + Send + 'static,
    {
        Value::Deferred(Deferred::new(future))
    }

    /// Creates a record stream value from a stream of values
    ///
    /// See [`RecordStream::new`].
    pub fn record_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, SourceError>> + Send + 'static,
    {
        Value::RecordStream(RecordStream::new(stream))
    }

    /// Creates a byte stream value from a stream of text fragments
    ///
    /// See [`ByteStream::new`].
    pub fn byte_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, SourceError>> + Send + 'static,
    {
        Value::ByteStream(ByteStream::new(stream))
    }

    /// Creates a value which is encoded through its [`ToJson`] hook
    pub fn custom<T: ToJson + 'static>(hook: T) -> Self {
        Value::Custom(Arc::new(hook))
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Value::Number(value) => f.debug_tuple("Number").field(value).finish(),
            Value::String(value) => f.debug_tuple("String").field(value).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            Value::Deferred(_) => f.write_str("Deferred(..)"),
            Value::RecordStream(_) => f.write_str("RecordStream(..)"),
            Value::ByteStream(_) => f.write_str("ByteStream(..)"),
            Value::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Number(f64::from(value))
    }
}

// Use `duplicate` crate to avoid repeating code for all supported types, see https://stackoverflow.com/a/61467564
#[duplicate_item(type_template; [u8]; [i8]; [u16]; [i16]; [u32]; [i32]; [u64]; [i64]; [usize]; [isize])]
impl From<type_template> for Value {
    #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
    fn from(value: type_template) -> Self {
        Value::Number(value as f64)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<Vec<(String, Value)>> for Value {
    fn from(entries: Vec<(String, Value)>) -> Self {
        Value::object(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(value) => {
                Value::Number(value.as_f64().unwrap_or(f64::NAN))
            }
            serde_json::Value::String(value) => Value::String(value),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// A single-shot asynchronous value
///
/// A deferred either *resolves* to a [`Value`] which is then encoded in its
/// place, or is *rejected* with an error which destroys the encoder. While the
/// deferred is pending, its slot in the document stays open: siblings are not
/// advanced, so the positional order of the output is preserved.
///
/// The handle is cheaply cloneable. Once resolved, the resolution is cached and
/// every later submission of the same handle encodes the cached value again.
#[derive(Clone)]
pub struct Deferred {
    slot: Arc<Mutex<DeferredSlot>>,
}

enum DeferredSlot {
    Pending(BoxFuture<'static, Result<Value, SourceError>>),
    Claimed,
    Resolved(Value),
}

impl Deferred {
    /// Creates a deferred value from a future
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, SourceError>> + Send + 'static,
    {
        Deferred {
            slot: Arc::new(Mutex::new(DeferredSlot::Pending(future.boxed()))),
        }
    }

    /// Takes the future out of the slot, or a ready future for a cached resolution
    ///
    /// Returns `None` if the future is currently claimed by another consumer.
    pub(crate) fn claim(&self) -> Option<BoxFuture<'static, Result<Value, SourceError>>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *slot, DeferredSlot::Claimed) {
            DeferredSlot::Pending(future) => Some(future),
            DeferredSlot::Resolved(value) => {
                let ready = future::ready(Ok(value.clone())).boxed();
                *slot = DeferredSlot::Resolved(value);
                Some(ready)
            }
            DeferredSlot::Claimed => None,
        }
    }

    /// Caches a completed resolution
    pub(crate) fn settle(&self, value: Value) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = DeferredSlot::Resolved(value);
    }
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let state = match &*slot {
            DeferredSlot::Pending(_) => "pending",
            DeferredSlot::Claimed => "claimed",
            DeferredSlot::Resolved(_) => "resolved",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

/// State of a shared stream slot when a frame tries to take the stream out
pub(crate) enum StreamClaim<S> {
    /// The stream was idle and is now owned by the caller
    Stream(S),
    /// The stream is already being consumed
    AlreadyClaimed,
    /// The stream was already exhausted
    Ended,
}

/// Shared single-consumer slot for a stream source
///
/// `Idle -> Claimed -> Ended`; submitting a claimed source is refused
/// deterministically instead of probing the stream by side-effect.
struct SharedSlot<S> {
    inner: Arc<Mutex<Slot<S>>>,
}

enum Slot<S> {
    Idle(S),
    Claimed,
    Ended,
}

impl<S> Clone for SharedSlot<S> {
    fn clone(&self) -> Self {
        SharedSlot {
            inner: self.inner.clone(),
        }
    }
}

impl<S> SharedSlot<S> {
    fn new(stream: S) -> Self {
        SharedSlot {
            inner: Arc::new(Mutex::new(Slot::Idle(stream))),
        }
    }

    fn claim(&self) -> StreamClaim<S> {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *slot, Slot::Claimed) {
            Slot::Idle(stream) => StreamClaim::Stream(stream),
            Slot::Claimed => StreamClaim::AlreadyClaimed,
            Slot::Ended => {
                *slot = Slot::Ended;
                StreamClaim::Ended
            }
        }
    }

    fn mark_ended(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Slot::Ended;
    }

    fn state_name(&self) -> &'static str {
        let slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            Slot::Idle(_) => "idle",
            Slot::Claimed => "claimed",
            Slot::Ended => "ended",
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// An incremental source of values, encoded as the elements of a JSON array
///
/// The encoder reads the stream in pull mode: one record per state machine step,
/// suspending while no record is available. A stream which ends without ever
/// producing a record still encodes as `[]` because the opening bracket is
/// written when the stream is submitted.
///
/// The handle is cheaply cloneable, but the underlying stream has a single
/// consumer: submitting a handle whose stream is already being consumed fails
/// with [`EncodeError::StreamStateInvalid`](crate::encoder::EncodeError::StreamStateInvalid),
/// and submitting an exhausted handle fails with
/// [`EncodeError::StreamEnded`](crate::encoder::EncodeError::StreamEnded).
#[derive(Clone)]
pub struct RecordStream {
    slot: SharedSlot<BoxStream<'static, Result<Value, SourceError>>>,
}

impl RecordStream {
    /// Creates a record stream value from a stream of values
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, SourceError>> + Send + 'static,
    {
        RecordStream {
            slot: SharedSlot::new(stream.boxed()),
        }
    }

    pub(crate) fn claim(&self) -> StreamClaim<BoxStream<'static, Result<Value, SourceError>>> {
        self.slot.claim()
    }

    pub(crate) fn mark_ended(&self) {
        self.slot.mark_ended();
    }

    pub(crate) fn id(&self) -> usize {
        self.slot.id()
    }
}

impl Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("state", &self.slot.state_name())
            .finish()
    }
}

/// An incremental source of text fragments, spliced into the output verbatim
///
/// No escaping or validation is applied; the producer is responsible for the
/// fragments forming valid JSON in the position the stream occupies.
///
/// The single-consumer rules of [`RecordStream`] apply here as well.
#[derive(Clone)]
pub struct ByteStream {
    slot: SharedSlot<BoxStream<'static, Result<String, SourceError>>>,
}

impl ByteStream {
    /// Creates a byte stream value from a stream of text fragments
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<String, SourceError>> + Send + 'static,
    {
        ByteStream {
            slot: SharedSlot::new(stream.boxed()),
        }
    }

    pub(crate) fn claim(&self) -> StreamClaim<BoxStream<'static, Result<String, SourceError>>> {
        self.slot.claim()
    }

    pub(crate) fn mark_ended(&self) {
        self.slot.mark_ended();
    }
}

impl Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("state", &self.slot.state_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn from_conversions() {
        assert!(matches!(Value::from("a"), Value::String(s) if s == "a"));
        assert!(matches!(Value::from(true), Value::Bool(true)));
        assert!(matches!(Value::from(1_u8), Value::Number(n) if n == 1.0));
        assert!(matches!(Value::from(-1_i64), Value::Number(n) if n == -1.0));
        assert!(matches!(Value::from(1.5_f64), Value::Number(n) if n == 1.5));
    }

    #[test]
    fn from_serde_json() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a":[1,true,null,"x"]}"#).unwrap();
        let value = Value::from(json);

        let entries = match value {
            Value::Object(entries) => entries,
            v => panic!("Unexpected value: {v:?}"),
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a");
        assert!(matches!(&entries[0].1, Value::Array(items) if items.len() == 4));
    }

    #[test]
    fn stream_slot_states() {
        let records = RecordStream::new(stream::iter(vec![Ok(Value::Null)]));

        let stream = match records.claim() {
            StreamClaim::Stream(stream) => stream,
            _ => panic!("Should have claimed the stream"),
        };
        assert!(matches!(records.claim(), StreamClaim::AlreadyClaimed));

        drop(stream);
        records.mark_ended();
        assert!(matches!(records.claim(), StreamClaim::Ended));
    }

    #[test]
    fn deferred_resolution_is_cached() {
        let deferred = Deferred::new(future::ready(Ok(Value::Bool(true))));

        let future = deferred.claim().expect("future should be claimable");
        assert!(deferred.claim().is_none());

        let value = futures::executor::block_on(future).unwrap();
        deferred.settle(value);

        // Cached resolution can be claimed again, by several consumers
        for _ in 0..2 {
            let future = deferred.claim().expect("cached resolution");
            let value = futures::executor::block_on(future).unwrap();
            assert!(matches!(value, Value::Bool(true)));
        }
    }
}
