//! Module for encoding a value graph to JSON
//!
//! [`JsonStreamEncoder`] is the pull-driven encoder; [`encode_to_string`] and
//! [`encode_to_string_with`] are convenience functions which drain an encoder
//! and concatenate its chunks.

use std::fmt::Debug;

use futures::StreamExt;
use thiserror::Error;

use crate::value::{SourceError, Value};

mod stream_encoder;
// Re-export streaming implementation under `encoder` module
pub use stream_encoder::*;

/// Error which occurred while encoding a value graph
///
/// Every error is fatal to the encoder instance: the encoder transitions to a
/// destroyed state, releases its resources and yields no further chunks. The
/// first error observed wins; output emitted before the error is not retracted.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// A container value is already open on the encoder stack
    ///
    /// The value graph contains a container which transitively contains itself,
    /// for example through a deferred resolving to one of its ancestors.
    /// Sharing the same container as *siblings* is valid; only re-entering an
    /// open container is a cycle.
    #[error("circular structure: container value is already open on the encoder stack")]
    CircularStructure,
    /// The classifier cannot place a value
    ///
    /// The data of this enum variant is a message explaining which value was
    /// not supported.
    #[error("unsupported value: {0}")]
    UnsupportedType(String),
    /// A stream source was already exhausted when it was submitted
    #[error("stream source was already exhausted when it was submitted")]
    StreamEnded,
    /// A stream source was already being consumed when it was submitted
    #[error("stream source is already claimed by another consumer")]
    StreamStateInvalid,
    /// An input stream failed
    #[error("stream source failed: {0}")]
    StreamError(#[source] SourceError),
    /// A deferred value was rejected
    #[error("deferred value was rejected: {0}")]
    DeferredRejected(#[source] SourceError),
    /// The user replacer or a [`ToJson`](crate::value::ToJson) hook failed
    #[error("replacer failed: {0}")]
    ReplacerFailure(#[source] SourceError),
}

/// User-supplied transform applied to every value before it is classified
///
/// This mirrors the two replacer shapes of `JSON.stringify`:
///
/// - [`Replacer::transform`] substitutes each submitted value. Returning
///   [`Value::Undefined`] drops object members entirely.
/// - [`Replacer::allow_list`] restricts object members to the listed keys.
///   Members are emitted in allow-list order; duplicate keys in the list are
///   ignored, and so are keys the object does not contain. Arrays are not
///   affected.
///
/// # Examples
/// ```
/// # use fluxon::encoder::{encode_to_string_with, EncoderSettings, Replacer};
/// # use fluxon::value::Value;
/// let value = Value::object(vec![
///     ("b".to_owned(), 2.into()),
///     ("a".to_owned(), 1.into()),
///     ("c".to_owned(), 3.into()),
/// ]);
///
/// let replacer = Replacer::allow_list(["a", "b"]);
/// let json = futures::executor::block_on(encode_to_string_with(
///     value,
///     Some(replacer),
///     EncoderSettings::default(),
/// ))?;
/// assert_eq!(json, r#"{"a":1,"b":2}"#);
/// # Ok::<(), fluxon::encoder::EncodeError>(())
/// ```
pub enum Replacer {
    /// A transform function, called with `(key, value)` for every submitted value
    ///
    /// `key` is the object member name, the stringified array index, or `""`
    /// for the document root.
    Transform(Box<dyn FnMut(&str, Value) -> Result<Value, SourceError> + Send>),
    /// An ordered allow-list of object member keys
    AllowList(Vec<String>),
}

impl Replacer {
    /// Creates a transform replacer from a function
    pub fn transform<F>(transform: F) -> Self
    where
        F: FnMut(&str, Value) -> Result<Value, SourceError> + Send + 'static,
    {
        Replacer::Transform(Box::new(transform))
    }

    /// Creates an allow-list replacer from an ordered list of keys
    pub fn allow_list<I>(keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Replacer::AllowList(keys.into_iter().map(Into::into).collect())
    }
}

impl Debug for Replacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Replacer::Transform(_) => f.write_str("Transform(..)"),
            Replacer::AllowList(keys) => f.debug_tuple("AllowList").field(keys).finish(),
        }
    }
}

/// Encodes a value graph with default settings and returns the complete document
///
/// This drains a [`JsonStreamEncoder`] and concatenates its chunks; it therefore
/// materializes the full document in memory and is mainly intended for small
/// documents and tests.
pub async fn encode_to_string(value: impl Into<Value>) -> Result<String, EncodeError> {
    encode_to_string_with(value, None, EncoderSettings::default()).await
}

/// Encodes a value graph with a replacer and custom settings and returns the
/// complete document
///
/// See [`encode_to_string`].
pub async fn encode_to_string_with(
    value: impl Into<Value>,
    replacer: Option<Replacer>,
    settings: EncoderSettings,
) -> Result<String, EncodeError> {
    let mut encoder = JsonStreamEncoder::new_custom(value.into(), replacer, settings);
    let mut json = String::new();
    while let Some(chunk) = encoder.next().await {
        json.push_str(&chunk?);
    }
    Ok(json)
}
