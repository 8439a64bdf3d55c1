#![warn(missing_docs)]
// Enable 'unused' warnings for doc tests (are disabled by default)
#![doc(test(no_crate_inject))]
#![doc(test(attr(warn(unused))))]
// Fail on warnings in doc tests
#![doc(test(attr(deny(warnings))))]

//! Fluxon is a streaming JSON encoder for in-memory value graphs which may contain
//! asynchronous sub-sources.
//!
//! Its main purpose is serializing very large or partially-asynchronous documents
//! without materializing the full textual result or the fully-resolved input graph
//! in memory. The encoder is a pull-driven byte producer: the consumer repeatedly
//! requests chunks (directly with a size hint, or through the [`futures::Stream`]
//! implementation), and the encoder runs its internal state machine only as far as
//! needed to satisfy each request. Sub-sources which are not ready yet suspend the
//! encoder until their data arrives.
//!
//! # Terminology
//!
//! - *value graph*: a [`Value`](value::Value) and everything reachable from it.
//!   Arrays and objects are shared snapshots, so the same node may appear in
//!   several places of the graph.
//! - *deferred*: a single-shot asynchronous result which resolves to a value,
//!   see [`Deferred`](value::Deferred)
//! - *record stream*: an incremental source of values, encoded as the elements
//!   of a JSON array, see [`RecordStream`](value::RecordStream)
//! - *byte stream*: an incremental source of text fragments which are spliced
//!   into the output verbatim, see [`ByteStream`](value::ByteStream)
//! - *pull*: a consumer-initiated request for up to *n* bytes of output
//!
//! # Usage examples
//!
//! ## Encoding a plain value graph
//!
//! ```
//! # use fluxon::encoder::encode_to_string;
//! # use fluxon::value::Value;
//! let value = Value::object(vec![
//!     ("a".to_owned(), 1.into()),
//!     ("b".to_owned(), Value::array(vec![true.into(), Value::Null, "x".into()])),
//! ]);
//!
//! let json = futures::executor::block_on(encode_to_string(value))?;
//! assert_eq!(json, r#"{"a":1,"b":[true,null,"x"]}"#);
//! # Ok::<(), fluxon::encoder::EncodeError>(())
//! ```
//!
//! ## Encoding asynchronous sub-sources
//!
//! Deferred values and streams are encoded transparently: the output is
//! byte-identical to encoding the eventually-produced values directly.
//!
//! ```
//! # use fluxon::encoder::encode_to_string;
//! # use fluxon::value::Value;
//! use futures::{future, stream};
//!
//! let value = Value::array(vec![
//!     Value::deferred(future::ready(Ok(1.into()))),
//!     Value::record_stream(stream::iter(vec![Ok(2.into()), Ok(3.into())])),
//! ]);
//!
//! let json = futures::executor::block_on(encode_to_string(value))?;
//! assert_eq!(json, "[1,[2,3]]");
//! # Ok::<(), fluxon::encoder::EncodeError>(())
//! ```
//!
//! ## Consuming chunks under backpressure
//!
//! ```
//! # use fluxon::encoder::{EncodeError, JsonStreamEncoder};
//! # use fluxon::value::Value;
//! let mut encoder = JsonStreamEncoder::new(Value::array(vec![1.into(), 2.into()]));
//!
//! futures::executor::block_on(async {
//!     let mut json = String::new();
//!     // Request tiny chunks; the concatenation is independent of the chunk size
//!     while let Some(chunk) = encoder.pull(2).await {
//!         json.push_str(&chunk?);
//!     }
//!     assert_eq!(json, "[1,2]");
//!     Ok::<(), EncodeError>(())
//! })?;
//! # Ok::<(), fluxon::encoder::EncodeError>(())
//! ```
//!
//! # Error handling
//!
//! All errors are fatal to the encoder instance, there is no local recovery.
//! After an error was returned the encoder is destroyed: it stops scheduling,
//! releases its stack and cycle-detection state and yields no further chunks.
//! Output emitted before the error is not retracted, so consumers must treat a
//! mid-stream error as "document invalid". See [`EncodeError`](encoder::EncodeError).

pub mod encoder;
pub mod value;
