//! Native-messaging bridge wire layer.
//!
//! Both peers of the bridge speak the same framing: a 4-byte native-order length
//! prefix followed by a UTF-8 JSON payload.
//!
//! # Architecture
//!
//! - **protocol**: Message types (extension envelopes, broker requests/replies)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
