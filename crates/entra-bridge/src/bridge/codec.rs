//! Framed codec for native messaging and broker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (stdio, pipes, in-memory duplex).
//!
//! The length prefix is a 4-byte unsigned integer in native byte order, which is
//! what browsers and the broker both expect. No size ceiling is enforced here beyond
//! what fits in the prefix; the browser host enforces its own.

use std::io;
use std::marker::PhantomData;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};

/// Width of the frame length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors raised while framing or parsing a message.
///
/// Any of these on the inbound extension stream means the stream position can no
/// longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended inside a length prefix or payload.
    #[error("stream closed mid-frame ({remaining} bytes of an incomplete frame buffered)")]
    Truncated { remaining: usize },

    /// Payload was not valid UTF-8 JSON of the expected shape.
    #[error("invalid frame payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .max_frame_length(u32::MAX as usize)
                .native_endian()
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

fn declared_len(src: &[u8]) -> usize {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
    u32::from_ne_bytes(prefix) as usize
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Only hand complete frames to the inner codec. It consumes the prefix as soon
        // as it has seen it, which would hide a truncated payload from decode_eof.
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let frame_len = LENGTH_PREFIX_LEN + declared_len(src);
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        match self.inner.decode(src)? {
            Some(bytes) => {
                tracing::trace!(json_size_bytes = bytes.len(), "Decoded frame");
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                remaining: src.len(),
            }),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

/// Read the next message from a framed stream.
///
/// `Ok(None)` means the peer closed the stream on a frame boundary.
pub async fn decode_next<R, T>(
    reader: &mut FramedRead<R, JsonCodec<T>>,
) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    reader.next().await.transpose()
}

/// Encode a single message into a complete frame (prefix + compact JSON).
pub fn encode_frame<T: Serialize>(message: T) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    JsonCodec::<T>::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one frame from a fully buffered byte slice.
///
/// Bytes following the frame are ignored.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    let mut buf = BytesMut::from(bytes);
    let item = JsonCodec::<T>::new().decode_eof(&mut buf)?;
    if !buf.is_empty() {
        tracing::debug!(trailing_bytes = buf.len(), "Ignoring bytes after frame");
    }
    // An empty slice decodes to nothing at all, which for a single expected frame is
    // as truncated as it gets.
    item.ok_or(FrameError::Truncated { remaining: 0 })
}

/// Write one message and flush it.
///
/// Callers sharing a writer must hold its lock across this call so frames never
/// interleave.
pub async fn send<W, T>(
    writer: &mut FramedWrite<W, JsonCodec<T>>,
    message: T,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.send(message).await
}
