//! Kafka wire framing.
//!
//! Requests are read incrementally straight off the socket: the 4-byte
//! big-endian size first, then the request header, and only after admission
//! the remaining body bytes. Responses go out through [`ResponseEncoder`] as
//! a length prefix, the correlation id and the body.
//!
//! Request header layout:
//! - 2 bytes: API key
//! - 2 bytes: API version
//! - 4 bytes: correlation ID
//! - nullable string (i16 length, -1 for null): client ID (header v1+)
//! - tagged fields (header v2+, flexible versions)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::ApiKey;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{IngressError, Result};

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Bytes of the fixed header fields: api key, version, correlation id.
const FIXED_HEADER_LEN: usize = 8;

fn decode_err(message: impl Into<String>) -> IngressError {
    IngressError::ProtocolDecode {
        message: message.into(),
    }
}

/// Read the size prefix of the next frame.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
///
/// # Errors
///
/// Returns an error on I/O failure or a negative size, which means the
/// stream is out of sync.
pub async fn read_size<R>(reader: &mut R) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let size = match reader.read_i32().await {
        Ok(size) => size,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    usize::try_from(size)
        .map(Some)
        .map_err(|_| decode_err(format!("negative frame size {size}")))
}

/// Parsed request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Raw API key. May not name a known API.
    pub api_key: i16,
    pub api_version: i16,
    /// Client-chosen id echoed in the response. May repeat.
    pub correlation_id: i32,
    pub client_id: Option<String>,
    /// Header version the key/version pair implies (0, 1 or 2).
    pub header_version: i16,
    /// Bytes occupied by the tagged-field section, zero before header v2.
    pub tags_size_bytes: usize,
}

impl RequestHeader {
    /// Known API for this key, if any.
    #[must_use]
    pub fn api(&self) -> Option<ApiKey> {
        ApiKey::try_from(self.api_key).ok()
    }

    /// Whether this request uses a flexible (tagged-field) header.
    #[must_use]
    pub fn is_flexible(&self) -> bool {
        self.header_version >= 2
    }

    /// Bytes this header occupied on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let client_id = if self.header_version >= 1 {
            2 + self.client_id.as_ref().map_or(0, String::len)
        } else {
            0
        };
        FIXED_HEADER_LEN + client_id + self.tags_size_bytes
    }

    /// Append the header to `buf` in wire form, with an empty tag section
    /// for flexible versions.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        if self.header_version >= 1 {
            match &self.client_id {
                Some(id) => {
                    buf.put_i16(id.len() as i16);
                    buf.put_slice(id.as_bytes());
                }
                None => buf.put_i16(-1),
            }
        }
        if self.is_flexible() {
            buf.put_u8(0);
        }
    }
}

/// Header version used by `api_key`/`api_version`. Unknown keys are parsed
/// as v1 and rejected later by dispatch.
#[must_use]
pub fn request_header_version(api_key: i16, api_version: i16) -> i16 {
    ApiKey::try_from(api_key).map_or(1, |key| key.request_header_version(api_version))
}

/// Bounded reader that refuses to consume more than the declared frame.
struct HeaderReader<'a, R> {
    reader: &'a mut R,
    consumed: usize,
    limit: usize,
}

impl<R: AsyncRead + Unpin> HeaderReader<'_, R> {
    fn reserve(&mut self, n: usize) -> Result<()> {
        if self.consumed + n > self.limit {
            return Err(decode_err(format!(
                "request header exceeds frame size {}",
                self.limit
            )));
        }
        self.consumed += n;
        Ok(())
    }

    async fn i16(&mut self) -> Result<i16> {
        self.reserve(2)?;
        Ok(self.reader.read_i16().await?)
    }

    async fn i32(&mut self) -> Result<i32> {
        self.reserve(4)?;
        Ok(self.reader.read_i32().await?)
    }

    async fn u8(&mut self) -> Result<u8> {
        self.reserve(1)?;
        Ok(self.reader.read_u8().await?)
    }

    async fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.reserve(n)?;
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn skip(&mut self, n: usize) -> Result<()> {
        self.reserve(n)?;
        let mut limited = (&mut *self.reader).take(n as u64);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if copied != n as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    async fn unsigned_varint(&mut self) -> Result<u32> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.u8().await?;
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(decode_err("unsigned varint longer than 5 bytes"))
    }
}

/// Read a request header from a frame of `size` bytes.
///
/// # Errors
///
/// Returns an error if the stream ends early, the header does not fit in
/// the frame, or the client id is not valid UTF-8.
pub async fn read_header<R>(reader: &mut R, size: usize) -> Result<RequestHeader>
where
    R: AsyncRead + Unpin,
{
    let mut r = HeaderReader {
        reader,
        consumed: 0,
        limit: size,
    };

    let api_key = r.i16().await?;
    let api_version = r.i16().await?;
    let correlation_id = r.i32().await?;
    let header_version = request_header_version(api_key, api_version);

    let client_id = if header_version >= 1 {
        let len = r.i16().await?;
        match usize::try_from(len) {
            Ok(len) => {
                let raw = r.bytes(len).await?;
                Some(String::from_utf8(raw).map_err(|_| decode_err("client id is not UTF-8"))?)
            }
            Err(_) if len == -1 => None,
            Err(_) => return Err(decode_err(format!("invalid client id length {len}"))),
        }
    } else {
        None
    };

    let mut tags_size_bytes = 0;
    if header_version >= 2 {
        let start = r.consumed;
        let count = r.unsigned_varint().await?;
        for _ in 0..count {
            let _tag = r.unsigned_varint().await?;
            let len = r.unsigned_varint().await?;
            r.skip(len as usize).await?;
        }
        tags_size_bytes = r.consumed - start;
    }

    Ok(RequestHeader {
        api_key,
        api_version,
        correlation_id,
        client_id,
        header_version,
        tags_size_bytes,
    })
}

/// A frame written back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Regular response: correlation id followed by the body.
    Response { correlation_id: i32, body: Bytes },
    /// Length-prefixed payload without a correlation id (legacy SASL tokens).
    Raw(Bytes),
}

impl OutboundFrame {
    /// Bytes after the length prefix.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Response { body, .. } => 4 + body.len(),
            Self::Raw(bytes) => bytes.len(),
        }
    }
}

/// Encoder for [`OutboundFrame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseEncoder;

impl Encoder<OutboundFrame> for ResponseEncoder {
    type Error = std::io::Error;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> std::io::Result<()> {
        let len = item.payload_len();
        let len = u32::try_from(len).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("response of {len} bytes does not fit the length prefix"),
            )
        })?;

        dst.reserve(LENGTH_PREFIX_LEN + len as usize);
        dst.put_u32(len);
        match item {
            OutboundFrame::Response {
                correlation_id,
                body,
            } => {
                dst.put_i32(correlation_id);
                dst.extend_from_slice(&body);
            }
            OutboundFrame::Raw(bytes) => dst.extend_from_slice(&bytes),
        }
        Ok(())
    }
}

/// A response as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: i32,
    pub body: BytesMut,
}

/// Client-side decoder for response frames.
#[derive(Debug, Clone)]
pub struct ResponseDecoder {
    max_frame_size: usize,
}

impl ResponseDecoder {
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(100 * 1024 * 1024)
    }
}

impl Decoder for ResponseDecoder {
    type Item = ResponseFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<ResponseFrame>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame size {length} exceeds maximum {}", self.max_frame_size),
            ));
        }
        if length < 4 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too small for correlation id",
            ));
        }

        if src.len() < LENGTH_PREFIX_LEN + length {
            src.reserve(LENGTH_PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut frame = src.split_to(length);
        let correlation_id = frame.get_i32();

        Ok(Some(ResponseFrame {
            correlation_id,
            body: frame,
        }))
    }
}
