//! Minimal Kafka-framing client for integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::ApiKey;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::network::codec::{request_header_version, RequestHeader, ResponseFrame};

/// Transport under the test client: plain TCP or TLS.
trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

/// Client speaking raw length-prefixed frames.
pub struct KafkaTestClient {
    stream: Box<dyn ClientIo>,
    client_id: Option<String>,
}

impl KafkaTestClient {
    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_io(Box::new(stream)))
    }

    /// Connect to `addr` and complete a TLS handshake using `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_tls(addr: SocketAddr, config: Arc<ClientConfig>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let server_name = ServerName::try_from("localhost")
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = TlsConnector::from(config).connect(server_name, stream).await?;
        Ok(Self::from_io(Box::new(stream)))
    }

    fn from_io(stream: Box<dyn ClientIo>) -> Self {
        Self {
            stream,
            client_id: Some("test-client".to_string()),
        }
    }

    /// Client id sent in request headers.
    #[must_use]
    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        self.client_id = client_id.map(str::to_string);
        self
    }

    /// Encode a request frame without sending it.
    #[must_use]
    pub fn encode_request(
        &self,
        api: ApiKey,
        api_version: i16,
        correlation_id: i32,
        body: &[u8],
    ) -> Bytes {
        let api_key = api as i16;
        let header_version = request_header_version(api_key, api_version);
        let header = RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id: self.client_id.clone(),
            header_version,
            tags_size_bytes: usize::from(header_version >= 2),
        };

        let mut payload = BytesMut::new();
        header.encode(&mut payload);
        payload.put_slice(body);

        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send(
        &mut self,
        api: ApiKey,
        api_version: i16,
        correlation_id: i32,
        body: &[u8],
    ) -> io::Result<()> {
        let frame = self.encode_request(api, api_version, correlation_id, body);
        self.write_bytes(&frame).await
    }

    /// Send a length-prefixed payload with no request header.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send_raw(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        self.write_bytes(&frame).await
    }

    /// Write bytes exactly as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read one length-prefixed payload.
    ///
    /// # Errors
    ///
    /// Returns an error on EOF or read failure.
    pub async fn recv_raw(&mut self) -> io::Result<Bytes> {
        let len = self.stream.read_u32().await? as usize;
        let mut payload = BytesMut::zeroed(len);
        self.stream.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }

    /// Read one response.
    ///
    /// # Errors
    ///
    /// Returns an error on EOF, read failure or a frame too short for a
    /// correlation id.
    pub async fn recv(&mut self) -> io::Result<ResponseFrame> {
        let mut payload = BytesMut::from(&self.recv_raw().await?[..]);
        if payload.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response frame too small for correlation id",
            ));
        }
        let correlation_id = payload.get_i32();
        Ok(ResponseFrame {
            correlation_id,
            body: payload,
        })
    }

    /// [`recv`](Self::recv) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::TimedOut`] if nothing arrives in time.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> io::Result<ResponseFrame> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no response"))?
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn request(
        &mut self,
        api: ApiKey,
        api_version: i16,
        correlation_id: i32,
        body: &[u8],
    ) -> io::Result<ResponseFrame> {
        self.send(api, api_version, correlation_id, body).await?;
        self.recv().await
    }

    /// Whether the server closed the connection within `timeout` without
    /// sending anything further.
    pub async fn is_closed_within(&mut self, timeout: Duration) -> bool {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(timeout, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}
