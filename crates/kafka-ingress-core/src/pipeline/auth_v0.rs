//! Legacy SASL framing.
//!
//! A client that negotiated with SaslHandshake v0 sends its SASL tokens as
//! bare length-prefixed payloads rather than SaslAuthenticate requests. The
//! pipeline hands such payloads here: the token is wrapped in a synthetic
//! SaslAuthenticate v0 request, processed one-shot through the dispatcher,
//! and the resulting token is written back bare. No sequence id is
//! consumed.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, SaslAuthenticateRequest, SaslAuthenticateResponse};
use kafka_protocol::protocol::{Decodable, Encodable};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::auth::SaslState;
use crate::error::{IngressError, Result};
use crate::handlers::{RequestContext, RequestDispatcher, Response};
use crate::network::codec::{request_header_version, OutboundFrame, RequestHeader};
use crate::network::{Connection, ConnectionInput};

/// Largest raw token accepted.
pub const MAX_AUTH_PAYLOAD: usize = 256 * 1024;

/// SaslAuthenticate version the synthetic exchange uses.
const ENVELOPE_VERSION: i16 = 0;

/// Run one legacy token exchange for a frame of `size` bytes.
///
/// # Errors
///
/// Every error is fatal for the connection: oversized token, read failure,
/// dispatch failure, a malformed or failed SaslAuthenticate response, or an
/// authentication state of `Failed` after the exchange.
pub(crate) async fn exchange(
    conn: &Arc<Connection>,
    input: &mut ConnectionInput,
    size: usize,
    dispatcher: &dyn RequestDispatcher,
) -> Result<usize> {
    if size > MAX_AUTH_PAYLOAD {
        return Err(IngressError::AuthPayloadTooLarge {
            size,
            limit: MAX_AUTH_PAYLOAD,
        });
    }

    let mut token = BytesMut::zeroed(size);
    tokio::select! {
        () = conn.abort_token().cancelled() => return Err(IngressError::Shutdown),
        read = input.read_exact(&mut token) => { read?; }
    }

    let mut request = SaslAuthenticateRequest::default();
    request.auth_bytes = token.freeze();
    let mut body = BytesMut::new();
    request
        .encode(&mut body, ENVELOPE_VERSION)
        .map_err(|e| IngressError::ProtocolEncode {
            message: e.to_string(),
        })?;

    let api_key = ApiKey::SaslAuthenticate as i16;
    let header = RequestHeader {
        api_key,
        api_version: ENVELOPE_VERSION,
        correlation_id: 0,
        client_id: None,
        header_version: request_header_version(api_key, ENVELOPE_VERSION),
        tags_size_bytes: 0,
    };
    let ctx = RequestContext::new(
        Arc::clone(conn),
        header,
        body.freeze(),
        Duration::ZERO,
        None,
    );

    let result = dispatcher.dispatch(ctx);
    result.dispatched.await?;
    let response = match result.response.await? {
        Response::Payload(bytes) => bytes,
        Response::Noop => {
            return Err(IngressError::Auth(
                "no response to legacy SASL token".to_string(),
            ))
        }
    };

    let auth_bytes = decode_response(response)?;
    if conn.auth().state() == SaslState::Failed {
        return Err(IngressError::Auth("SASL authentication failed".to_string()));
    }

    debug!(
        connection_id = conn.id(),
        token_len = auth_bytes.len(),
        state = %conn.auth().state(),
        "legacy SASL token exchanged"
    );
    conn.write(OutboundFrame::Raw(auth_bytes)).await
}

fn decode_response(mut body: Bytes) -> Result<Bytes> {
    let response = SaslAuthenticateResponse::decode(&mut body, ENVELOPE_VERSION).map_err(|e| {
        IngressError::ProtocolDecode {
            message: e.to_string(),
        }
    })?;
    if response.error_code != 0 {
        let message = response
            .error_message
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        return Err(IngressError::Auth(format!(
            "SASL authentication failed with error {}: {message}",
            response.error_code
        )));
    }
    Ok(response.auth_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::protocol::StrBytes;

    fn encode(response: &SaslAuthenticateResponse) -> Bytes {
        let mut buf = BytesMut::new();
        response.encode(&mut buf, ENVELOPE_VERSION).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_decode_success() {
        let mut response = SaslAuthenticateResponse::default();
        response.auth_bytes = Bytes::from_static(b"server-token");

        let token = decode_response(encode(&response)).unwrap();
        assert_eq!(&token[..], b"server-token");
    }

    #[test]
    fn test_decode_error_code() {
        let mut response = SaslAuthenticateResponse::default();
        response.error_code = 58;
        response.error_message = Some(StrBytes::from_static_str("bad credentials"));

        let err = decode_response(encode(&response)).unwrap_err();
        assert!(err.to_string().contains("bad credentials"));
    }

    #[test]
    fn test_decode_malformed() {
        let err = decode_response(Bytes::from_static(b"\x00")).unwrap_err();
        assert!(matches!(err, IngressError::ProtocolDecode { .. }));
    }
}
