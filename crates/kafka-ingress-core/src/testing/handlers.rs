//! Scripted handlers whose behavior and completion the test controls.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
    SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::sync::oneshot;

use crate::error::{IngressError, Result};
use crate::handlers::{ProtocolHandler, RequestContext, Response};

/// A request seen by a [`ScriptedHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
    pub sequence_id: Option<u64>,
    pub body: Bytes,
}

/// Releases a response held by [`ScriptedHandler::hold`].
pub struct Release(oneshot::Sender<()>);

impl Release {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

#[derive(Default)]
struct Script {
    held: HashMap<i32, oneshot::Receiver<()>>,
    noop: HashSet<i32>,
    fail: HashSet<i32>,
    reject: HashSet<i32>,
}

/// Echoes each request body back, unless scripted otherwise by correlation
/// id, and records every request it sees.
#[derive(Default)]
pub struct ScriptedHandler {
    calls: Mutex<Vec<HandledRequest>>,
    script: Mutex<Script>,
    memory_estimate: Option<usize>,
}

impl ScriptedHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `estimate` bytes for every request.
    #[must_use]
    pub fn with_memory_estimate(mut self, estimate: usize) -> Self {
        self.memory_estimate = Some(estimate);
        self
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keep the response to `correlation_id` pending until released.
    pub fn hold(&self, correlation_id: i32) -> Release {
        let (tx, rx) = oneshot::channel();
        self.script().held.insert(correlation_id, rx);
        Release(tx)
    }

    /// Answer `correlation_id` with a no-op.
    pub fn noop(&self, correlation_id: i32) {
        self.script().noop.insert(correlation_id);
    }

    /// Fail processing of `correlation_id` after dispatch.
    pub fn fail(&self, correlation_id: i32) {
        self.script().fail.insert(correlation_id);
    }

    /// Fail dispatch of `correlation_id`.
    pub fn reject(&self, correlation_id: i32) {
        self.script().reject.insert(correlation_id);
    }

    /// Requests seen so far, in dispatch order.
    #[must_use]
    pub fn calls(&self) -> Vec<HandledRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ProtocolHandler for ScriptedHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn memory_estimate(&self, _request_size: usize) -> Option<usize> {
        self.memory_estimate
    }

    async fn validate(&self, ctx: &RequestContext) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HandledRequest {
                api_key: ctx.header().api_key,
                api_version: ctx.api_version(),
                correlation_id: ctx.correlation_id(),
                client_id: ctx.client_id().map(str::to_string),
                sequence_id: ctx.sequence_id(),
                body: ctx.body().clone(),
            });
        if self.script().reject.contains(&ctx.correlation_id()) {
            return Err(IngressError::Dispatch(format!(
                "request {} rejected",
                ctx.correlation_id()
            )));
        }
        Ok(())
    }

    async fn handle(&self, ctx: RequestContext) -> Result<Response> {
        let correlation_id = ctx.correlation_id();
        let held = self.script().held.remove(&correlation_id);
        if let Some(rx) = held {
            let _ = rx.await;
        }

        let script = self.script();
        if script.fail.contains(&correlation_id) {
            return Err(IngressError::Dispatch(format!(
                "request {correlation_id} failed"
            )));
        }
        if script.noop.contains(&correlation_id) {
            return Ok(Response::Noop);
        }
        Ok(Response::Payload(ctx.body().clone()))
    }
}

/// Kafka `SASL_AUTHENTICATION_FAILED`.
pub const SASL_AUTHENTICATION_FAILED: i16 = 58;

/// SaslHandshake handler accepting PLAIN. A v0 handshake switches the
/// connection to raw token framing.
pub struct SaslHandshakeHandler;

#[async_trait]
impl ProtocolHandler for SaslHandshakeHandler {
    fn name(&self) -> &'static str {
        "sasl_handshake"
    }

    async fn handle(&self, ctx: RequestContext) -> Result<Response> {
        let version = ctx.api_version();
        let mut body = ctx.body().clone();
        let request = SaslHandshakeRequest::decode(&mut body, version).map_err(|e| {
            IngressError::ProtocolDecode {
                message: e.to_string(),
            }
        })?;

        let auth = ctx.connection().auth();
        auth.begin_handshake()?;

        let mut response = SaslHandshakeResponse::default();
        response.mechanisms = vec![StrBytes::from_static_str("PLAIN")];
        if &*request.mechanism == "PLAIN" {
            auth.select_mechanism("PLAIN", version == 0)?;
        } else {
            auth.fail();
            response.error_code = 33; // UNSUPPORTED_SASL_MECHANISM
        }

        let mut buf = BytesMut::new();
        response
            .encode(&mut buf, version)
            .map_err(|e| IngressError::ProtocolEncode {
                message: e.to_string(),
            })?;
        Ok(Response::Payload(buf.freeze()))
    }
}

/// SaslAuthenticate handler checking a single PLAIN user.
pub struct PlainAuthenticateHandler {
    username: String,
    password: String,
}

impl PlainAuthenticateHandler {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn check(&self, token: &[u8]) -> bool {
        let mut parts = token.split(|b| *b == 0);
        let _authzid = parts.next();
        parts.next() == Some(self.username.as_bytes())
            && parts.next() == Some(self.password.as_bytes())
            && parts.next().is_none()
    }
}

#[async_trait]
impl ProtocolHandler for PlainAuthenticateHandler {
    fn name(&self) -> &'static str {
        "sasl_authenticate"
    }

    async fn handle(&self, ctx: RequestContext) -> Result<Response> {
        let version = ctx.api_version();
        let mut body = ctx.body().clone();
        let request = SaslAuthenticateRequest::decode(&mut body, version).map_err(|e| {
            IngressError::ProtocolDecode {
                message: e.to_string(),
            }
        })?;

        let auth = ctx.connection().auth();
        let mut response = SaslAuthenticateResponse::default();
        if self.check(&request.auth_bytes) {
            auth.complete(format!("User:{}", self.username))?;
        } else {
            auth.fail();
            response.error_code = SASL_AUTHENTICATION_FAILED;
            response.error_message = Some(StrBytes::from_static_str("invalid credentials"));
        }

        let mut buf = BytesMut::new();
        response
            .encode(&mut buf, version)
            .map_err(|e| IngressError::ProtocolEncode {
                message: e.to_string(),
            })?;
        Ok(Response::Payload(buf.freeze()))
    }
}
