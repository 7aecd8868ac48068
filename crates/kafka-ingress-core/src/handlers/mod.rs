//! Request dispatch.
//!
//! The pipeline talks to request processing through [`RequestDispatcher`].
//! Dispatch is two-stage: `dispatched` resolves once the request has been
//! validated and scheduled, `response` once it has been processed. The
//! pipeline waits for `dispatched` before reading the next request, so
//! handlers see requests in arrival order, while `response` futures complete
//! in any order and are reordered on the way out.
//!
//! [`HandlerRegistry`] is the stock dispatcher: one [`ProtocolHandler`] per
//! API key plus a built-in ApiVersions handler advertising what is
//! registered.

pub mod api_versions;
pub mod context;

pub use api_versions::ApiVersionsHandler;
pub use context::RequestContext;

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use kafka_protocol::messages::ApiKey;
use tokio::sync::oneshot;

use crate::error::{IngressError, Result};
use crate::network::codec::RequestHeader;

/// Outcome of processing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response body, written after the correlation id.
    Payload(Bytes),
    /// Nothing is written (e.g. Produce with acks=0). Still consumes its
    /// place in the response order.
    Noop,
}

/// The two futures a dispatch produces.
pub struct ProcessResult {
    /// Resolves once the request has been validated and scheduled.
    pub dispatched: BoxFuture<'static, Result<()>>,
    /// Resolves to the response once processing finished.
    pub response: BoxFuture<'static, Result<Response>>,
}

impl ProcessResult {
    /// Both stages fail with `err`.
    #[must_use]
    pub fn failed(err: IngressError) -> Self {
        let message = err.to_string();
        Self {
            dispatched: future::ready(Err(err)).boxed(),
            response: future::ready(Err(IngressError::Dispatch(message))).boxed(),
        }
    }
}

/// Hands requests to processing.
pub trait RequestDispatcher: Send + Sync {
    /// Memory the request will need while in flight. `None` falls back to
    /// the generic size-based estimate.
    fn memory_estimate(&self, header: &RequestHeader, request_size: usize) -> Option<usize>;

    /// Start processing a request.
    fn dispatch(&self, ctx: RequestContext) -> ProcessResult;
}

/// Handler for one API key.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Memory estimate for a request of `request_size` bytes.
    fn memory_estimate(&self, _request_size: usize) -> Option<usize> {
        None
    }

    /// First stage. Runs before the next request on the connection is read.
    async fn validate(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    /// Second stage. Produces the response.
    async fn handle(&self, ctx: RequestContext) -> Result<Response>;
}

/// Supported version range per registered API key.
pub(crate) type VersionTable = Arc<RwLock<BTreeMap<i16, RangeInclusive<i16>>>>;

struct Registered {
    handler: Arc<dyn ProtocolHandler>,
    versions: RangeInclusive<i16>,
}

/// Dispatcher routing requests to a [`ProtocolHandler`] per API key.
pub struct HandlerRegistry {
    handlers: HashMap<i16, Registered>,
    versions: VersionTable,
}

impl HandlerRegistry {
    /// Registry with only the ApiVersions handler.
    #[must_use]
    pub fn new() -> Self {
        let versions: VersionTable = Arc::default();
        let mut registry = Self {
            handlers: HashMap::new(),
            versions: Arc::clone(&versions),
        };
        registry.register(
            ApiKey::ApiVersions,
            api_versions::SUPPORTED_VERSIONS,
            ApiVersionsHandler::new(versions),
        );
        registry
    }

    /// Register `handler` for `api` at `versions`, replacing any previous one.
    pub fn register<H>(&mut self, api: ApiKey, versions: RangeInclusive<i16>, handler: H) -> &mut Self
    where
        H: ProtocolHandler + 'static,
    {
        self.register_arc(api, versions, Arc::new(handler))
    }

    /// [`register`](Self::register) for a shared handler.
    pub fn register_arc(
        &mut self,
        api: ApiKey,
        versions: RangeInclusive<i16>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> &mut Self {
        let key = api as i16;
        self.versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, versions.clone());
        self.handlers.insert(key, Registered { handler, versions });
        self
    }

    /// Registered API keys with their version ranges.
    #[must_use]
    pub fn supported(&self) -> Vec<(i16, RangeInclusive<i16>)> {
        self.versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn lookup(&self, header: &RequestHeader) -> Option<&Registered> {
        self.handlers.get(&header.api_key)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDispatcher for HandlerRegistry {
    fn memory_estimate(&self, header: &RequestHeader, request_size: usize) -> Option<usize> {
        self.lookup(header)
            .and_then(|r| r.handler.memory_estimate(request_size))
    }

    fn dispatch(&self, ctx: RequestContext) -> ProcessResult {
        let header = ctx.header();
        let Some(registered) = self.lookup(header) else {
            return ProcessResult::failed(IngressError::UnsupportedApi {
                api_key: header.api_key,
                api_version: header.api_version,
            });
        };
        // ApiVersions answers unsupported versions itself.
        if header.api_key != ApiKey::ApiVersions as i16
            && !registered.versions.contains(&header.api_version)
        {
            return ProcessResult::failed(IngressError::UnsupportedApi {
                api_key: header.api_key,
                api_version: header.api_version,
            });
        }

        let handler = Arc::clone(&registered.handler);
        let (tx, rx) = oneshot::channel();

        let validator = Arc::clone(&handler);
        let dispatched = async move {
            validator.validate(&ctx).await?;
            // The receiver is gone only if the response future was dropped.
            let _ = tx.send(ctx);
            Ok(())
        }
        .boxed();

        let response = async move {
            let ctx = rx
                .await
                .map_err(|_| IngressError::Dispatch("request was never scheduled".to_string()))?;
            handler.handle(ctx).await
        }
        .boxed();

        ProcessResult {
            dispatched,
            response,
        }
    }
}
