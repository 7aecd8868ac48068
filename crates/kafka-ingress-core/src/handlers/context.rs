//! Request context handed to handlers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::ApiKey;

use crate::network::codec::RequestHeader;
use crate::network::Connection;

/// Everything a handler needs to process one request.
///
/// Carries the shared connection so handlers can inspect the peer and
/// drive its authentication state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    connection: Arc<Connection>,
    header: RequestHeader,
    body: Bytes,
    throttle_delay: Duration,
    sequence_id: Option<u64>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        header: RequestHeader,
        body: Bytes,
        throttle_delay: Duration,
        sequence_id: Option<u64>,
    ) -> Self {
        Self {
            connection,
            header,
            body,
            throttle_delay,
            sequence_id,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    #[must_use]
    pub fn api(&self) -> Option<ApiKey> {
        self.header.api()
    }

    #[must_use]
    pub fn api_version(&self) -> i16 {
        self.header.api_version
    }

    #[must_use]
    pub fn correlation_id(&self) -> i32 {
        self.header.correlation_id
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.header.client_id.as_deref()
    }

    /// Request body after the header.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Throttle delay the pipeline applied (or deferred) for this request,
    /// for reporting back as `throttle_time_ms`.
    #[must_use]
    pub fn throttle_delay(&self) -> Duration {
        self.throttle_delay
    }

    /// Position of this request in the connection's response order.
    /// `None` for the synthetic legacy-auth exchange, which is not pipelined.
    #[must_use]
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }
}
