//! Per-connection request pipeline.
//!
//! Requests are read, throttled, admitted and dispatched strictly one after
//! another. Once a request is dispatched its completion runs as a background
//! task under the connection's gate, so many requests can be processed at
//! once; the [`ResponseReorderBuffer`] puts their responses back in request
//! order.
//!
//! ```text
//! read size -> [legacy auth] -> read header -> throttle -> memory -> slot
//!           -> read body -> dispatch --spawn--> response -> reorder -> drain
//! ```

pub mod auth_v0;
pub mod reorder;
pub mod session;

pub use reorder::{ReorderQueue, ResponseReorderBuffer, ResponseSlot};
pub use session::{RequestTracker, SessionResources};

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::admission::{default_memory_estimate, AdmissionController};
use crate::error::{IngressError, Result};
use crate::handlers::{ProcessResult, RequestContext, RequestDispatcher, Response};
use crate::metrics::IngressMetrics;
use crate::network::codec::{read_header, read_size, OutboundFrame, RequestHeader, LENGTH_PREFIX_LEN};
use crate::network::{Connection, ConnectionInput};

/// What the loop does after one cycle.
enum Flow {
    Continue,
    Stop,
}

/// The read/dispatch loop of one connection.
pub struct RequestPipeline {
    conn: Arc<Connection>,
    input: ConnectionInput,
    dispatcher: Arc<dyn RequestDispatcher>,
    admission: Arc<AdmissionController>,
    metrics: Arc<IngressMetrics>,
    responses: Arc<ResponseReorderBuffer>,
    next_sequence: u64,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        conn: Arc<Connection>,
        input: ConnectionInput,
        dispatcher: Arc<dyn RequestDispatcher>,
        admission: Arc<AdmissionController>,
        metrics: Arc<IngressMetrics>,
    ) -> Self {
        let responses = Arc::new(ResponseReorderBuffer::new(Arc::clone(&metrics)));
        Self {
            conn,
            input,
            dispatcher,
            admission,
            metrics,
            responses,
            next_sequence: 0,
        }
    }

    /// Run until EOF, abort or a fatal error. Fatal errors shut down the
    /// connection's input; in-flight responses are left to drain.
    #[instrument(
        name = "pipeline",
        skip_all,
        fields(connection_id = self.conn.id(), peer = %self.conn.peer_addr())
    )]
    pub async fn run(mut self) {
        while !self.conn.is_aborted() {
            match self.process_one().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    if e.is_disconnect() {
                        info!(error = %e, "client disconnected");
                    } else {
                        warn!(error = %e, "closing connection");
                    }
                    self.conn.shutdown_input();
                    break;
                }
            }
        }
        debug!(dispatched = self.next_sequence, "pipeline stopped");
    }

    async fn process_one(&mut self) -> Result<Flow> {
        let abort = self.conn.abort_token().clone();

        let size = tokio::select! {
            biased;
            () = abort.cancelled() => return Ok(Flow::Stop),
            size = read_size(&mut self.input) => size?,
        };
        let Some(size) = size else {
            debug!("client closed connection");
            return Ok(Flow::Stop);
        };

        if self.conn.auth().needs_v0_framing() {
            let written =
                auth_v0::exchange(&self.conn, &mut self.input, size, self.dispatcher.as_ref())
                    .await?;
            self.metrics.record_bytes_received(LENGTH_PREFIX_LEN + size);
            self.metrics.record_bytes_sent(written);
            return Ok(Flow::Continue);
        }

        let header = tokio::select! {
            () = abort.cancelled() => return Ok(Flow::Stop),
            header = read_header(&mut self.input, size) => header,
        };
        let header = match header {
            Ok(header) => header,
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                self.metrics.corrupted_headers.inc();
                return Err(IngressError::HeaderCorrupted {
                    peer: self.conn.peer_addr(),
                    message: e.to_string(),
                });
            }
        };
        trace!(
            api_key = header.api_key,
            api_version = header.api_version,
            correlation_id = header.correlation_id,
            size,
            "request header read"
        );

        let throttle = self.admission.throttle(header.client_id.as_deref(), size);
        let delay = throttle.effective();
        if !delay.is_zero() {
            debug!(client_id = ?header.client_id, ?delay, "throttling request");
            tokio::select! {
                () = abort.cancelled() => return Ok(Flow::Stop),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let Some(memory) = self.reserve_memory(&header, size).await? else {
            return Ok(Flow::Stop);
        };
        let slot = tokio::select! {
            () = abort.cancelled() => return Ok(Flow::Stop),
            slot = self.admission.budgets().acquire_slot() => slot?,
        };
        let tracker = RequestTracker::new(Arc::clone(&self.metrics), api_label(&header));
        let resources = SessionResources::new(throttle.delay, memory, slot, tracker);

        if self.conn.is_aborted() {
            return Ok(Flow::Stop);
        }

        let remaining = size.saturating_sub(header.encoded_len());
        let mut body = BytesMut::zeroed(remaining);
        tokio::select! {
            () = abort.cancelled() => return Ok(Flow::Stop),
            read = self.input.read_exact(&mut body) => { read?; }
        }
        self.metrics.record_bytes_received(LENGTH_PREFIX_LEN + size);

        if self.conn.is_aborted() {
            return Ok(Flow::Stop);
        }

        let sequence_id = self.next_sequence;
        self.next_sequence += 1;

        let correlation_id = header.correlation_id;
        let api_key = header.api_key;
        let ctx = RequestContext::new(
            Arc::clone(&self.conn),
            header,
            body.freeze(),
            throttle.delay,
            Some(sequence_id),
        );
        let ProcessResult {
            dispatched,
            response,
        } = self.dispatcher.dispatch(ctx);

        if let Err(e) = dispatched.await {
            self.metrics.service_errors.inc();
            warn!(api_key, correlation_id, sequence_id, error = %e, "request dispatch failed");
            return Err(e);
        }

        let conn = Arc::clone(&self.conn);
        let responses = Arc::clone(&self.responses);
        let metrics = Arc::clone(&self.metrics);
        self.conn.spawn_in_gate(async move {
            match response.await {
                Ok(response) => {
                    let frame = match response {
                        Response::Payload(body) => Some(OutboundFrame::Response {
                            correlation_id,
                            body,
                        }),
                        Response::Noop => None,
                    };
                    responses.insert(sequence_id, ResponseSlot::new(frame, resources));
                    responses.drain(&conn).await;
                }
                Err(e) => {
                    resources.release();
                    if e.is_disconnect() {
                        info!(
                            connection_id = conn.id(),
                            correlation_id,
                            sequence_id,
                            error = %e,
                            "disconnected while processing request"
                        );
                    } else {
                        metrics.service_errors.inc();
                        error!(
                            connection_id = conn.id(),
                            api_key,
                            correlation_id,
                            sequence_id,
                            error = %e,
                            "request processing failed"
                        );
                    }
                    conn.shutdown_input();
                }
            }
        })?;

        Ok(Flow::Continue)
    }

    /// Reserve memory for the request. `Ok(None)` means the connection was
    /// aborted while waiting.
    async fn reserve_memory(
        &self,
        header: &RequestHeader,
        size: usize,
    ) -> Result<Option<OwnedSemaphorePermit>> {
        let budgets = self.admission.budgets();
        let estimate = self
            .dispatcher
            .memory_estimate(header, size)
            .unwrap_or_else(|| default_memory_estimate(size));

        if let Err(e) = budgets.check_estimate(estimate) {
            self.metrics.oversized_requests.inc();
            return Err(e.into());
        }

        let units = budgets.memory_units(estimate);
        if let Some(permit) = budgets.try_acquire_memory(units)? {
            return Ok(Some(permit));
        }

        self.metrics.waiting_for_memory.inc();
        trace!(units, available = budgets.available_memory(), "waiting for memory");
        let abort = self.conn.abort_token();
        tokio::select! {
            () = abort.cancelled() => Ok(None),
            permit = budgets.acquire_memory(units) => Ok(Some(permit?)),
        }
    }
}

/// Metrics label for the request's API.
fn api_label(header: &RequestHeader) -> String {
    header
        .api()
        .map_or_else(|| header.api_key.to_string(), |api| format!("{api:?}"))
}
