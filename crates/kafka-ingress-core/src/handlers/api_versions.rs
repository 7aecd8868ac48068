//! ApiVersions request handler.
//!
//! Answers locally with the API keys registered in the [`HandlerRegistry`],
//! so clients can probe the listener before anything else is wired up.
//!
//! [`HandlerRegistry`]: super::HandlerRegistry

use std::ops::RangeInclusive;

use async_trait::async_trait;
use bytes::BytesMut;
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::ApiVersionsResponse;
use kafka_protocol::protocol::Encodable;
use tracing::debug;

use crate::error::{IngressError, Result};

use super::{ProtocolHandler, RequestContext, Response, VersionTable};

/// ApiVersions versions this handler can encode.
pub const SUPPORTED_VERSIONS: RangeInclusive<i16> = 0..=3;

/// Kafka `UNSUPPORTED_VERSION` error code.
const UNSUPPORTED_VERSION: i16 = 35;

/// Handler for ApiVersions requests.
pub struct ApiVersionsHandler {
    versions: VersionTable,
}

impl ApiVersionsHandler {
    pub(crate) fn new(versions: VersionTable) -> Self {
        Self { versions }
    }

    /// Build the response body for `api_version`.
    ///
    /// Unsupported versions get an `UNSUPPORTED_VERSION` error encoded at
    /// v0, which every client can parse.
    fn build_response(&self, api_version: i16, throttle_time_ms: i32) -> Result<BytesMut> {
        let (error_code, encode_version) = if SUPPORTED_VERSIONS.contains(&api_version) {
            (0, api_version)
        } else {
            (UNSUPPORTED_VERSION, 0)
        };

        let mut response = ApiVersionsResponse::default();
        response.error_code = error_code;
        response.throttle_time_ms = throttle_time_ms;

        let table = self.versions.read().unwrap_or_else(|e| e.into_inner());
        for (api_key, range) in table.iter() {
            let mut api = ApiVersion::default();
            api.api_key = *api_key;
            api.min_version = *range.start();
            api.max_version = *range.end();
            response.api_keys.push(api);
        }
        drop(table);

        let mut buf = BytesMut::new();
        response
            .encode(&mut buf, encode_version)
            .map_err(|e| IngressError::ProtocolEncode {
                message: e.to_string(),
            })?;

        Ok(buf)
    }
}

#[async_trait]
impl ProtocolHandler for ApiVersionsHandler {
    fn name(&self) -> &'static str {
        "api_versions"
    }

    async fn handle(&self, ctx: RequestContext) -> Result<Response> {
        debug!(
            correlation_id = ctx.correlation_id(),
            api_version = ctx.api_version(),
            "handling ApiVersions"
        );
        let throttle_ms = i32::try_from(ctx.throttle_delay().as_millis()).unwrap_or(i32::MAX);
        let body = self.build_response(ctx.api_version(), throttle_ms)?;
        Ok(Response::Payload(body.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use kafka_protocol::messages::ApiKey;
    use kafka_protocol::protocol::Decodable;
    use std::collections::BTreeMap;
    use std::sync::{Arc, RwLock};

    fn handler() -> ApiVersionsHandler {
        let mut table = BTreeMap::new();
        table.insert(ApiKey::Produce as i16, 3..=9);
        table.insert(ApiKey::ApiVersions as i16, SUPPORTED_VERSIONS);
        ApiVersionsHandler::new(Arc::new(RwLock::new(table)))
    }

    #[test]
    fn test_build_response() {
        let response = handler().build_response(3, 0).unwrap();
        assert!(!response.is_empty());

        let mut bytes = Bytes::from(response.to_vec());
        let decoded = ApiVersionsResponse::decode(&mut bytes, 3).unwrap();
        assert_eq!(decoded.error_code, 0);
        assert_eq!(decoded.api_keys.len(), 2);

        let produce = decoded
            .api_keys
            .iter()
            .find(|a| a.api_key == ApiKey::Produce as i16)
            .unwrap();
        assert_eq!((produce.min_version, produce.max_version), (3, 9));
    }

    #[test]
    fn test_unsupported_version_answers_v0_error() {
        let response = handler().build_response(42, 0).unwrap();

        let mut bytes = Bytes::from(response.to_vec());
        let decoded = ApiVersionsResponse::decode(&mut bytes, 0).unwrap();
        assert_eq!(decoded.error_code, UNSUPPORTED_VERSION);
        assert!(decoded
            .api_keys
            .iter()
            .any(|a| a.api_key == ApiKey::ApiVersions as i16));
    }

    #[test]
    fn test_throttle_time_reported() {
        let response = handler().build_response(2, 250).unwrap();

        let mut bytes = Bytes::from(response.to_vec());
        let decoded = ApiVersionsResponse::decode(&mut bytes, 2).unwrap();
        assert_eq!(decoded.throttle_time_ms, 250);
    }
}
