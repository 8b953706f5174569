//! gRPC service implementation for the boot code plugin.

use std::time::{SystemTime, UNIX_EPOCH};

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::proto::{
    boot_code_plugin_server::BootCodePlugin, Empty, MetadataResponse, PingRequest, PingResponse,
};

/// Largest ping payload echoed back.
const MAX_PING_LEN: usize = 4096;

/// Boot code plugin gRPC service.
#[derive(Debug, Clone)]
pub struct BootCodeService {
    name: String,
    version: String,
    protocol_version: u32,
}

impl BootCodeService {
    /// Create a new BootCodeService announcing `protocol_version`.
    pub fn new(protocol_version: u32) -> Result<Self, boot_plugin::Error> {
        if protocol_version == 0 {
            return Err(boot_plugin::Error::Registration(
                "app protocol version must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            name: "boot-code".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version,
        })
    }
}

#[tonic::async_trait]
impl BootCodePlugin for BootCodeService {
    async fn metadata(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<MetadataResponse>, Status> {
        debug!("Metadata request received");
        Ok(Response::new(MetadataResponse {
            name: self.name.clone(),
            version: self.version.clone(),
            description: "Boot code plugin served over the stdout handshake protocol".to_string(),
            protocol_version: self.protocol_version,
        }))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        if req.message.len() > MAX_PING_LEN {
            return Err(Status::invalid_argument(format!(
                "ping message exceeds {} bytes",
                MAX_PING_LEN
            )));
        }

        let served_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Ok(Response::new(PingResponse {
            message: req.message,
            served_at_unix_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metadata() {
        let service = BootCodeService::new(1).unwrap();
        let response = service.metadata(Request::new(Empty {})).await.unwrap();
        let meta = response.into_inner();
        assert_eq!(meta.name, "boot-code");
        assert!(!meta.version.is_empty());
        assert_eq!(meta.protocol_version, 1);
    }

    #[tokio::test]
    async fn test_ping_echoes_message() {
        let service = BootCodeService::new(1).unwrap();
        let response = service
            .ping(Request::new(PingRequest {
                message: "hello".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.message, "hello");
        assert!(response.served_at_unix_ms > 0);
    }

    #[tokio::test]
    async fn test_ping_rejects_oversized_message() {
        let service = BootCodeService::new(1).unwrap();
        let status = service
            .ping(Request::new(PingRequest {
                message: "x".repeat(MAX_PING_LEN + 1),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_zero_protocol_version_rejected() {
        let err = BootCodeService::new(0).unwrap_err();
        assert!(matches!(err, boot_plugin::Error::Registration(_)));
    }
}
