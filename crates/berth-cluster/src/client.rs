//! Control-plane client: JSON over HTTP/1.1 to the Berth API.
//!
//! Used by host agents for registration and heartbeats, and by
//! `berthd apply` to submit a stack.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use berth_state::{StackDeclaration, StackOutputs};

use crate::error::{ClusterError, ClusterResult};
use crate::protocol::{
    ApiResponse, HeartbeatRequest, HeartbeatResponse, RegisterHostRequest, RegisterHostResponse,
};

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    /// `host:port` of the API server.
    address: String,
    timeout: Duration,
}

impl ControlPlaneClient {
    /// Client for the API at `address` (`host:port`, an `http://` prefix
    /// is accepted).
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let address = address
            .strip_prefix("http://")
            .unwrap_or(&address)
            .trim_end_matches('/')
            .to_string();
        Self {
            address,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn register(&self, request: &RegisterHostRequest) -> ClusterResult<RegisterHostResponse> {
        self.send(Method::POST, "/api/v1/hosts", Some(request)).await
    }

    pub async fn heartbeat(
        &self,
        host_id: &str,
        request: &HeartbeatRequest,
    ) -> ClusterResult<HeartbeatResponse> {
        self.send(Method::POST, &format!("/api/v1/hosts/{host_id}/heartbeat"), Some(request))
            .await
    }

    pub async fn apply(&self, stack: &StackDeclaration) -> ClusterResult<StackOutputs> {
        self.send(Method::POST, "/api/v1/apply", Some(stack)).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClusterResult<T> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ClusterResult<T> {
        let payload = match body {
            Some(body) => Bytes::from(
                serde_json::to_vec(body).map_err(|e| ClusterError::Transport(e.to_string()))?,
            ),
            None => Bytes::new(),
        };
        let uri = format!("http://{}{path}", self.address);

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| ClusterError::Transport(format!("connect {}: {e}", self.address)))?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ClusterError::Transport(format!("handshake: {e}")))?;
            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let request = Request::builder()
                .method(method.clone())
                .uri(&uri)
                .header("host", &self.address)
                .header("content-type", "application/json")
                .header("user-agent", "berth-agent/0.1")
                .body(Full::new(payload))
                .map_err(|e| ClusterError::Transport(e.to_string()))?;
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| ClusterError::Transport(format!("{method} {path}: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClusterError::Transport(format!("read body: {e}")))?
                .to_bytes();
            Ok::<_, ClusterError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClusterError::Transport(format!("{method} {path} timed out")))??;
        debug!(%method, %path, status = status.as_u16(), "control plane request");
        decode(status, &body)
    }
}

/// Unwrap an API envelope.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> ClusterResult<T> {
    let envelope: ApiResponse<T> = serde_json::from_slice(body).map_err(|e| ClusterError::Api {
        status: status.as_u16(),
        message: format!("unreadable response: {e}"),
    })?;
    match envelope {
        ApiResponse {
            success: true,
            data: Some(data),
            ..
        } if status.is_success() => Ok(data),
        ApiResponse { error, .. } => Err(ClusterError::Api {
            status: status.as_u16(),
            message: error.unwrap_or_else(|| "empty response".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_prefix_is_stripped() {
        let client = ControlPlaneClient::new("http://127.0.0.1:8443/");
        assert_eq!(client.address(), "127.0.0.1:8443");
        assert_eq!(ControlPlaneClient::new("cp:80").address(), "cp:80");
    }

    #[test]
    fn decode_success_envelope() {
        let body = br#"{"success":true,"data":{"host_id":"host-1","heartbeat_interval_secs":5}}"#;
        let response: RegisterHostResponse = decode(StatusCode::CREATED, body).unwrap();
        assert_eq!(response.host_id, "host-1");
        assert!(response.health_checks.is_empty());
    }

    #[test]
    fn decode_error_envelope() {
        let body = br#"{"success":false,"error":"unknown host: host-1"}"#;
        let err = decode::<HeartbeatResponse>(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(err.is_unknown_host());
        assert!(err.to_string().contains("unknown host: host-1"));
    }

    #[test]
    fn decode_garbage_is_an_api_error() {
        let err = decode::<HeartbeatResponse>(StatusCode::BAD_GATEWAY, b"<html>").unwrap_err();
        assert!(matches!(err, ClusterError::Api { status: 502, .. }));
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_a_transport_error() {
        let client = ControlPlaneClient::new("127.0.0.1:1").with_timeout(Duration::from_secs(2));
        let err = client.get::<serde_json::Value>("/healthz").await.unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
    }
}
