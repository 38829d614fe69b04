use bytes::Bytes;
use ferry_controller_core::{PortError, UnusedPorts};
use http::{StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time;

/// The HTTP port of every tunnel's admin server.
pub const ADMIN_PORT: u16 = 8080;

/// The name of the tunnel service in the tunnel namespace.
pub const TUNNEL_SERVICE: &str = "ferry-tunnel";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid tunnel address: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response: {0}")]
    Body(#[from] hyper::Error),

    #[error("request timed out after {0:?}")]
    Timeout(time::Duration),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("invalid port {0:?}")]
    InvalidPort(String),
}

/// Talks to a hub's tunnel admin server through the control-plane tunnel.
#[derive(Clone, Debug)]
pub struct TunnelClient {
    authority: String,
    timeout: time::Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

// === impl TunnelClient ===

impl TunnelClient {
    pub fn new(authority: impl Into<String>, timeout: time::Duration) -> Self {
        Self {
            authority: authority.into(),
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Addresses `hub`'s tunnel as mirrored into the tunnel namespace of the
    /// control-plane hub.
    pub fn for_hub(
        hub: &str,
        control_plane_hub: &str,
        tunnel_namespace: &str,
        timeout: time::Duration,
    ) -> Self {
        let service = if hub == control_plane_hub {
            TUNNEL_SERVICE.to_string()
        } else {
            format!("{hub}-{TUNNEL_SERVICE}")
        };
        Self::new(
            format!("{service}.{tunnel_namespace}:{ADMIN_PORT}"),
            timeout,
        )
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Succeeds if the tunnel responds to `GET /` with a success status.
    pub async fn probe(&self) -> Result<(), TunnelError> {
        self.get("/").await.map(|_| ())
    }

    /// Asks the tunnel for a port nothing on its hub listens on.
    pub async fn unused_port(&self) -> Result<i32, TunnelError> {
        let body = self.get("/ports/unused").await?;
        parse_port(&body)
    }

    async fn get(&self, path: &str) -> Result<Bytes, TunnelError> {
        let uri = format!("http://{}{}", self.authority, path).parse::<Uri>()?;
        let rsp = time::timeout(self.timeout, self.client.get(uri))
            .await
            .map_err(|_| TunnelError::Timeout(self.timeout))??;
        let status = rsp.status();
        if !status.is_success() {
            return Err(TunnelError::Status(status));
        }
        let body = time::timeout(self.timeout, rsp.into_body().collect())
            .await
            .map_err(|_| TunnelError::Timeout(self.timeout))??;
        Ok(body.to_bytes())
    }
}

#[async_trait::async_trait]
impl UnusedPorts for TunnelClient {
    async fn next_unused(&self) -> Result<i32, PortError> {
        self.unused_port()
            .await
            .map_err(|error| PortError::Unused(format!("{}: {error}", self.authority)))
    }
}

fn parse_port(body: &[u8]) -> Result<i32, TunnelError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port.into()),
        _ => Err(TunnelError::InvalidPort(text.to_string())),
    }
}
