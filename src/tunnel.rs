use crate::error::RelayError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{info, warn};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Lifecycle of the external tunnel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Polling,
    Active(String),
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct TunnelInfo {
    public_url: String,
    proto: String,
    config: TunnelEndpointConfig,
}

#[derive(Debug, Deserialize)]
struct TunnelEndpointConfig {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct TunnelsResponse {
    tunnels: Vec<TunnelInfo>,
}

struct Inner {
    state: TunnelState,
    child: Option<Child>,
}

/// Supervises the external tunneling binary: spawns it, polls its local
/// status API until a public URL shows up, and kills it on stop. Driven as a
/// bounded retry loop with a fixed polling interval; not part of the proxy
/// core.
pub struct TunnelSupervisor {
    binary: String,
    api_port: u16,
    poll_interval: Duration,
    max_poll_attempts: u32,
    client: Client<HttpConnector, Full<Bytes>>,
    inner: Mutex<Inner>,
}

impl TunnelSupervisor {
    pub fn new(binary: impl Into<String>, api_port: u16) -> Self {
        Self {
            binary: binary.into(),
            api_port,
            poll_interval: Duration::from_secs(1),
            max_poll_attempts: 12,
            client: Client::builder(TokioExecutor::new()).build_http(),
            inner: Mutex::new(Inner {
                state: TunnelState::Stopped,
                child: None,
            }),
        }
    }

    /// Shortens the retry loop; used by tests.
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.max_poll_attempts = max_attempts;
        self
    }

    pub async fn status(&self) -> TunnelState {
        self.inner.lock().await.state.clone()
    }

    /// Starts the tunnel for `local_port` and returns the public URL once the
    /// status API reports it. Any previously running child is stopped first.
    pub async fn start(
        &self,
        token: &str,
        domain: &str,
        local_port: u16,
    ) -> Result<String, RelayError> {
        if token.is_empty() {
            return Err(RelayError::Tunnel("Tunnel token is required".into()));
        }

        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            let _ = child.kill().await;
        }
        inner.state = TunnelState::Starting;

        let mut command = Command::new(&self.binary);
        command.args(["http", &local_port.to_string(), "--authtoken", token]);
        if !domain.is_empty() {
            command.args(["--hostname", domain]);
        }
        command.args(["--log", "stdout", "--log-level", "info"]);
        command.kill_on_drop(true);
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("Failed to start {} process: {}", self.binary, e);
                inner.state = TunnelState::Failed(reason.clone());
                return Err(RelayError::Tunnel(reason));
            }
        };
        inner.child = Some(child);
        inner.state = TunnelState::Polling;
        drop(inner);

        info!("Waiting for {} to initialize...", self.binary);

        let mut last_error = String::new();
        for attempt in 1..=self.max_poll_attempts {
            sleep(self.poll_interval).await;

            {
                let mut inner = self.inner.lock().await;
                let exited = match inner.child.as_mut() {
                    Some(child) => child.try_wait().map(|s| s.is_some()).unwrap_or(true),
                    None => true,
                };
                if exited {
                    let reason = format!("{} process died unexpectedly", self.binary);
                    inner.state = TunnelState::Failed(reason.clone());
                    inner.child = None;
                    return Err(RelayError::Tunnel(reason));
                }
            }

            match self.query_public_url(local_port).await {
                Ok(url) => {
                    let mut inner = self.inner.lock().await;
                    inner.state = TunnelState::Active(url.clone());
                    info!("Tunnel established: {}", url);
                    return Ok(url);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Attempt {}/{}: waiting for tunnel API ({})",
                        attempt, self.max_poll_attempts, last_error
                    );
                }
            }
        }

        let reason = format!(
            "Failed to establish tunnel after {} attempts: {}",
            self.max_poll_attempts, last_error
        );
        self.fail_and_kill(reason.clone()).await;
        Err(RelayError::Tunnel(reason))
    }

    /// Stops the tunnel process if one is running.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            child
                .kill()
                .await
                .map_err(|e| RelayError::Tunnel(format!("Failed to stop tunnel: {}", e)))?;
            info!("Tunnel stopped");
        }
        inner.state = TunnelState::Stopped;
        Ok(())
    }

    async fn fail_and_kill(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if let Some(mut child) = inner.child.take() {
            let _ = child.kill().await;
        }
        inner.state = TunnelState::Failed(reason);
    }

    /// Asks the binary's local API which public URL maps to `local_port`,
    /// preferring the https endpoint.
    async fn query_public_url(&self, local_port: u16) -> Result<String, RelayError> {
        let uri: hyper::Uri = format!("http://127.0.0.1:{}/api/tunnels", self.api_port)
            .parse()
            .map_err(|e| RelayError::Tunnel(format!("Invalid tunnel API URL: {}", e)))?;

        let request = hyper::Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| RelayError::Tunnel(e.to_string()))?;

        let response = tokio::time::timeout(Duration::from_secs(3), self.client.request(request))
            .await
            .map_err(|_| RelayError::Tunnel("Tunnel API request timed out".into()))?
            .map_err(|e| RelayError::Tunnel(format!("Failed to reach tunnel API: {}", e)))?;

        if response.status() != hyper::StatusCode::OK {
            return Err(RelayError::Tunnel(format!(
                "Tunnel API returned status {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RelayError::Tunnel(format!("Failed to read tunnel API response: {}", e)))?
            .to_bytes();

        let tunnels: TunnelsResponse = serde_json::from_slice(&body)
            .map_err(|e| RelayError::Tunnel(format!("Failed to parse tunnel API response: {}", e)))?;

        select_tunnel_url(&tunnels, local_port).ok_or_else(|| {
            RelayError::Tunnel(format!(
                "No tunnel found for port {} in {} tunnels",
                local_port,
                tunnels.tunnels.len()
            ))
        })
    }
}

/// Picks the https tunnel forwarding to `local_port`, falling back to http.
fn select_tunnel_url(response: &TunnelsResponse, local_port: u16) -> Option<String> {
    let port = local_port.to_string();
    for proto in ["https", "http"] {
        if let Some(tunnel) = response
            .tunnels
            .iter()
            .find(|t| t.proto == proto && t.config.addr.contains(&port))
        {
            return Some(tunnel.public_url.clone());
        }
    }
    None
}
