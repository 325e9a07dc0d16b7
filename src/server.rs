use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{RelayBody, RelayDispatcher};
use crate::request_log::{FanoutLogSink, JsonlLogSink, LogSink, MemoryLogSink};
use crate::settings::{mask_token, MemorySettingsStore, SettingsStore, TunnelCredentials};
use crate::tunnel::{TunnelState, TunnelSupervisor};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use serde_json::json;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct RelayState {
    dispatcher: RelayDispatcher,
    logs: Arc<MemoryLogSink>,
    settings: Arc<dyn SettingsStore>,
    tunnel: TunnelSupervisor,
    start_time: Instant,
    local_port: u16,
}

/// The relay's single HTTP listener: `/proxy/...` dispatch plus the
/// management API, each inbound connection handled on its own task.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    pub async fn bind(config: &Config) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let logs = Arc::new(MemoryLogSink::new(config.log_buffer_capacity));
        let sink: Arc<dyn LogSink> = match &config.request_log_file {
            Some(path) => {
                let file_sink = JsonlLogSink::open(path)?;
                info!("Request log file: {}", file_sink.path().display());
                Arc::new(FanoutLogSink::new(vec![
                    logs.clone() as Arc<dyn LogSink>,
                    Arc::new(file_sink),
                ]))
            }
            None => logs.clone(),
        };

        let state = Arc::new(RelayState {
            dispatcher: RelayDispatcher::new(
                sink,
                Duration::from_secs(config.upstream_timeout_secs),
            ),
            logs,
            settings: Arc::new(MemorySettingsStore::default()),
            tunnel: TunnelSupervisor::new(&config.tunnel.binary, config.tunnel.api_port),
            start_time: Instant::now(),
            local_port: local_addr.port(),
        });

        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    /// The address actually bound, so callers binding port 0 can find it.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> Result<(), RelayError> {
        info!("Relay server listening on http://{}", self.local_addr);

        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            let state = self.state.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = ServerBuilder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let state = state.clone();
                            async move {
                                let response = state.route(req, remote_addr.ip()).await;
                                Ok::<_, Infallible>(response)
                            }
                        }),
                    )
                    .await
                {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

impl RelayState {
    async fn route(&self, req: Request<Incoming>, client_ip: IpAddr) -> Response<RelayBody> {
        let path = req.uri().path().to_string();

        if path == "/proxy" || path.starts_with("/proxy/") {
            return self.dispatcher.handle(req, client_ip).await;
        }

        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/api/health") => self.health(),
            (Method::GET, "/api/status") => self.status().await,
            (Method::GET, "/api/logs") => self.list_logs(req.uri().query()),
            (Method::POST, "/api/logs/clear") => self.clear_logs(),
            (Method::GET, "/api/settings") => self.get_settings(),
            (Method::POST, "/api/settings") => self.update_settings(req).await,
            (Method::POST, "/api/tunnel/start") => self.start_tunnel().await,
            (Method::POST, "/api/tunnel/stop") => self.stop_tunnel().await,
            _ => json_response(StatusCode::NOT_FOUND, json!({"error": "Not found"})),
        }
    }

    fn health(&self) -> Response<RelayBody> {
        json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "timestamp": Utc::now(),
                "version": VERSION,
            }),
        )
    }

    async fn status(&self) -> Response<RelayBody> {
        let (tunnel_status, tunnel_url) = match self.tunnel.status().await {
            TunnelState::Stopped => ("stopped", None),
            TunnelState::Starting => ("starting", None),
            TunnelState::Polling => ("polling", None),
            TunnelState::Active(url) => ("connected", Some(url)),
            TunnelState::Failed(_) => ("failed", None),
        };

        json_response(
            StatusCode::OK,
            json!({
                "online": true,
                "last_check": Utc::now(),
                "total_requests": self.logs.len(),
                "uptime_secs": self.start_time.elapsed().as_secs(),
                "tunnel_status": tunnel_status,
                "tunnel_url": tunnel_url,
            }),
        )
    }

    fn list_logs(&self, query: Option<&str>) -> Response<RelayBody> {
        let (limit, offset) = parse_log_query(query);
        let logs = self.logs.recent(limit, offset);
        json_response(
            StatusCode::OK,
            json!({
                "logs": logs,
                "limit": limit,
                "offset": offset,
            }),
        )
    }

    fn clear_logs(&self) -> Response<RelayBody> {
        self.logs.clear();
        info!("Request logs cleared by user");
        json_response(StatusCode::OK, json!({"message": "Logs cleared successfully"}))
    }

    fn get_settings(&self) -> Response<RelayBody> {
        let credentials = self.settings.get();
        json_response(
            StatusCode::OK,
            json!({
                "token": mask_token(&credentials.token),
                "domain": credentials.domain,
            }),
        )
    }

    async fn update_settings(&self, req: Request<Incoming>) -> Response<RelayBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": format!("Failed to read request body: {}", e)}),
                )
            }
        };

        let credentials: TunnelCredentials = match serde_json::from_slice(&body) {
            Ok(credentials) => credentials,
            Err(_) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": "Invalid request format"}),
                )
            }
        };

        self.settings.update(credentials);
        info!("Tunnel settings updated by user");
        json_response(
            StatusCode::OK,
            json!({"message": "Settings updated successfully"}),
        )
    }

    async fn start_tunnel(&self) -> Response<RelayBody> {
        let credentials = self.settings.get();
        if credentials.token.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Tunnel token not configured. Please set your token in settings first.",
                }),
            );
        }

        match self
            .tunnel
            .start(&credentials.token, &credentials.domain, self.local_port)
            .await
        {
            Ok(url) => json_response(
                StatusCode::OK,
                json!({
                    "url": url,
                    "message": "Tunnel started successfully",
                }),
            ),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Failed to start tunnel",
                    "details": e.to_string(),
                }),
            ),
        }
    }

    async fn stop_tunnel(&self) -> Response<RelayBody> {
        match self.tunnel.stop().await {
            Ok(()) => json_response(
                StatusCode::OK,
                json!({"message": "Tunnel stopped successfully"}),
            ),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": e.to_string()}),
            ),
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<RelayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static json response")
}

/// Extracts `limit` and `offset` from the logs query string, with the same
/// defaults and clamping as the original API: limit 50 (max 1000), offset 0.
fn parse_log_query(query: Option<&str>) -> (usize, usize) {
    let mut limit = 50usize;
    let mut offset = 0usize;

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                match key {
                    "limit" => {
                        if let Ok(v) = value.parse::<usize>() {
                            if v > 0 {
                                limit = v;
                            }
                        }
                    }
                    "offset" => {
                        if let Ok(v) = value.parse::<usize>() {
                            offset = v;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    (limit.min(1000), offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_query_defaults() {
        assert_eq!(parse_log_query(None), (50, 0));
        assert_eq!(parse_log_query(Some("")), (50, 0));
        assert_eq!(parse_log_query(Some("unrelated=1")), (50, 0));
    }

    #[test]
    fn test_parse_log_query_values_and_clamping() {
        assert_eq!(parse_log_query(Some("limit=10&offset=5")), (10, 5));
        assert_eq!(parse_log_query(Some("limit=5000")), (1000, 0));
        assert_eq!(parse_log_query(Some("limit=0")), (50, 0));
        assert_eq!(parse_log_query(Some("limit=abc&offset=xyz")), (50, 0));
    }
}
