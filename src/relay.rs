use crate::error::RelayError;
use crate::request_log::{LogSink, RequestLogRecord};
use crate::rewriter::HtmlRewriter;
use crate::validator;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, info, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{timeout, Duration};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_PROXY_MODIFIED: HeaderName = HeaderName::from_static("x-proxy-modified");

/// Connection-level headers that must not cross the relay in either
/// direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// The private-network destination parsed from `/proxy/HOST:PORT/rest`.
/// Derived fresh for every request; never cached across requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    pub sub_path: String,
}

impl ProxyTarget {
    /// Parses a full request path of the form `/proxy/HOST:PORT[/subpath]`.
    /// The sub path defaults to `/` when absent. IPv6 literals use the usual
    /// bracket syntax (`/proxy/[::1]:8080/...`).
    pub fn parse(path: &str) -> Result<Self, RelayError> {
        let rest = path.strip_prefix("/proxy").ok_or_else(|| {
            RelayError::ClientInput("Invalid proxy path format. Use: /proxy/HOST:PORT/path".into())
        })?;
        let rest = rest.strip_prefix('/').ok_or_else(|| {
            RelayError::ClientInput("Invalid proxy path format. Use: /proxy/HOST:PORT/path".into())
        })?;
        if rest.is_empty() {
            return Err(RelayError::ClientInput(
                "Invalid proxy path format. Use: /proxy/HOST:PORT/path".into(),
            ));
        }

        let (host_port, remainder) = match rest.split_once('/') {
            Some((hp, tail)) => (hp, format!("/{}", tail)),
            None => (rest, "/".to_string()),
        };

        let (host, port) = split_host_port(host_port)?;
        Ok(Self {
            host,
            port,
            sub_path: remainder,
        })
    }

    /// The rewrite base: `/proxy/host:port`.
    pub fn proxy_prefix(&self) -> String {
        format!("/proxy/{}:{}", self.host, self.port)
    }

    /// Builds the plain-HTTP outbound URI, carrying the caller's query
    /// string through when present.
    pub fn outbound_uri(&self, query: Option<&str>) -> Result<Uri, RelayError> {
        let url = match query {
            Some(q) if !q.is_empty() => {
                format!("http://{}:{}{}?{}", self.host, self.port, self.sub_path, q)
            }
            _ => format!("http://{}:{}{}", self.host, self.port, self.sub_path),
        };
        url.parse()
            .map_err(|e| RelayError::ClientInput(format!("Invalid target URL {}: {}", url, e)))
    }
}

/// Splits standard `host:port` syntax, including bracketed IPv6 hosts.
fn split_host_port(host_port: &str) -> Result<(String, u16), RelayError> {
    let (host, port_str) = if let Some(stripped) = host_port.strip_prefix('[') {
        let (host, rest) = stripped
            .split_once(']')
            .ok_or_else(|| RelayError::ClientInput("Invalid host:port format".into()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| RelayError::ClientInput("Invalid host:port format".into()))?;
        (host.to_string(), port)
    } else {
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| RelayError::ClientInput("Invalid host:port format".into()))?;
        if host.is_empty() || host.contains(':') {
            return Err(RelayError::ClientInput("Invalid host:port format".into()));
        }
        (host.to_string(), port)
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| RelayError::ClientInput("Invalid port number".into()))?;
    if port == 0 {
        return Err(RelayError::ClientInput("Invalid port number".into()));
    }
    Ok((host, port))
}

fn is_html_response(response: &Response<Incoming>) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_lowercase().contains("text/html"))
        .unwrap_or(false)
}

fn full_body(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn json_error_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body)))
        .expect("static error response")
}

/// Forwards `/proxy/...` requests to validated private-network targets and
/// rewrites HTML responses so the browsed site keeps routing through the
/// relay. One independent invocation per request; the only shared state is
/// the pooled client and the log sink.
pub struct RelayDispatcher {
    client: Client<HttpConnector, Full<Bytes>>,
    log_sink: Arc<dyn LogSink>,
    upstream_timeout: Duration,
}

impl RelayDispatcher {
    pub fn new(log_sink: Arc<dyn LogSink>, upstream_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build_http();
        Self {
            client,
            log_sink,
            upstream_timeout,
        }
    }

    /// Handles one inbound `/proxy/...` request end to end and emits a log
    /// record once the response is produced.
    pub async fn handle(&self, req: Request<Incoming>, client_ip: IpAddr) -> Response<RelayBody> {
        let start = Instant::now();
        let timestamp = Utc::now();
        let method = req.method().to_string();
        let raw_path = req.uri().path().to_string();

        let target = match ProxyTarget::parse(&raw_path) {
            Ok(target) => target,
            Err(e) => {
                let response = json_error_response(e.status_code(), &e.to_string());
                self.emit_record(
                    timestamp,
                    client_ip,
                    &method,
                    "",
                    0,
                    &raw_path,
                    Some(response.status()),
                    start,
                    &e.to_string(),
                )
                .await;
                return response;
            }
        };

        if !validator::is_allowed_target(&target.host) {
            warn!(
                "Rejected non-private relay target {} from {}",
                target.host, client_ip
            );
            let e = RelayError::Forbidden("Only private IP addresses are allowed".into());
            let response = json_error_response(e.status_code(), &e.to_string());
            self.emit_record(
                timestamp,
                client_ip,
                &method,
                &target.host,
                target.port,
                &target.sub_path,
                Some(response.status()),
                start,
                &e.to_string(),
            )
            .await;
            return response;
        }

        let (origin_status, response, error) = match self.forward(req, &target, client_ip).await {
            Ok(response) => (Some(response.status()), response, String::new()),
            Err(e) => {
                // The origin never produced a status; the log entry below
                // still reports 200 (documented looseness carried over from
                // the original system).
                let response = json_error_response(e.status_code(), &e.to_string());
                (None, response, e.to_string())
            }
        };

        self.emit_record(
            timestamp,
            client_ip,
            &method,
            &target.host,
            target.port,
            &target.sub_path,
            origin_status,
            start,
            &error,
        )
        .await;

        response
    }

    /// Performs the outbound request and pipes HTML responses through the
    /// rewriter. Non-HTML bodies stream through untouched.
    async fn forward(
        &self,
        req: Request<Incoming>,
        target: &ProxyTarget,
        client_ip: IpAddr,
    ) -> Result<Response<RelayBody>, RelayError> {
        let outbound_uri = target.outbound_uri(req.uri().query())?;
        debug!("Forwarding {} {} -> {}", req.method(), req.uri(), outbound_uri);

        let (parts, body) = req.into_parts();

        // The inbound body is buffered so the outbound request carries a
        // known length regardless of how the caller framed it.
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| RelayError::Http(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(outbound_uri.clone());
        for (name, value) in parts.headers.iter() {
            // Forwarding headers are set fresh below rather than appended to.
            if name == &HOST
                || name == &X_FORWARDED_FOR
                || name == &X_FORWARDED_PROTO
                || HOP_BY_HOP_HEADERS.contains(&name.as_str())
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(authority) = outbound_uri.authority() {
            builder = builder.header(HOST, authority.as_str());
        }
        builder = builder
            .header(&X_FORWARDED_FOR, client_ip.to_string())
            .header(&X_FORWARDED_PROTO, "http");

        let outbound = builder
            .body(Full::new(body_bytes))
            .map_err(|e| RelayError::Http(e.to_string()))?;

        let response = timeout(self.upstream_timeout, self.client.request(outbound))
            .await
            .map_err(|_| RelayError::Upstream("Request to target timed out".into()))?
            .map_err(|e| RelayError::Upstream(e.to_string()))?;

        if is_html_response(&response) {
            self.rewrite_response(response, target).await
        } else {
            let mut response = response.map(|body| body.boxed());
            strip_hop_by_hop(response.headers_mut());
            Ok(response)
        }
    }

    /// Buffers an HTML body, rewrites it against the proxy prefix and
    /// replaces the content length. A body read failure aborts the rewrite
    /// and surfaces as a gateway error rather than an empty page.
    async fn rewrite_response(
        &self,
        response: Response<Incoming>,
        target: &ProxyTarget,
    ) -> Result<Response<RelayBody>, RelayError> {
        let (mut parts, body) = response.into_parts();
        let original = body
            .collect()
            .await
            .map_err(|e| RelayError::Rewrite(format!("Failed to buffer HTML body: {}", e)))?
            .to_bytes();

        let rewriter = HtmlRewriter::new(target.proxy_prefix(), target.host.clone());
        let rewritten = Bytes::from(rewriter.rewrite(&original));

        strip_hop_by_hop(&mut parts.headers);
        parts
            .headers
            .insert(CONTENT_LENGTH, rewritten.len().into());
        parts
            .headers
            .insert(&X_PROXY_MODIFIED, "true".parse().expect("static header"));

        Ok(Response::from_parts(parts, full_body(rewritten)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_record(
        &self,
        timestamp: chrono::DateTime<Utc>,
        client_ip: IpAddr,
        method: &str,
        host: &str,
        port: u16,
        path: &str,
        status: Option<StatusCode>,
        start: Instant,
        error: &str,
    ) {
        let record = RequestLogRecord {
            timestamp,
            source_ip: client_ip.to_string(),
            method: method.to_string(),
            target_host: host.to_string(),
            target_port: port,
            path: path.to_string(),
            // Unset status (origin connection failure) is reported as 200.
            status_code: status.map(|s| s.as_u16()).unwrap_or(200),
            duration_ms: start.elapsed().as_millis() as i64,
            error: error.to_string(),
        };

        if let Err(e) = self.log_sink.record(record).await {
            // Best effort only; the response is already on its way.
            log::error!("Failed to record request log entry: {}", e);
        } else if error.is_empty() {
            info!("Relayed {} {}:{}{}", method, host, port, path);
        }
    }
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
