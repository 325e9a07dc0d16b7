//! End-to-end tests: a real origin server behind a real relay listener.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use lan_relay::config::Config;
use lan_relay::RelayServer;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

const DASHBOARD_HTML: &str = concat!(
    "<html><head><title>Printer</title></head><body>",
    r#"<a href="/a/b">link</a>"#,
    r#"<img src="img.png">"#,
    r#"<a href="https://example.com/ext">ext</a>"#,
    "</body></html>",
);

async fn origin_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/dashboard" => Response::builder()
            .header("content-type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(DASHBOARD_HTML)))
            .unwrap(),
        "/data.json" => Response::builder()
            .header("content-type", "application/json")
            .header("x-origin", "true")
            .body(Full::new(Bytes::from(r#"{"value": 42}"#)))
            .unwrap(),
        "/headers" => {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("missing")
                    .to_string()
            };
            Response::builder()
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(format!(
                    "xff={};proto={};host={}",
                    header("x-forwarded-for"),
                    header("x-forwarded-proto"),
                    header("host"),
                ))))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Starts a plain-HTTP origin on a loopback port and returns its address.
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_handler))
                    .await;
            });
        }
    });
    addr
}

/// Starts a relay on a loopback port and returns its address.
async fn spawn_relay() -> SocketAddr {
    let mut config = Config::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    let server = RelayServer::bind(&config).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn get(relay: SocketAddr, path: &str) -> (StatusCode, HeaderMap, Bytes) {
    request(relay, "GET", path, Bytes::new()).await
}

async fn request(
    relay: SocketAddr,
    method: &str,
    path: &str,
    body: Bytes,
) -> (StatusCode, HeaderMap, Bytes) {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", relay, path))
        .body(Full::new(body))
        .unwrap();
    let response = client().request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

async fn fetch_logs(relay: SocketAddr) -> Vec<serde_json::Value> {
    let (status, _, body) = get(relay, "/api/logs").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    parsed["logs"].as_array().unwrap().clone()
}

#[tokio::test]
async fn test_html_response_is_rewritten_and_logged() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;
    let prefix = format!("/proxy/127.0.0.1:{}", origin.port());

    let (status, headers, body) = get(relay, &format!("{}/dashboard", prefix)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-proxy-modified").unwrap(), "true");

    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains(&format!(r#"href="{}/a/b""#, prefix)), "{}", html);
    assert!(html.contains(&format!(r#"src="{}/img.png""#, prefix)), "{}", html);
    assert!(html.contains(r#"href="https://example.com/ext""#), "{}", html);
    assert!(html.contains(&format!(r#"<base href="{}/">"#, prefix)), "{}", html);

    let content_length: usize = headers
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(content_length, html.len());

    let logs = fetch_logs(relay).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["target_host"], "127.0.0.1");
    assert_eq!(logs[0]["target_port"], origin.port());
    assert_eq!(logs[0]["path"], "/dashboard");
    assert_eq!(logs[0]["status_code"], 200);
    assert!(logs[0]["duration_ms"].as_i64().unwrap() >= 0);
    assert!(logs[0].get("error").is_none());
}

#[tokio::test]
async fn test_non_html_response_streams_through_unmodified() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;

    let (status, headers, body) = get(
        relay,
        &format!("/proxy/127.0.0.1:{}/data.json", origin.port()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-proxy-modified").is_none());
    assert_eq!(headers.get("x-origin").unwrap(), "true");
    assert_eq!(&body[..], br#"{"value": 42}"#);
}

#[tokio::test]
async fn test_forwarded_headers_reach_the_origin() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;

    let (status, _, body) = get(
        relay,
        &format!("/proxy/127.0.0.1:{}/headers", origin.port()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("xff=127.0.0.1"), "{}", text);
    assert!(text.contains("proto=http"), "{}", text);
    assert!(text.contains(&format!("host=127.0.0.1:{}", origin.port())), "{}", text);
}

#[tokio::test]
async fn test_public_target_is_forbidden_without_outbound_call() {
    let relay = spawn_relay().await;

    let (status, _, body) = get(relay, "/proxy/8.8.8.8:80/").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"]
        .as_str()
        .unwrap()
        .contains("private IP addresses"));

    // The rejection was instantaneous (no connect attempt) and still logged.
    let logs = fetch_logs(relay).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["target_host"], "8.8.8.8");
    assert_eq!(logs[0]["status_code"], 403);
}

#[tokio::test]
async fn test_hostname_target_is_forbidden() {
    let relay = spawn_relay().await;
    let (status, _, _) = get(relay, "/proxy/internal.example.com:80/").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_malformed_target_is_bad_request() {
    let relay = spawn_relay().await;

    let (status, _, body) = get(relay, "/proxy/bad-host-format").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"].as_str().unwrap().contains("host:port"));

    let (status, _, _) = get(relay, "/proxy/10.0.0.5:99999/").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_origin_surfaces_as_gateway_error() {
    let relay = spawn_relay().await;

    // Grab a loopback port with nothing listening on it.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let (status, _, _) = get(relay, &format!("/proxy/127.0.0.1:{}/", port)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // Known looseness inherited from the original system: the origin never
    // produced a status, so the log entry reports 200 even though the caller
    // got a 502. The error field carries the real failure.
    let logs = fetch_logs(relay).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status_code"], 200);
    assert!(!logs[0]["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;

    // The origin 404s unknown paths but still proves the round trip works
    // for non-GET methods with bodies.
    let (status, _, _) = request(
        relay,
        "POST",
        &format!("/proxy/127.0.0.1:{}/submit", origin.port()),
        Bytes::from("key=value"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_endpoint() {
    let relay = spawn_relay().await;
    let (status, _, body) = get(relay, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert!(parsed["version"].as_str().is_some());
}

#[tokio::test]
async fn test_status_endpoint_counts_requests() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;

    get(relay, &format!("/proxy/127.0.0.1:{}/data.json", origin.port())).await;

    let (status, _, body) = get(relay, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["online"], true);
    assert_eq!(parsed["total_requests"], 1);
    assert_eq!(parsed["tunnel_status"], "stopped");
}

#[tokio::test]
async fn test_logs_clear_endpoint() {
    let origin = spawn_origin().await;
    let relay = spawn_relay().await;

    get(relay, &format!("/proxy/127.0.0.1:{}/data.json", origin.port())).await;
    assert_eq!(fetch_logs(relay).await.len(), 1);

    let (status, _, _) = request(relay, "POST", "/api/logs/clear", Bytes::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fetch_logs(relay).await.is_empty());
}

#[tokio::test]
async fn test_settings_round_trip_masks_token() {
    let relay = spawn_relay().await;

    let (status, _, _) = request(
        relay,
        "POST",
        "/api/settings",
        Bytes::from(r#"{"token": "abcd1234wxyz", "domain": "relay.example.com"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(relay, "/api/settings").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["token"], "abcd****wxyz");
    assert_eq!(parsed["domain"], "relay.example.com");
}

#[tokio::test]
async fn test_tunnel_start_requires_token() {
    let relay = spawn_relay().await;
    let (status, _, body) = request(relay, "POST", "/api/tunnel/start", Bytes::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"].as_str().unwrap().contains("token"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let relay = spawn_relay().await;
    let (status, _, _) = get(relay, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
