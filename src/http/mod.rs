//! HTTP listener: iPXE binaries, iPXE scripts, healthcheck and metrics
//! under one router.

pub mod ip;

pub use ip::TrustedProxies;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tracing::debug;

use crate::backend::{parse_mac, BackendReader, HardwareRecord};
use crate::error::AppError;
use crate::ipxe::{IpxeBinaries, ScriptRenderer};
use crate::metrics::Metrics;

/// Git revision baked in at build time.
const GIT_REV: &str = match option_env!("GANTRY_GIT_REV") {
    Some(rev) => rev,
    None => "unknown",
};

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Absent when the script server is disabled.
    pub backend: Option<Arc<dyn BackendReader>>,
    pub renderer: Arc<ScriptRenderer>,
    pub binaries: Arc<IpxeBinaries>,
    pub trusted_proxies: Arc<TrustedProxies>,
    pub metrics: Metrics,
    pub backend_timeout: Duration,
    pub start_time: Instant,
}

/// HTTP request logging middleware.
///
/// Logs each request in format: "IP METHOD PATH - STATUS" and counts it
/// for the script/binary handlers.
async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    tracing::info!("{} {} {} - {}", addr.ip(), method, uri, status.as_u16());

    let handler = if uri.path().starts_with("/ipxe/") {
        Some("binary")
    } else if uri.path().ends_with("/auto.ipxe") || uri.path() == "/auto.ipxe" {
        Some("script")
    } else {
        None
    };
    if let Some(handler) = handler {
        state
            .metrics
            .http_requests
            .with_label_values(&[handler, &status.as_u16().to_string()])
            .inc();
    }

    response
}

/// Create the application router. The binary and script routes are only
/// mounted for the enabled sub-servers; healthcheck and metrics are
/// unconditional.
pub fn create_router(state: AppState, binary_enabled: bool, script_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/healthcheck", get(handle_healthcheck))
        .route("/metrics", get(handle_metrics));

    if binary_enabled {
        router = router.route("/ipxe/{filename}", get(handle_binary));
    }
    if script_enabled {
        router = router
            .route("/auto.ipxe", get(handle_script_by_ip))
            .route("/{mac}/auto.ipxe", get(handle_script_by_mac));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_logging,
        ))
        .with_state(state)
}

/// GET /healthcheck
async fn handle_healthcheck(State(state): State<AppState>) -> Response {
    Json(json!({
        "git_rev": GIT_REV,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
    .into_response()
}

/// GET /metrics
async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// GET /ipxe/{filename}
///
/// Serves an iPXE binary, patched the same way the TFTP server patches
/// it. Non-GET methods get the router's 405.
async fn handle_binary(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let content = state
        .binaries
        .get(&filename)
        .ok_or_else(|| AppError::NotFound(filename.clone()))?;

    debug!("serving iPXE binary {} ({} bytes)", filename, content.len());

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        content.as_ref().clone(),
    )
        .into_response())
}

/// GET /{mac}/auto.ipxe
async fn handle_script_by_mac(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Response, AppError> {
    let mac = parse_mac(&mac).ok_or_else(|| AppError::BadRequest(format!("invalid MAC: {mac}")))?;

    let backend = state
        .backend
        .as_ref()
        .ok_or_else(|| AppError::Config("no inventory backend configured".to_string()))?;
    let record = tokio::time::timeout(state.backend_timeout, backend.get_by_mac(mac))
        .await
        .map_err(|_| AppError::BackendTimeout)??
        .ok_or_else(|| AppError::NotFound(format!("no hardware record for {mac}")))?;

    render_script(&state, record)
}

/// GET /auto.ipxe
///
/// MAC injection is off; the record is found by the client IP instead.
async fn handle_script_by_ip(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let client: IpAddr = state.trusted_proxies.client_ip(peer.ip(), forwarded_for);

    let backend = state
        .backend
        .as_ref()
        .ok_or_else(|| AppError::Config("no inventory backend configured".to_string()))?;
    let record = tokio::time::timeout(state.backend_timeout, backend.get_by_ip(client))
        .await
        .map_err(|_| AppError::BackendTimeout)??
        .ok_or_else(|| AppError::NotFound(format!("no hardware record for {client}")))?;

    render_script(&state, record)
}

fn render_script(state: &AppState, record: HardwareRecord) -> Result<Response, AppError> {
    if !record.netboot.allow_pxe {
        return Err(AppError::Forbidden(record.mac.to_string().to_lowercase()));
    }

    let script = state.renderer.render(&record)?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        script,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use macaddr::MacAddr6;
    use tower::ServiceExt;

    use crate::backend::{BackendError, Netboot, Osie};
    use crate::ipxe::binary::PATCH_MAGIC;

    const MAC: MacAddr6 = MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01);

    struct MapBackend {
        records: Vec<HardwareRecord>,
    }

    #[async_trait]
    impl BackendReader for MapBackend {
        async fn get_by_mac(
            &self,
            mac: MacAddr6,
        ) -> Result<Option<HardwareRecord>, BackendError> {
            Ok(self.records.iter().find(|r| r.mac == mac).cloned())
        }

        async fn get_by_ip(&self, ip: IpAddr) -> Result<Option<HardwareRecord>, BackendError> {
            Ok(self
                .records
                .iter()
                .find(|r| IpAddr::V4(r.ip) == ip)
                .cloned())
        }
    }

    fn record(mac: MacAddr6, ip: Ipv4Addr, allow_pxe: bool) -> HardwareRecord {
        HardwareRecord {
            mac,
            ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
            nameservers: vec![],
            hostname: None,
            domain: None,
            lease_time: 3600,
            vlan_id: None,
            netboot: Netboot {
                allow_pxe,
                ipxe_script_url: None,
            },
            osie: Some(Osie {
                base_url: "http://osie.local/img".to_string(),
            }),
            facility: Some("lab1".to_string()),
            metadata: HashMap::new(),
        }
    }

    fn binary_with_marker() -> Vec<u8> {
        let mut content = b"head".to_vec();
        content.extend_from_slice(PATCH_MAGIC);
        content.extend_from_slice(b"tail");
        content
    }

    fn test_state(trusted: &str, patch: &[u8]) -> AppState {
        let records = vec![
            record(MAC, Ipv4Addr::new(10, 0, 0, 10), true),
            record(
                MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02),
                Ipv4Addr::new(10, 0, 0, 11),
                false,
            ),
        ];

        let mut files = HashMap::new();
        files.insert("undionly.kpxe".to_string(), binary_with_marker());

        AppState {
            backend: Some(Arc::new(MapBackend { records })),
            renderer: Arc::new(
                ScriptRenderer::new("http://10.0.0.1/osie", "", "10.0.0.1", "10.0.0.5:42113", false)
                    .unwrap(),
            ),
            binaries: Arc::new(IpxeBinaries::from_map(files, patch)),
            trusted_proxies: Arc::new(TrustedProxies::parse(trusted).unwrap()),
            metrics: Metrics::new().unwrap(),
            backend_timeout: Duration::from_secs(2),
            start_time: Instant::now(),
        }
    }

    fn get_request(uri: &str, peer: &str) -> Request<Body> {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(peer.parse().unwrap()));
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/healthcheck", "127.0.0.1:9999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("git_rev"));
        assert!(body.contains("uptime_seconds"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/metrics", "127.0.0.1:9999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("gantry_dhcp_packets_received_total"));
    }

    #[tokio::test]
    async fn test_binary_served() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/ipxe/undionly.kpxe", "127.0.0.1:9999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), binary_with_marker().as_slice());
    }

    // The patched binary keeps its length, patch bytes at the marker.
    #[tokio::test]
    async fn test_binary_served_patched() {
        let app = create_router(test_state("", b"set syslog 10.0.0.1"), true, true);
        let response = app
            .oneshot(get_request("/ipxe/undionly.kpxe", "127.0.0.1:9999"))
            .await
            .unwrap();

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), binary_with_marker().len());
        assert_eq!(&bytes[4..4 + 19], b"set syslog 10.0.0.1");
    }

    #[tokio::test]
    async fn test_binary_unknown_404() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/ipxe/missing.efi", "127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_binary_post_405() {
        let app = create_router(test_state("", b""), true, true);
        let mut request = Request::builder()
            .method("POST")
            .uri("/ipxe/undionly.kpxe")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_script_by_mac() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/aa:bb:cc:dd:ee:01/auto.ipxe", "127.0.0.1:9999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = body_string(response).await;
        assert!(body.starts_with("#!ipxe"));
        assert!(body.contains("kernel http://osie.local/img/vmlinuz-x86_64"));
        assert!(body.contains("facility=lab1"));
    }

    #[tokio::test]
    async fn test_script_by_mac_hyphen_form() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/aa-bb-cc-dd-ee-01/auto.ipxe", "127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_script_unknown_mac_404() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/ff:ff:ff:ff:ff:ff/auto.ipxe", "127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // allow_pxe=false means 403 on the script endpoint.
    #[tokio::test]
    async fn test_script_forbidden_403() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/aa:bb:cc:dd:ee:02/auto.ipxe", "127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_script_invalid_mac_400() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/not-a-mac/auto.ipxe", "127.0.0.1:9999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_script_by_ip_uses_peer() {
        let app = create_router(test_state("", b""), true, true);
        let response = app
            .oneshot(get_request("/auto.ipxe", "10.0.0.10:33333"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("set packet_mac aa:bb:cc:dd:ee:01"));
    }

    #[tokio::test]
    async fn test_script_by_ip_honors_forwarded_for_from_trusted_peer() {
        let app = create_router(test_state("192.168.0.0/16", b""), true, true);
        let mut request = get_request("/auto.ipxe", "192.168.1.1:33333");
        request
            .headers_mut()
            .insert("x-forwarded-for", "10.0.0.10".parse().unwrap());

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_script_by_ip_ignores_forwarded_for_from_untrusted_peer() {
        let app = create_router(test_state("192.168.0.0/16", b""), true, true);
        let mut request = get_request("/auto.ipxe", "203.0.113.9:33333");
        request
            .headers_mut()
            .insert("x-forwarded-for", "10.0.0.10".parse().unwrap());

        // The spoofed header must not resolve to the known record.
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // Identical requests render identical bytes.
    #[tokio::test]
    async fn test_script_idempotent() {
        let state = test_state("", b"");
        let first = create_router(state.clone(), true, true)
            .oneshot(get_request("/aa:bb:cc:dd:ee:01/auto.ipxe", "127.0.0.1:1"))
            .await
            .unwrap();
        let second = create_router(state, true, true)
            .oneshot(get_request("/aa:bb:cc:dd:ee:01/auto.ipxe", "127.0.0.1:2"))
            .await
            .unwrap();

        assert_eq!(body_string(first).await, body_string(second).await);
    }
}
