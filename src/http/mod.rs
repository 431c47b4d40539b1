//! HTTP surface: router assembly plus the health and metrics endpoints.

use crate::download;
use crate::server::Relay;
use crate::stream;
use crate::ws;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

pub mod health;
pub mod metrics;

/// Build the full router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws::handler))
        .route("/file/:token", get(download::request))
        .route(
            "/file/:token/:key",
            get(download::fetch).post(download::upload),
        )
        .route("/stream/:token", get(stream::request))
        .route(
            "/stream/:token/:key",
            get(stream::fetch).post(stream::upload),
        )
        .route("/health", get(health::handler))
        .route("/metrics", get(metrics::handler))
        .with_state(relay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::FileDeclaration;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr()));
        req
    }

    fn relay_with_file() -> (Arc<Relay>, String) {
        let relay = Relay::new(Config::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = relay.register_peer(addr().ip(), tx).unwrap();
        let summaries = peer
            .accept_files(
                vec![FileDeclaration {
                    name: "movie.mp4".into(),
                    size: 1000,
                }],
                &relay.config().keys,
            )
            .unwrap();
        (relay, summaries[0].id.clone())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let relay = Relay::new(Config::default());
        let response = router(relay)
            .oneshot(request("GET", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposes_counters() {
        let relay = Relay::new(Config::default());
        let response = router(relay)
            .oneshot(request("GET", "/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("peerbeam_peers_total"));
        assert!(text.contains("peerbeam_bytes_relayed_total"));
        assert!(text.contains("peerbeam_downloads_active"));
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let relay = Relay::new(Config::default());
        let response = router(relay)
            .oneshot(request("GET", "/file/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_request_redirects_to_a_keyed_url() {
        let (relay, token) = relay_with_file();
        let app = router(Arc::clone(&relay));

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/file/{token}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(location.starts_with(&format!("/file/{token}/")));

        let response = app.clone().oneshot(request("GET", &location)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("movie.mp4"));
        assert_eq!(relay.transfers.download_count(), 1);

        // The key was consumed; replaying the redirect is gone.
        let response = app.oneshot(request("GET", &location)).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn stream_request_redirects_with_found() {
        let (relay, token) = relay_with_file();
        let app = router(relay);
        let response = app
            .oneshot(request("GET", &format!("/stream/{token}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers().contains_key(header::LOCATION));
    }

    #[tokio::test]
    async fn stream_without_range_is_a_plain_200() {
        let (relay, token) = relay_with_file();
        let key = relay.transfers.create_stream_key(&token).unwrap();
        let app = router(relay);

        let response = app
            .oneshot(request("GET", &format!("/stream/{token}/{key}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::CONTENT_RANGE));
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "1000"
        );
    }

    #[tokio::test]
    async fn explicit_range_gets_partial_content() {
        let (relay, token) = relay_with_file();
        let key = relay.transfers.create_stream_key(&token).unwrap();
        let app = router(Arc::clone(&relay));

        let mut req = Request::builder()
            .method("GET")
            .uri(format!("/stream/{token}/{key}"))
            .header(header::RANGE, "bytes=500-")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr()));

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 500-999/1000"
        );
        assert_eq!(relay.transfers.stream_count(), 1);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_rejected() {
        let (relay, token) = relay_with_file();
        let key = relay.transfers.create_stream_key(&token).unwrap();
        let app = router(relay);

        let mut req = Request::builder()
            .method("GET")
            .uri(format!("/stream/{token}/{key}"))
            .header(header::RANGE, "bytes=2000-3000")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr()));

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn upload_to_unknown_download_is_a_bad_request() {
        let relay = Relay::new(Config::default());
        let response = router(relay)
            .oneshot(request("POST", "/file/tok/transfer-id"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_to_unknown_stream_is_no_content() {
        let relay = Relay::new(Config::default());
        let response = router(relay)
            .oneshot(request("POST", "/stream/tok/transfer-id"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
