//! HTTP endpoint receiving transport telemetry

use super::TransportTraffic;
use crate::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Route transports post to
pub const TRAFFIC_PATH: &str = "/api/transports/traffic/";

/// Stores the latest sample posted by the active transport
#[derive(Clone)]
pub struct TrafficReceiver {
    secret: Arc<String>,
    latest: Arc<watch::Sender<Option<TransportTraffic>>>,
}

impl TrafficReceiver {
    pub fn new(secret: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(None);
        TrafficReceiver {
            secret: Arc::new(secret.into()),
            latest: Arc::new(latest),
        }
    }

    pub fn latest(&self) -> Option<TransportTraffic> {
        self.latest.borrow().clone()
    }

    /// Notified on every accepted sample
    pub fn subscribe(&self) -> watch::Receiver<Option<TransportTraffic>> {
        self.latest.subscribe()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(TRAFFIC_PATH, get(get_traffic).post(post_traffic))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> Result<()> {
        info!("Traffic receiver listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|token| constant_time_eq(token.as_bytes(), self.secret.as_bytes()))
            .unwrap_or(false)
    }
}

/// POST /api/transports/traffic/
async fn post_traffic(
    State(receiver): State<TrafficReceiver>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !receiver.authorized(&headers) {
        debug!("traffic post rejected: missing or invalid token");
        return StatusCode::UNAUTHORIZED;
    }
    match serde_json::from_slice::<TransportTraffic>(&body) {
        Ok(traffic) => {
            receiver.latest.send_replace(Some(traffic));
            StatusCode::OK
        }
        Err(e) => {
            debug!("traffic post rejected: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

/// GET /api/transports/traffic/
async fn get_traffic(State(receiver): State<TrafficReceiver>) -> Json<TransportTraffic> {
    Json(receiver.latest().unwrap_or_default())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{post_traffic as send_traffic, ReportEndpoint};

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"wrong"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }

    #[test]
    fn test_authorized() {
        let receiver = TrafficReceiver::new("s3cret");
        let mut headers = HeaderMap::new();
        assert!(!receiver.authorized(&headers));
        headers.insert(AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!receiver.authorized(&headers));
        headers.insert(AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert!(receiver.authorized(&headers));
    }

    #[tokio::test]
    async fn test_post_and_get() {
        let receiver = TrafficReceiver::new("s3cret");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(receiver.clone().serve_listener(listener));

        let url = format!("http://{}{}", addr, TRAFFIC_PATH);
        let client = reqwest::Client::new();
        let traffic = TransportTraffic {
            opened: vec!["1.2.3.4:80".to_string()],
            read_total: 7,
            write_total: 9,
            throughput: 16.0,
        };

        let bad = ReportEndpoint {
            url: url.clone(),
            auth_secret: "nope".to_string(),
        };
        assert!(send_traffic(&client, &bad, &traffic).await.is_err());
        assert!(receiver.latest().is_none());

        let good = ReportEndpoint {
            url: url.clone(),
            auth_secret: "s3cret".to_string(),
        };
        send_traffic(&client, &good, &traffic).await.unwrap();
        assert_eq!(receiver.latest(), Some(traffic.clone()));

        let fetched: TransportTraffic = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(fetched, traffic);
    }
}
