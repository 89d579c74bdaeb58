use crate::server::AppState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use botfleet_core::keys;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub leadership: LeadershipInfo,
    pub deployment: DeploymentInfo,
    pub circuit_breakers: BTreeMap<String, BreakerInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipInfo {
    pub is_leader: bool,
    pub instance_id: String,
    pub last_renewal: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub current_deployed: i64,
    pub current_active: i64,
    pub queue_length: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerInfo {
    pub state: String,
    pub failures: u32,
}

/// Liveness report. Coord reads are best-effort here: a degraded store
/// zeroes the deployment figures rather than failing the probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let leader = state.leader_rx.borrow().clone();

    let current_deployed = state.coord.scard(keys::DEPLOYED_SET).await.unwrap_or(0);
    let current_active = state.coord.scard(keys::ACTIVE_SET).await.unwrap_or(0);
    let queue_length = state.coord.llen(keys::ROTATION_QUEUE).await.unwrap_or(0);

    let circuit_breakers = state
        .breakers
        .snapshots()
        .into_iter()
        .map(|snapshot| {
            (
                snapshot.endpoint.to_string(),
                BreakerInfo {
                    state: snapshot.state.name().to_string(),
                    failures: snapshot.failures,
                },
            )
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        leadership: LeadershipInfo {
            is_leader: leader.is_leader,
            instance_id: leader.instance_id,
            last_renewal: leader.last_renewal,
        },
        deployment: DeploymentInfo {
            current_deployed,
            current_active,
            queue_length,
        },
        circuit_breakers,
    })
}

/// Readiness: 200 only while the coord store answers PING.
pub async fn ready(State(state): State<AppState>) -> StatusCode {
    match state.coord.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("Readiness probe failed: {:#}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Plaintext gauge scrape.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let deployed = state.coord.scard(keys::DEPLOYED_SET).await.unwrap_or(0);
    let active = state.coord.scard(keys::ACTIVE_SET).await.unwrap_or(0);
    let queue_length = state.coord.llen(keys::ROTATION_QUEUE).await.unwrap_or(0);
    let is_leader = i32::from(state.leader_rx.borrow().is_leader);

    let mut body = String::new();
    let _ = writeln!(body, "bots_deployed_total {deployed}");
    let _ = writeln!(body, "bots_active_total {active}");
    let _ = writeln!(body, "bots_queue_length {queue_length}");
    let _ = writeln!(body, "bot_service_is_leader {is_leader}");
    for snapshot in state.breakers.snapshots() {
        let _ = writeln!(
            body,
            "circuit_breaker_state{{endpoint=\"{}\"}} {}",
            snapshot.endpoint,
            snapshot.state.code()
        );
        let _ = writeln!(
            body,
            "circuit_breaker_failures{{endpoint=\"{}\"}} {}",
            snapshot.endpoint, snapshot.failures
        );
    }

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use crate::server::HealthServer;
    use botfleet_controller::LeaderState;
    use botfleet_coord::{CoordStore, MemoryCoord};
    use botfleet_core::keys;
    use botfleet_gameserver::BreakerBoard;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn server(coord: &MemoryCoord, is_leader: bool) -> HealthServer {
        // The receiver keeps serving the last value after the sender drops.
        let (_tx, rx) = watch::channel(LeaderState {
            is_leader,
            instance_id: "test-instance".to_string(),
            last_renewal: None,
        });
        HealthServer::new(Arc::new(coord.clone()), rx, Arc::new(BreakerBoard::new()))
    }

    async fn get_body(server: &HealthServer, path: &str) -> (axum::http::StatusCode, String) {
        let response = server
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reports_deployment_and_leadership() {
        let coord = MemoryCoord::new();
        coord.sadd(keys::DEPLOYED_SET, "bot-1").await.unwrap();
        coord.sadd(keys::DEPLOYED_SET, "bot-2").await.unwrap();
        coord.sadd(keys::ACTIVE_SET, "bot-3").await.unwrap();
        coord.rpush(keys::ROTATION_QUEUE, "bot-4").await.unwrap();

        let (status, body) = get_body(&server(&coord, true), "/health").await;
        assert_eq!(status, axum::http::StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["leadership"]["isLeader"], true);
        assert_eq!(json["leadership"]["instanceId"], "test-instance");
        assert_eq!(json["deployment"]["currentDeployed"], 2);
        assert_eq!(json["deployment"]["currentActive"], 1);
        assert_eq!(json["deployment"]["queueLength"], 1);
        assert!(json["circuitBreakers"]["queue_stats"].is_object());
    }

    #[tokio::test]
    async fn ready_returns_ok_with_live_store() {
        let coord = MemoryCoord::new();
        let (status, _body) = get_body(&server(&coord, false), "/ready").await;
        assert_eq!(status, axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exposes_the_gauges() {
        let coord = MemoryCoord::new();
        coord.sadd(keys::DEPLOYED_SET, "bot-1").await.unwrap();

        let (status, body) = get_body(&server(&coord, false), "/metrics").await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert!(body.contains("bots_deployed_total 1"));
        assert!(body.contains("bots_active_total 0"));
        assert!(body.contains("bot_service_is_leader 0"));
        assert!(body.contains("circuit_breaker_state{endpoint=\"queue_stats\"} 0"));
        assert!(body.contains("circuit_breaker_failures{endpoint=\"global_stats\"} 0"));
    }
}
