use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub db: &'static str,
}

/// `GET /health` — always 200; DEGRADED when the database ping fails.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut response = HealthResponse {
        status: "UP",
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        db: "UP",
    };

    if let Err(e) = state.repo.ping().await {
        error!(error = %e, "Database health check failed");
        response.status = "DEGRADED";
        response.db = "DOWN";
    }

    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes_expected_fields() {
        let response = HealthResponse {
            status: "UP",
            timestamp: Utc::now(),
            version: "0.1.0",
            db: "UP",
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "UP");
        assert_eq!(value["db"], "UP");
        assert!(value["timestamp"].is_string());
    }
}
