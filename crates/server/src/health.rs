use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use showroom_db::{DbPool, SqlInventoryRepository};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    inventory: Arc<SqlInventoryRepository>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub inventory: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, inventory: Arc<SqlInventoryRepository>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, inventory })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "showroom-server runtime initialized".to_string(),
        },
        database,
        inventory: inventory_check(&state.inventory).await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

// An empty inventory is reported but never degrades the overall status.
async fn inventory_check(inventory: &SqlInventoryRepository) -> HealthCheck {
    match inventory.count().await {
        Ok(0) => HealthCheck { status: "empty", detail: "no listings loaded".to_string() },
        Ok(count) => HealthCheck { status: "ready", detail: format!("{count} listings loaded") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("inventory count failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use showroom_core::domain::inventory::CarListing;
    use showroom_db::repositories::InventoryRepository;
    use showroom_db::{connect_with_settings, migrations, SqlInventoryRepository};

    use crate::health::{health, HealthState};

    async fn state() -> HealthState {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let inventory = Arc::new(SqlInventoryRepository::new(pool.clone()));
        HealthState { db_pool: pool, inventory }
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let state = state().await;
        let pool = state.db_pool.clone();

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.inventory.status, "empty");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_reports_loaded_listings() {
        let state = state().await;
        state
            .inventory
            .replace_all(vec![CarListing { uuid: "car-1".to_string(), ..CarListing::default() }])
            .await
            .expect("replace");

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.inventory.status, "ready");
        assert_eq!(payload.inventory.detail, "1 listings loaded");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let state = state().await;
        state.db_pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.inventory.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}
