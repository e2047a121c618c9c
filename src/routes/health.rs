use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => Ok("connected".to_string()),
        Err(e) => Err(e.to_string()),
    };

    let mut conn = state.redis.clone();
    let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
    let redis = pong
        .map(|_| "connected".to_string())
        .map_err(|e| e.to_string());

    let healthy = db.is_ok() && redis.is_ok();
    let body = json!({
        "status": if healthy { "ok" } else { "error" },
        "db": db.unwrap_or_else(|e| e),
        "redis": redis.unwrap_or_else(|e| e),
    });

    if healthy {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}
