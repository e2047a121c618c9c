// Library exports for the worker, the admin tool and tests
pub mod config;
pub mod db;
pub mod models;
pub mod queue;
pub mod routes;
pub mod services;

use sqlx::PgPool;

/// State shared by the ops handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: redis::aio::MultiplexedConnection,
}
