use std::env;
use std::time::Duration;

use crate::services::expiration::SettlementMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    // Broker
    pub queue_connection_name: String,
    pub queue_prefetch_limit: usize,
    pub queue_poll_interval_ms: u64,
    // Expiration consumers
    pub expiration_consumers: usize,
    pub report_batch_size: u64,
    pub expiration_settlement: SettlementMode,
    // Revocation scheduler
    pub revocation_poll_interval_ms: u64,
    pub revocation_claim_limit: usize,
    pub revocation_lease_seconds: i64,
    // Outbox
    pub outbox_poll_interval_ms: u64,
    pub outbox_batch_size: i64,
    // Ops server
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            queue_connection_name: env::var("QUEUE_CONNECTION_NAME")
                .unwrap_or_else(|_| "consumer".into()),
            queue_prefetch_limit: parsed("QUEUE_PREFETCH_LIMIT", "1000")?,
            queue_poll_interval_ms: parsed("QUEUE_POLL_INTERVAL_MS", "100")?,
            expiration_consumers: parsed("EXPIRATION_CONSUMERS", "5")?,
            report_batch_size: parsed("REPORT_BATCH_SIZE", "10000")?,
            expiration_settlement: env::var("EXPIRATION_SETTLEMENT")
                .unwrap_or_else(|_| "on_schedule".into())
                .parse()?,
            revocation_poll_interval_ms: parsed("REVOCATION_POLL_INTERVAL_MS", "1000")?,
            revocation_claim_limit: parsed("REVOCATION_CLAIM_LIMIT", "100")?,
            revocation_lease_seconds: parsed("REVOCATION_LEASE_SECONDS", "60")?,
            outbox_poll_interval_ms: parsed("OUTBOX_POLL_INTERVAL_MS", "1000")?,
            outbox_batch_size: parsed("OUTBOX_BATCH_SIZE", "100")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("PORT", "9090")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("QUEUE_PREFETCH_LIMIT", self.queue_prefetch_limit as i64),
            ("QUEUE_POLL_INTERVAL_MS", self.queue_poll_interval_ms as i64),
            ("EXPIRATION_CONSUMERS", self.expiration_consumers as i64),
            ("REPORT_BATCH_SIZE", self.report_batch_size as i64),
            ("REVOCATION_POLL_INTERVAL_MS", self.revocation_poll_interval_ms as i64),
            ("REVOCATION_CLAIM_LIMIT", self.revocation_claim_limit as i64),
            ("REVOCATION_LEASE_SECONDS", self.revocation_lease_seconds),
            ("OUTBOX_POLL_INTERVAL_MS", self.outbox_poll_interval_ms as i64),
            ("OUTBOX_BATCH_SIZE", self.outbox_batch_size),
        ];
        for (key, value) in positive {
            if value < 1 {
                anyhow::bail!("{} must be at least 1, got {}", key, value);
            }
        }
        Ok(())
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn revocation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.revocation_poll_interval_ms)
    }

    pub fn revocation_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.revocation_lease_seconds)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn parsed<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.into());
    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e))
}
