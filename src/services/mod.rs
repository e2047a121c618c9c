pub mod approval;
pub mod batch;
pub mod expiration;
pub mod metrics;
pub mod outbox;
pub mod revocation;
