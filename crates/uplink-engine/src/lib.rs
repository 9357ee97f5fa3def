//! Uplink Engine - Protocol clients, worker pool, and event bus
//!
//! This crate provides:
//! - One client per transfer protocol behind a uniform `Transport` contract
//! - A bounded worker pool that schedules, retries, and cancels uploads
//! - An event bus carrying progress and terminal events to the shell
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Shell (external)                        │
//! │  submit_batch / cancel / pause / resume      EventStream    │
//! └──────────────┬─────────────────────────────────────▲────────┘
//!                │                                     │
//!                ▼                                     │
//! ┌─────────────────────────────┐         ┌────────────┴────────┐
//! │         Scheduler           │────────▶│      EventBus       │
//! │  slots, retries, backoff    │ events  │ bounded, coalescing │
//! └──────┬───────────────┬──────┘         └─────────────────────┘
//!        │               │
//!        ▼               ▼
//! ┌────────────┐  ┌────────────────────────────────────────────┐
//! │   Vault    │  │  SessionPool ──▶ Transport (ProtocolClient)│
//! │ (uplink-   │  │  FTP/FTPS, SFTP, HTTP/HTTPS, WebDAV,       │
//! │  core)     │  │  S3, Dropbox                               │
//! └────────────┘  └────────────────────────────────────────────┘
//! ```
//!
//! Workers never touch shell state; everything they report is an
//! immutable [`uplink_core::TransferEvent`].

pub mod event_bus;
pub mod planner;
pub mod progress;
pub mod protocol;
pub mod scheduler;
pub mod session_pool;
pub mod throttle;

pub use event_bus::{channel, EventBus, EventBusStatsSnapshot, EventStream};
pub use planner::{plan, plan_all, DirectoryRequest, PlanError, PlanOptions, UploadPlan};
pub use progress::ProgressReporter;
pub use protocol::{
    ProtocolClient, Session, SessionHandle, Transport, UploadContext, UploadRequest, UploadResult,
};
pub use scheduler::{BatchHandle, BatchSummary, Scheduler, SchedulerStatsSnapshot};
pub use session_pool::{SessionKey, SessionPool, SessionPoolConfig, SessionPoolStatsSnapshot};
pub use throttle::Throttle;

use std::sync::Arc;

use uplink_core::{Config, Vault};

/// Production scheduler wired to the real protocol clients
pub type Engine = Scheduler<ProtocolClient>;

/// Build an engine and the event stream the shell reads from
pub fn engine(config: &Config, vault: Arc<Vault>) -> (Engine, EventStream) {
    let (bus, events) = channel(config.events.buffer_capacity);
    let scheduler = Scheduler::new(config, ProtocolClient::new(config), vault, bus);
    (scheduler, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_core::crypto::MasterKey;
    use uplink_core::keystore::KeySource;
    use uplink_core::VaultConfig;

    #[tokio::test]
    async fn test_engine_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(
            dir.path().join("vault.json"),
            KeySource::Key(MasterKey::generate().unwrap()),
            &VaultConfig::default(),
        )
        .unwrap();

        let (engine, mut events) = engine(&Config::default(), Arc::new(vault));
        let handle = engine.submit_batch(Vec::new());
        let summary = engine.wait_batch(handle.batch_id).await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(events.try_recv().is_none());
        engine.shutdown().await;
    }
}
