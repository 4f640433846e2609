//! Engine state shared by every request handler.

use crate::counter::CertificateCounter;
use crate::creation::SystemView;
use crate::error::Result;
use crate::metrics::MetricSink;
use crate::storage::{PkiStorage, Storage};
use crate::tidy::{run_auto_tidy, TidyConfig, TidyTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Backend {
    storage: PkiStorage,
    revoke_lock: Mutex<()>,
    counter: CertificateCounter,
    tidy: TidyTracker,
    system: SystemView,
    metrics: Arc<dyn MetricSink>,
    mount_uuid: String,
}

impl Backend {
    pub fn new(
        storage: Arc<dyn Storage>,
        system: SystemView,
        metrics: Arc<dyn MetricSink>,
        mount_uuid: impl Into<String>,
    ) -> Arc<Self> {
        let mount_uuid = mount_uuid.into();
        Arc::new(Self {
            storage: PkiStorage::new(storage),
            revoke_lock: Mutex::new(()),
            counter: CertificateCounter::new(metrics.clone(), mount_uuid.clone()),
            tidy: TidyTracker::new(),
            system,
            metrics,
            mount_uuid,
        })
    }

    pub fn storage(&self) -> &PkiStorage {
        &self.storage
    }

    /// Serializes revocation, CRL rebuilds and tidy of `revoked/`.
    pub fn revoke_lock(&self) -> &Mutex<()> {
        &self.revoke_lock
    }

    pub fn counter(&self) -> &CertificateCounter {
        &self.counter
    }

    pub fn tidy(&self) -> &TidyTracker {
        &self.tidy
    }

    pub fn system(&self) -> &SystemView {
        &self.system
    }

    pub fn metrics(&self) -> &Arc<dyn MetricSink> {
        &self.metrics
    }

    pub fn mount_uuid(&self) -> &str {
        &self.mount_uuid
    }

    /// Mount-time setup: applies the stored counter settings.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let config = self.storage.fetch_auto_tidy_config().await?;
        self.apply_counter_config(&config);
        info!("PKI backend {} initialized", self.mount_uuid);
        Ok(())
    }

    /// Reconfigures the certificate counter and, when counting was just
    /// switched on, starts the bootstrap listing in the background.
    pub fn apply_counter_config(self: &Arc<Self>, config: &TidyConfig) {
        self.counter.configure(
            config.maintain_stored_certificate_counts,
            config.publish_stored_certificate_count_metrics,
        );
        if self.counter.is_enabled() && !self.counter.is_initialized() {
            let backend = self.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.initialize_counts().await {
                    error!("Failed to initialize certificate counts: {}", e);
                    backend.counter.set_error(e.to_string());
                }
            });
        } else {
            self.counter.emit();
        }
    }

    /// Loads the full `certs/` and `revoked/` listings into the counter.
    pub async fn initialize_counts(&self) -> Result<()> {
        let certs = self.storage.list_certs().await?;
        let revoked = self.storage.list_revoked().await?;
        debug!(
            "Certificate count bootstrap listed {} certs and {} revocations",
            certs.len(),
            revoked.len()
        );
        self.counter.initialize(certs, revoked);
        Ok(())
    }

    /// Host periodic callback.
    pub async fn periodic_func(self: &Arc<Self>) -> Result<()> {
        run_auto_tidy(self).await?;
        Ok(())
    }

    /// Calls [`Backend::periodic_func`] every `interval` until `shutdown` fires.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Periodic task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = backend.periodic_func().await {
                            error!("Periodic function failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CountKind;
    use crate::metrics::PrometheusSink;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_counter_bootstrap_from_listing() {
        let sink = PrometheusSink::new();
        let backend = Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            sink.clone(),
            "mount-1",
        );
        backend.storage().store_cert("01:02", b"a").await.unwrap();
        backend.storage().store_cert("03:04", b"b").await.unwrap();

        backend.counter().configure(true, true);
        backend.counter().increment(CountKind::Certificates, "03:04");
        backend.initialize_counts().await.unwrap();

        assert!(backend.counter().is_initialized());
        assert_eq!(backend.counter().counts(), (2, 0));
        assert_eq!(
            sink.gauge_value(&["secrets", "pki", "mount-1", "total_certificates_stored"]),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_periodic_without_auto_tidy_is_noop() {
        let backend = Backend::new(
            Arc::new(InMemoryStorage::new()),
            SystemView::default(),
            Arc::new(crate::metrics::NoopSink),
            "mount-1",
        );
        backend.initialize().await.unwrap();
        backend.periodic_func().await.unwrap();
        assert!(!backend.tidy().is_running());
    }
}
