//! Stored-certificate counts, bootstrapped from a one-off listing.

use crate::metrics::MetricSink;
use crate::storage::pki::{CERTS_PREFIX, REVOKED_PREFIX};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    Certificates,
    Revoked,
}

/// Serials seen while the bootstrap listing was still running; each may
/// also appear in that listing.
#[derive(Default)]
struct Pending {
    certs: Vec<String>,
    revoked: Vec<String>,
}

pub struct CertificateCounter {
    enabled: AtomicBool,
    publish_metrics: AtomicBool,
    initialized: AtomicBool,
    cert_count: AtomicU32,
    revoked_count: AtomicU32,
    error: Mutex<Option<String>>,
    pending: Mutex<Pending>,
    metrics: Arc<dyn MetricSink>,
    mount_uuid: String,
}

impl CertificateCounter {
    pub fn new(metrics: Arc<dyn MetricSink>, mount_uuid: impl Into<String>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            publish_metrics: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            cert_count: AtomicU32::new(0),
            revoked_count: AtomicU32::new(0),
            error: Mutex::new(None),
            pending: Mutex::new(Pending::default()),
            metrics,
            mount_uuid: mount_uuid.into(),
        }
    }

    /// Applies the `maintain_stored_certificate_counts` and
    /// `publish_stored_certificate_count_metrics` settings. Turning counting
    /// off resets all state so the next enable bootstraps again.
    pub fn configure(&self, enabled: bool, publish_metrics: bool) {
        let was_enabled = self.enabled.swap(enabled, Ordering::AcqRel);
        self.publish_metrics.store(publish_metrics, Ordering::Release);
        if was_enabled && !enabled {
            let mut pending = self.pending.lock();
            *pending = Pending::default();
            self.initialized.store(false, Ordering::Release);
            self.cert_count.store(0, Ordering::Release);
            self.revoked_count.store(0, Ordering::Release);
            *self.error.lock() = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn counts(&self) -> (u32, u32) {
        (
            self.cert_count.load(Ordering::Acquire),
            self.revoked_count.load(Ordering::Acquire),
        )
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    /// Folds a full listing of `certs/` and `revoked/` into the counters.
    ///
    /// Serials counted by [`increment`](Self::increment) during the listing
    /// that also show up in it are subtracted once.
    pub fn initialize(&self, mut certs: Vec<String>, mut revoked: Vec<String>) {
        if !self.is_enabled() {
            return;
        }
        let mut pending = self.pending.lock();
        if self.is_initialized() {
            return;
        }

        certs.sort();
        revoked.sort();
        pending.certs.sort();
        pending.revoked.sort();

        let cert_overlap = sorted_overlap(&certs, &pending.certs);
        let revoked_overlap = sorted_overlap(&revoked, &pending.revoked);

        add_saturating(&self.cert_count, certs.len() as u32);
        sub_saturating(&self.cert_count, cert_overlap);
        add_saturating(&self.revoked_count, revoked.len() as u32);
        sub_saturating(&self.revoked_count, revoked_overlap);

        *pending = Pending::default();
        *self.error.lock() = None;
        self.initialized.store(true, Ordering::Release);
        drop(pending);

        let (total, total_revoked) = self.counts();
        info!(
            "Certificate counts initialized: {} stored, {} revoked",
            total, total_revoked
        );
        self.emit();
    }

    pub fn increment(&self, kind: CountKind, serial: &str) {
        if !self.is_enabled() {
            return;
        }
        if !self.is_initialized() {
            let mut pending = self.pending.lock();
            // Re-check under the lock: initialize() flips the flag while holding it.
            if !self.is_initialized() {
                self.counter(kind).fetch_add(1, Ordering::AcqRel);
                let (prefix, list) = match kind {
                    CountKind::Certificates => (CERTS_PREFIX, &mut pending.certs),
                    CountKind::Revoked => (REVOKED_PREFIX, &mut pending.revoked),
                };
                list.push(serial.strip_prefix(prefix).unwrap_or(serial).to_string());
                debug!("Buffered {:?} increment for {} during bootstrap", kind, serial);
                return;
            }
        }
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        self.emit();
    }

    /// Decrements are dropped until the bootstrap listing has been folded in.
    pub fn decrement(&self, kind: CountKind) {
        if !self.is_enabled() || !self.is_initialized() {
            return;
        }
        sub_saturating(self.counter(kind), 1);
        self.emit();
    }

    fn counter(&self, kind: CountKind) -> &AtomicU32 {
        match kind {
            CountKind::Certificates => &self.cert_count,
            CountKind::Revoked => &self.revoked_count,
        }
    }

    /// Publishes both gauges when metrics are on and counts are trustworthy.
    pub fn emit(&self) {
        if !self.publish_metrics.load(Ordering::Acquire) || !self.is_initialized() {
            return;
        }
        let (total, revoked) = self.counts();
        self.metrics.set_gauge(
            &["secrets", "pki", &self.mount_uuid, "total_certificates_stored"],
            f64::from(total),
        );
        self.metrics.set_gauge(
            &["secrets", "pki", &self.mount_uuid, "total_revoked_certificates_stored"],
            f64::from(revoked),
        );
    }
}

/// Number of elements present in both sorted slices.
fn sorted_overlap(a: &[String], b: &[String]) -> u32 {
    let (mut i, mut j, mut n) = (0, 0, 0u32);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

fn add_saturating(counter: &AtomicU32, n: u32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_add(n)));
}

fn sub_saturating(counter: &AtomicU32, n: u32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
}
