//! Background tidy of expired certificates, revocations and ACME state,
//! plus the auto-tidy scheduler.

use crate::acme::AccountStatus;
use crate::backend::Backend;
use crate::certutil::CertInfo;
use crate::counter::CountKind;
use crate::error::{PkiError, Result};
use crate::fields::{duration_secs, Field, FieldData, FieldType};
use crate::revocation::build_crl;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const TIDY_FIELDS: &[Field] = &[
    Field::new("tidy_cert_store", FieldType::Bool),
    Field::new("tidy_revoked_certs", FieldType::Bool),
    Field::new("tidy_revocation_list", FieldType::Bool),
    Field::new("tidy_acme", FieldType::Bool),
    Field::new("safety_buffer", FieldType::Duration),
    Field::new("acme_account_safety_buffer", FieldType::Duration),
    Field::new("pause_duration", FieldType::Duration),
];

pub const AUTO_TIDY_FIELDS: &[Field] = &[
    Field::new("enabled", FieldType::Bool),
    Field::new("interval_duration", FieldType::Duration),
    Field::new("tidy_cert_store", FieldType::Bool),
    Field::new("tidy_revoked_certs", FieldType::Bool),
    Field::new("tidy_revocation_list", FieldType::Bool),
    Field::new("tidy_acme", FieldType::Bool),
    Field::new("safety_buffer", FieldType::Duration),
    Field::new("acme_account_safety_buffer", FieldType::Duration),
    Field::new("pause_duration", FieldType::Duration),
    Field::new("maintain_stored_certificate_counts", FieldType::Bool),
    Field::new("publish_stored_certificate_count_metrics", FieldType::Bool),
];

/// What a tidy run does. Also persisted as the auto-tidy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TidyConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval_duration: Duration,
    pub tidy_cert_store: bool,
    pub tidy_revoked_certs: bool,
    pub tidy_acme: bool,
    #[serde(with = "duration_secs")]
    pub safety_buffer: Duration,
    #[serde(with = "duration_secs")]
    pub acme_account_safety_buffer: Duration,
    #[serde(with = "duration_secs")]
    pub pause_duration: Duration,
    pub maintain_stored_certificate_counts: bool,
    pub publish_stored_certificate_count_metrics: bool,
}

impl Default for TidyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_duration: Duration::from_secs(12 * 3600),
            tidy_cert_store: false,
            tidy_revoked_certs: false,
            tidy_acme: false,
            safety_buffer: Duration::from_secs(72 * 3600),
            acme_account_safety_buffer: Duration::from_secs(30 * 24 * 3600),
            pause_duration: Duration::ZERO,
            maintain_stored_certificate_counts: false,
            publish_stored_certificate_count_metrics: false,
        }
    }
}

impl TidyConfig {
    /// Applies the fields present in `data` on top of `self`.
    pub fn merge(mut self, data: &FieldData) -> Result<Self> {
        if let Some(v) = data.bool("enabled")? {
            self.enabled = v;
        }
        if let Some(v) = data.duration("interval_duration")? {
            self.interval_duration = v;
        }
        if let Some(v) = data.bool("tidy_cert_store")? {
            self.tidy_cert_store = v;
        }
        if let Some(v) = data.bool("tidy_revocation_list")? {
            self.tidy_revoked_certs = v;
        }
        if let Some(v) = data.bool("tidy_revoked_certs")? {
            self.tidy_revoked_certs = v;
        }
        if let Some(v) = data.bool("tidy_acme")? {
            self.tidy_acme = v;
        }
        if let Some(v) = data.duration("safety_buffer")? {
            self.safety_buffer = v;
        }
        if let Some(v) = data.duration("acme_account_safety_buffer")? {
            self.acme_account_safety_buffer = v;
        }
        if let Some(v) = data.duration("pause_duration")? {
            self.pause_duration = v;
        }
        if let Some(v) = data.bool("maintain_stored_certificate_counts")? {
            self.maintain_stored_certificate_counts = v;
        }
        if let Some(v) = data.bool("publish_stored_certificate_count_metrics")? {
            self.publish_stored_certificate_count_metrics = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.safety_buffer < Duration::from_secs(1) {
            return Err(PkiError::user("safety_buffer must be greater than zero"));
        }
        if self.acme_account_safety_buffer < Duration::from_secs(1) {
            return Err(PkiError::user(
                "acme_account_safety_buffer must be greater than zero",
            ));
        }
        if self.enabled && self.interval_duration.is_zero() {
            return Err(PkiError::user("interval_duration must be greater than zero"));
        }
        if self.publish_stored_certificate_count_metrics && !self.maintain_stored_certificate_counts {
            return Err(PkiError::user(
                "cannot publish certificate count metrics without maintain_stored_certificate_counts",
            ));
        }
        Ok(())
    }

    pub fn any_operation_enabled(&self) -> bool {
        self.tidy_cert_store || self.tidy_revoked_certs || self.tidy_acme
    }

    pub fn to_response(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "interval_duration": self.interval_duration.as_secs(),
            "tidy_cert_store": self.tidy_cert_store,
            "tidy_revoked_certs": self.tidy_revoked_certs,
            "tidy_acme": self.tidy_acme,
            "safety_buffer": self.safety_buffer.as_secs(),
            "acme_account_safety_buffer": self.acme_account_safety_buffer.as_secs(),
            "pause_duration": humantime::format_duration(self.pause_duration).to_string(),
            "maintain_stored_certificate_counts": self.maintain_stored_certificate_counts,
            "publish_stored_certificate_count_metrics": self.publish_stored_certificate_count_metrics,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TidyState {
    Inactive = 0,
    Running = 1,
    Finished = 2,
    Error = 3,
    Cancelling = 4,
    Cancelled = 5,
}

impl TidyState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TidyState::Running,
            2 => TidyState::Finished,
            3 => TidyState::Error,
            4 => TidyState::Cancelling,
            5 => TidyState::Cancelled,
            _ => TidyState::Inactive,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TidyProgress {
    config: Option<TidyConfig>,
    error: Option<String>,
    message: String,
    time_started: Option<DateTime<Utc>>,
    time_finished: Option<DateTime<Utc>>,
    cert_store_deleted_count: u64,
    revoked_cert_deleted_count: u64,
    acme_orders_deleted_count: u64,
    acme_account_revoked_count: u64,
    acme_account_deleted_count: u64,
    total_acme_account_count: u64,
}

/// Shared state of the (single) tidy task.
pub struct TidyTracker {
    running: AtomicBool,
    state: AtomicU8,
    cancel: Mutex<Option<CancellationToken>>,
    progress: Mutex<TidyProgress>,
    last_auto_tidy_finished: Mutex<DateTime<Utc>>,
}

impl Default for TidyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TidyTracker {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(TidyState::Inactive as u8),
            cancel: Mutex::new(None),
            progress: Mutex::new(TidyProgress::default()),
            last_auto_tidy_finished: Mutex::new(Utc::now()),
        }
    }

    pub fn state(&self) -> TidyState {
        TidyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TidyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_auto_tidy_finished(&self) -> DateTime<Utc> {
        *self.last_auto_tidy_finished.lock()
    }

    /// Requests cancellation; false when no tidy is running.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        if let Some(token) = self.cancel.lock().as_ref() {
            if !token.is_cancelled() {
                token.cancel();
                self.set_state(TidyState::Cancelling);
                info!("Tidy cancellation requested");
            }
        }
        true
    }

    fn message(&self, message: String) {
        self.progress.lock().message = message;
    }

    /// `tidy-status` body.
    pub fn status(&self, backend: &Backend) -> Value {
        let progress = self.progress.lock().clone();
        let (cert_count, revoked_count) = backend.counter().counts();
        let counting = backend.counter().is_enabled() && backend.counter().is_initialized();
        let config = progress.config.as_ref();

        json!({
            "state": self.state(),
            "error": progress.error,
            "message": progress.message,
            "time_started": progress.time_started.map(|t| t.to_rfc3339()),
            "time_finished": progress.time_finished.map(|t| t.to_rfc3339()),
            "tidy_cert_store": config.map(|c| c.tidy_cert_store),
            "tidy_revoked_certs": config.map(|c| c.tidy_revoked_certs),
            "tidy_acme": config.map(|c| c.tidy_acme),
            "safety_buffer": config.map(|c| c.safety_buffer.as_secs()),
            "acme_account_safety_buffer": config.map(|c| c.acme_account_safety_buffer.as_secs()),
            "pause_duration": config.map(|c| humantime::format_duration(c.pause_duration).to_string()),
            "cert_store_deleted_count": progress.cert_store_deleted_count,
            "revoked_cert_deleted_count": progress.revoked_cert_deleted_count,
            "acme_orders_deleted_count": progress.acme_orders_deleted_count,
            "acme_account_revoked_count": progress.acme_account_revoked_count,
            "acme_account_deleted_count": progress.acme_account_deleted_count,
            "total_acme_account_count": progress.total_acme_account_count,
            "current_cert_store_count": counting.then_some(cert_count),
            "current_revoked_cert_count": counting.then_some(revoked_count),
            "last_auto_tidy_finished": self.last_auto_tidy_finished().to_rfc3339(),
        })
    }
}

enum TidyOutcome {
    Completed,
    Cancelled,
}

/// Starts a tidy run in the background.
///
/// Fails when nothing is enabled or a run is already in progress.
pub fn start_tidy(backend: Arc<Backend>, config: TidyConfig) -> Result<()> {
    if !config.any_operation_enabled() {
        return Err(PkiError::user(
            "tidy request must enable at least one of tidy_cert_store, tidy_revoked_certs or tidy_acme",
        ));
    }
    config.validate()?;

    let tracker = backend.tidy();
    if tracker
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(PkiError::user("tidy operation already in progress"));
    }

    let token = CancellationToken::new();
    *tracker.cancel.lock() = Some(token.clone());
    *tracker.progress.lock() = TidyProgress {
        config: Some(config.clone()),
        time_started: Some(Utc::now()),
        message: "Tidying certificate store".to_string(),
        ..TidyProgress::default()
    };
    tracker.set_state(TidyState::Running);
    info!(
        "Starting tidy (cert_store={}, revoked_certs={}, acme={}, safety_buffer={}s)",
        config.tidy_cert_store,
        config.tidy_revoked_certs,
        config.tidy_acme,
        config.safety_buffer.as_secs()
    );

    tokio::spawn(async move {
        let result = run_tidy(&backend, &config, &token).await;
        let tracker = backend.tidy();
        {
            let mut progress = tracker.progress.lock();
            progress.time_finished = Some(Utc::now());
            match &result {
                Ok(TidyOutcome::Completed) => {
                    progress.message = "Tidy operation successfully completed".to_string();
                }
                Ok(TidyOutcome::Cancelled) => {
                    progress.message = "Tidy operation cancelled".to_string();
                }
                Err(e) => {
                    progress.error = Some(e.to_string());
                    progress.message = "Tidy operation failed".to_string();
                }
            }
        }
        match result {
            Ok(TidyOutcome::Completed) => {
                *tracker.last_auto_tidy_finished.lock() = Utc::now();
                tracker.set_state(TidyState::Finished);
                info!("Tidy finished");
            }
            Ok(TidyOutcome::Cancelled) => {
                tracker.set_state(TidyState::Cancelled);
                info!("Tidy cancelled");
            }
            Err(e) => {
                tracker.set_state(TidyState::Error);
                error!("Error running tidy: {}", e);
            }
        }
        *tracker.cancel.lock() = None;
        tracker.running.store(false, Ordering::Release);
    });

    Ok(())
}

async fn run_tidy(
    backend: &Backend,
    config: &TidyConfig,
    token: &CancellationToken,
) -> Result<TidyOutcome> {
    if config.tidy_cert_store {
        if let TidyOutcome::Cancelled = tidy_cert_store(backend, config, token).await? {
            return Ok(TidyOutcome::Cancelled);
        }
    }
    if config.tidy_revoked_certs {
        if let TidyOutcome::Cancelled = tidy_revoked_certs(backend, config, token).await? {
            return Ok(TidyOutcome::Cancelled);
        }
    }
    if config.tidy_acme {
        if let TidyOutcome::Cancelled = tidy_acme(backend, config, token).await? {
            return Ok(TidyOutcome::Cancelled);
        }
    }
    Ok(TidyOutcome::Completed)
}

/// Sleeps for the configured pause; true when cancelled meanwhile.
async fn pause(config: &TidyConfig, token: &CancellationToken) -> bool {
    if config.pause_duration.is_zero() {
        return token.is_cancelled();
    }
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(config.pause_duration) => token.is_cancelled(),
    }
}

fn expired_beyond(not_after: i64, buffer: Duration, now: i64) -> bool {
    let buffer = i64::try_from(buffer.as_secs()).unwrap_or(i64::MAX);
    now > not_after.saturating_add(buffer)
}

async fn tidy_cert_store(
    backend: &Backend,
    config: &TidyConfig,
    token: &CancellationToken,
) -> Result<TidyOutcome> {
    let storage = backend.storage();
    let tracker = backend.tidy();
    let serials = storage.list_certs().await?;
    let total = serials.len();

    for (i, serial) in serials.iter().enumerate() {
        if pause(config, token).await {
            return Ok(TidyOutcome::Cancelled);
        }
        tracker.message(format!(
            "Tidying certificate store: checking entry {i} of {total}"
        ));

        let Some(der) = storage.fetch_cert_der(serial).await? else {
            continue;
        };
        let info = match CertInfo::from_der(&der) {
            Ok(info) => info,
            Err(e) => {
                return Err(PkiError::internal(format!(
                    "unable to parse stored certificate with serial {serial}: {e}"
                )))
            }
        };
        if expired_beyond(info.not_after, config.safety_buffer, Utc::now().timestamp()) {
            storage.delete_cert(serial).await?;
            backend.counter().decrement(CountKind::Certificates);
            tracker.progress.lock().cert_store_deleted_count += 1;
            debug!("Tidy removed expired certificate {}", serial);
        }
    }
    Ok(TidyOutcome::Completed)
}

async fn tidy_revoked_certs(
    backend: &Backend,
    config: &TidyConfig,
    token: &CancellationToken,
) -> Result<TidyOutcome> {
    let storage = backend.storage();
    let tracker = backend.tidy();

    let serials = storage.list_revoked().await?;
    let total = serials.len();
    let mut deleted_any = false;
    let mut outcome = TidyOutcome::Completed;

    for (i, serial) in serials.iter().enumerate() {
        // The revoke lock is only held per entry, never across a pause.
        if pause(config, token).await {
            outcome = TidyOutcome::Cancelled;
            break;
        }
        tracker.message(format!(
            "Tidying revoked certificates: checking entry {i} of {total}"
        ));

        let _guard = backend.revoke_lock().lock().await;
        let Some(entry) = storage.fetch_revocation(serial).await? else {
            continue;
        };
        let info = CertInfo::from_der(&entry.certificate_bytes).map_err(|e| {
            PkiError::internal(format!("unable to parse stored revoked certificate {serial}: {e}"))
        })?;
        if expired_beyond(info.not_after, config.safety_buffer, Utc::now().timestamp()) {
            storage.delete_revocation(serial).await?;
            backend.counter().decrement(CountKind::Revoked);
            tracker.progress.lock().revoked_cert_deleted_count += 1;
            deleted_any = true;
            debug!("Tidy removed expired revocation {}", serial);
        }
    }

    if deleted_any {
        build_crl(backend).await?;
    }
    Ok(outcome)
}

async fn tidy_acme(
    backend: &Backend,
    config: &TidyConfig,
    token: &CancellationToken,
) -> Result<TidyOutcome> {
    let storage = backend.storage();
    let tracker = backend.tidy();
    let key_ids = storage.list_acme_accounts().await?;
    tracker.progress.lock().total_acme_account_count = key_ids.len() as u64;

    for key_id in key_ids {
        if pause(config, token).await {
            return Ok(TidyOutcome::Cancelled);
        }
        tracker.message(format!("Tidying ACME account {key_id}"));

        let now = Utc::now();
        let mut remaining_orders = 0usize;
        for order_id in storage.list_acme_orders(&key_id).await? {
            let Some(order) = storage.fetch_acme_order(&key_id, &order_id).await? else {
                continue;
            };
            if expired_beyond(order.effective_expiry().timestamp(), config.safety_buffer, now.timestamp()) {
                storage.delete_acme_order(&key_id, &order_id).await?;
                tracker.progress.lock().acme_orders_deleted_count += 1;
            } else {
                remaining_orders += 1;
            }
        }
        if remaining_orders > 0 {
            continue;
        }

        let Some(mut account) = storage.fetch_acme_account(&key_id).await? else {
            continue;
        };
        if !expired_beyond(
            account.created_time.timestamp(),
            config.acme_account_safety_buffer,
            now.timestamp(),
        ) {
            continue;
        }
        match account.status {
            AccountStatus::Revoked | AccountStatus::Deactivated => {
                storage.delete_acme_account(&key_id).await?;
                tracker.progress.lock().acme_account_deleted_count += 1;
                info!("Tidy deleted unused ACME account {}", key_id);
            }
            AccountStatus::Valid => {
                account.status = AccountStatus::Revoked;
                account.revoked_time = Some(now);
                storage.store_acme_account(&account).await?;
                tracker.progress.lock().acme_account_revoked_count += 1;
                info!("Tidy revoked unused ACME account {}", key_id);
            }
        }
    }
    Ok(TidyOutcome::Completed)
}

/// Host-driven periodic hook: starts an auto-tidy when one is due.
pub async fn run_auto_tidy(backend: &Arc<Backend>) -> Result<bool> {
    let config = backend.storage().fetch_auto_tidy_config().await?;
    if !config.enabled || !config.any_operation_enabled() {
        return Ok(false);
    }
    if backend.tidy().is_running() {
        debug!("Auto-tidy skipped: tidy already running");
        return Ok(false);
    }

    let interval = chrono::Duration::from_std(config.interval_duration)
        .map_err(|e| PkiError::internal(format!("invalid auto-tidy interval: {e}")))?;
    if Utc::now() < backend.tidy().last_auto_tidy_finished() + interval {
        return Ok(false);
    }

    info!("Starting scheduled auto-tidy");
    match start_tidy(backend.clone(), config) {
        Ok(()) => Ok(true),
        Err(e) if e.is_user_error() => {
            warn!("Auto-tidy not started: {}", e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
