//! Persisted ACME accounts and orders, and their management operations.

use super::errors::{AcmeError, AcmeErrorType};
use crate::error::{PkiError, Result};
use crate::storage::PkiStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

pub const DEFAULT_DIRECTORY: &str = "acme/";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Revoked,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Valid => "valid",
            AccountStatus::Revoked => "revoked",
            AccountStatus::Deactivated => "deactivated",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// External account binding that was used to create an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EabBinding {
    pub eab_id: String,
    pub key_type: String,
    pub directory: String,
    pub created_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcmeAccount {
    pub key_id: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default = "default_directory")]
    pub directory: String,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub revoked_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub eab: Option<EabBinding>,
}

fn default_directory() -> String {
    DEFAULT_DIRECTORY.to_string()
}

impl AcmeAccount {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            status: AccountStatus::Valid,
            contact: Vec::new(),
            directory: default_directory(),
            created_time: Utc::now(),
            revoked_time: None,
            eab: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcmeOrder {
    pub order_id: String,
    pub account_id: String,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub cert_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cert_serial_number: String,
}

impl AcmeOrder {
    /// A pending order that expires a week from now.
    pub fn new(account_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            account_id: account_id.into(),
            status: OrderStatus::Pending,
            expires: Utc::now() + chrono::Duration::days(7),
            cert_expiry: None,
            cert_serial_number: String::new(),
        }
    }

    /// The certificate's expiry, or the order's own expiry when no certificate was issued.
    pub fn effective_expiry(&self) -> DateTime<Utc> {
        self.cert_expiry.unwrap_or(self.expires)
    }
}

fn account_missing(key_id: &str) -> PkiError {
    AcmeError::new(
        AcmeErrorType::AccountDoesNotExist,
        format!("ACME account with key_id {key_id} did not exist"),
    )
    .into()
}

pub async fn list_account_key_ids(storage: &PkiStorage) -> Result<Vec<String>> {
    storage.list_acme_accounts().await
}

/// Management view of an account and its orders.
pub async fn read_account(storage: &PkiStorage, key_id: &str) -> Result<Value> {
    let account = storage
        .fetch_acme_account(key_id)
        .await?
        .ok_or_else(|| account_missing(key_id))?;
    account_response(storage, &account).await
}

/// Sets an account's status to `valid` or `revoked`.
pub async fn update_account_status(storage: &PkiStorage, key_id: &str, status: &str) -> Result<Value> {
    let mut account = storage
        .fetch_acme_account(key_id)
        .await?
        .ok_or_else(|| account_missing(key_id))?;

    match status.trim().to_lowercase().as_str() {
        "valid" => {
            account.status = AccountStatus::Valid;
            account.revoked_time = None;
        }
        "revoked" => {
            if account.status != AccountStatus::Revoked {
                account.revoked_time = Some(Utc::now());
            }
            account.status = AccountStatus::Revoked;
        }
        other => {
            return Err(PkiError::user(format!(
                "invalid status {other:?}: only \"valid\" and \"revoked\" may be set"
            )))
        }
    }

    storage.store_acme_account(&account).await?;
    info!("ACME account {} set to {}", key_id, account.status.as_str());
    account_response(storage, &account).await
}

async fn account_response(storage: &PkiStorage, account: &AcmeAccount) -> Result<Value> {
    let mut orders = Vec::new();
    for order_id in storage.list_acme_orders(&account.key_id).await? {
        if let Some(order) = storage.fetch_acme_order(&account.key_id, &order_id).await? {
            orders.push(json!({
                "order_id": order.order_id,
                "status": order.status,
                "cert_expiry": order.cert_expiry.map(|t| t.to_rfc3339()),
                "cert_serial_number": order.cert_serial_number,
            }));
        }
    }

    Ok(json!({
        "directory": account.directory,
        "key_id": account.key_id,
        "status": account.status.as_str(),
        "created_time": account.created_time.to_rfc3339(),
        "revoked_time": account.revoked_time.map(|t| t.to_rfc3339()),
        "orders": orders,
        "eab": account.eab.as_ref().map(|eab| json!({
            "eab_id": eab.eab_id,
            "key_type": eab.key_type,
            "directory": eab.directory,
            "created_time": eab.created_time.to_rfc3339(),
        })).unwrap_or_else(|| json!({})),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use std::sync::Arc;

    fn storage() -> PkiStorage {
        PkiStorage::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_read_account_with_orders() {
        let s = storage();
        s.store_acme_account(&AcmeAccount::new("kid-1")).await.unwrap();
        let mut order = AcmeOrder::new("kid-1", "order-1");
        order.status = OrderStatus::Valid;
        order.cert_serial_number = "1a:2b".to_string();
        order.cert_expiry = Some(Utc::now());
        s.store_acme_order(&order).await.unwrap();

        let view = read_account(&s, "kid-1").await.unwrap();
        assert_eq!(view["directory"], "acme/");
        assert_eq!(view["status"], "valid");
        assert!(view["revoked_time"].is_null());
        assert_eq!(view["orders"][0]["order_id"], "order-1");
        assert_eq!(view["orders"][0]["status"], "valid");
        assert_eq!(view["orders"][0]["cert_serial_number"], "1a:2b");
        assert_eq!(list_account_key_ids(&s).await.unwrap(), vec!["kid-1"]);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let s = storage();
        s.store_acme_account(&AcmeAccount::new("kid-1")).await.unwrap();

        let view = update_account_status(&s, "kid-1", "revoked").await.unwrap();
        assert_eq!(view["status"], "revoked");
        assert!(view["revoked_time"].is_string());

        let view = update_account_status(&s, "kid-1", "valid").await.unwrap();
        assert_eq!(view["status"], "valid");
        assert!(view["revoked_time"].is_null());

        let err = update_account_status(&s, "kid-1", "deactivated").await.unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_missing_account() {
        let s = storage();
        let err = update_account_status(&s, "ghost", "revoked").await.unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("did not exist"));
        assert!(matches!(err, PkiError::Acme(ref e) if e.kind() == AcmeErrorType::AccountDoesNotExist));
        assert!(read_account(&s, "ghost").await.is_err());
    }
}
