//! Typed views over the engine's key space.

use crate::acme::{AcmeAccount, AcmeOrder};
use crate::certutil::{
    normalize_serial, CertBundle, ParsedCertBundle, PrivateKey, PrivateKeyFormat, UrlEntries,
};
use crate::error::{PkiError, Result};
use crate::revocation::{CrlConfig, RevocationInfo};
use crate::role::RoleEntry;
use crate::storage::traits::Storage;
use crate::tidy::TidyConfig;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CA_BUNDLE_KEY: &str = "config/ca_bundle";
pub const CA_KEY: &str = "ca";
pub const CRL_KEY: &str = "crl";
pub const CERTS_PREFIX: &str = "certs/";
pub const REVOKED_PREFIX: &str = "revoked/";
pub const ROLE_PREFIX: &str = "role/";
pub const URLS_KEY: &str = "urls";
pub const CRL_CONFIG_KEY: &str = "config/crl";
pub const PATH_LENGTH_KEY: &str = "pathlength";
pub const AUTO_TIDY_KEY: &str = "config/auto_tidy";
pub const ACME_PREFIX: &str = "acme/";
pub const PENDING_KEY: &str = "config/intermediate_key";

/// Key generated by `intermediate/generate`, waiting for its signed certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingKeyEntry {
    private_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathLengthEntry {
    pub max_path_length: i32,
}

#[derive(Clone)]
pub struct PkiStorage {
    inner: Arc<dyn Storage>,
}

impl PkiStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    pub async fn put_raw(&self, key: &str, value: impl Into<Bytes>) -> Result<()> {
        self.inner.put(key, value.into()).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get(key).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| PkiError::internal(format!("corrupt storage entry at {key}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.inner.put(key, Bytes::from(raw)).await
    }

    pub async fn fetch_ca_bundle(&self) -> Result<Option<CertBundle>> {
        self.get_json(CA_BUNDLE_KEY).await
    }

    /// The CA that signs leaves and CRLs; a user error when none is configured.
    pub async fn fetch_signing_bundle(&self) -> Result<ParsedCertBundle> {
        let bundle = self.fetch_ca_bundle().await?.ok_or_else(|| {
            PkiError::user("backend must be configured with a CA certificate/key")
        })?;
        bundle
            .to_parsed()
            .map_err(|e| PkiError::internal(format!("stored CA information not able to be parsed: {e}")))
    }

    /// Persists the bundle and mirrors the certificate DER under `ca`.
    pub async fn store_ca_bundle(&self, bundle: &ParsedCertBundle) -> Result<()> {
        self.put_json(CA_BUNDLE_KEY, &bundle.to_cert_bundle()?).await?;
        self.put_raw(CA_KEY, bundle.certificate_der.clone()).await
    }

    /// Drops the CA bundle, its certificate mirror and the CRL.
    pub async fn delete_ca(&self) -> Result<()> {
        self.delete(CA_BUNDLE_KEY).await?;
        self.delete(CA_KEY).await?;
        self.delete(CRL_KEY).await
    }

    pub async fn fetch_pending_key(&self) -> Result<Option<PrivateKey>> {
        let entry: Option<PendingKeyEntry> = self.get_json(PENDING_KEY).await?;
        entry
            .map(|e| {
                let block = pem::parse(e.private_key.trim()).map_err(|err| {
                    PkiError::internal(format!("stored intermediate key is corrupt: {err}"))
                })?;
                PrivateKey::from_pem_block(block.tag(), block.contents())
            })
            .transpose()
    }

    pub async fn store_pending_key(&self, key: &PrivateKey) -> Result<()> {
        let entry = PendingKeyEntry {
            private_key: key.to_pem(PrivateKeyFormat::Pkcs8)?,
        };
        self.put_json(PENDING_KEY, &entry).await
    }

    pub async fn delete_pending_key(&self) -> Result<()> {
        self.delete(PENDING_KEY).await
    }

    pub async fn fetch_cert_der(&self, serial: &str) -> Result<Option<Bytes>> {
        self.get_raw(&cert_key(serial)).await
    }

    pub async fn store_cert(&self, serial: &str, der: &[u8]) -> Result<()> {
        self.put_raw(&cert_key(serial), der.to_vec()).await
    }

    pub async fn delete_cert(&self, serial: &str) -> Result<()> {
        self.delete(&cert_key(serial)).await
    }

    pub async fn list_certs(&self) -> Result<Vec<String>> {
        Ok(leaf_entries(self.list(CERTS_PREFIX).await?))
    }

    pub async fn fetch_revocation(&self, serial: &str) -> Result<Option<RevocationInfo>> {
        self.get_json(&revoked_key(serial)).await
    }

    pub async fn store_revocation(&self, serial: &str, info: &RevocationInfo) -> Result<()> {
        self.put_json(&revoked_key(serial), info).await
    }

    pub async fn delete_revocation(&self, serial: &str) -> Result<()> {
        self.delete(&revoked_key(serial)).await
    }

    pub async fn list_revoked(&self) -> Result<Vec<String>> {
        Ok(leaf_entries(self.list(REVOKED_PREFIX).await?))
    }

    pub async fn fetch_role(&self, name: &str) -> Result<Option<RoleEntry>> {
        let role: Option<RoleEntry> = self.get_json(&format!("{ROLE_PREFIX}{name}")).await?;
        Ok(role.map(|mut r| {
            r.upgrade_legacy_fields();
            r
        }))
    }

    pub async fn store_role(&self, name: &str, role: &RoleEntry) -> Result<()> {
        self.put_json(&format!("{ROLE_PREFIX}{name}"), role).await
    }

    pub async fn delete_role(&self, name: &str) -> Result<()> {
        self.delete(&format!("{ROLE_PREFIX}{name}")).await
    }

    pub async fn list_roles(&self) -> Result<Vec<String>> {
        Ok(leaf_entries(self.list(ROLE_PREFIX).await?))
    }

    pub async fn fetch_urls(&self) -> Result<UrlEntries> {
        Ok(self.get_json(URLS_KEY).await?.unwrap_or_default())
    }

    pub async fn store_urls(&self, urls: &UrlEntries) -> Result<()> {
        self.put_json(URLS_KEY, urls).await
    }

    pub async fn fetch_crl_config(&self) -> Result<CrlConfig> {
        Ok(self.get_json(CRL_CONFIG_KEY).await?.unwrap_or_default())
    }

    pub async fn store_crl_config(&self, config: &CrlConfig) -> Result<()> {
        self.put_json(CRL_CONFIG_KEY, config).await
    }

    pub async fn fetch_path_length(&self) -> Result<Option<i32>> {
        let entry: Option<PathLengthEntry> = self.get_json(PATH_LENGTH_KEY).await?;
        Ok(entry.map(|e| e.max_path_length))
    }

    pub async fn store_path_length(&self, max_path_length: i32) -> Result<()> {
        self.put_json(PATH_LENGTH_KEY, &PathLengthEntry { max_path_length }).await
    }

    pub async fn fetch_auto_tidy_config(&self) -> Result<TidyConfig> {
        Ok(self.get_json(AUTO_TIDY_KEY).await?.unwrap_or_default())
    }

    pub async fn store_auto_tidy_config(&self, config: &TidyConfig) -> Result<()> {
        self.put_json(AUTO_TIDY_KEY, config).await
    }

    pub async fn list_acme_accounts(&self) -> Result<Vec<String>> {
        Ok(leaf_entries(self.list(ACME_PREFIX).await?))
    }

    pub async fn fetch_acme_account(&self, key_id: &str) -> Result<Option<AcmeAccount>> {
        self.get_json(&format!("{ACME_PREFIX}{key_id}")).await
    }

    pub async fn store_acme_account(&self, account: &AcmeAccount) -> Result<()> {
        self.put_json(&format!("{ACME_PREFIX}{}", account.key_id), account).await
    }

    pub async fn delete_acme_account(&self, key_id: &str) -> Result<()> {
        self.delete(&format!("{ACME_PREFIX}{key_id}")).await
    }

    pub async fn list_acme_orders(&self, key_id: &str) -> Result<Vec<String>> {
        Ok(leaf_entries(self.list(&orders_prefix(key_id)).await?))
    }

    pub async fn fetch_acme_order(&self, key_id: &str, order_id: &str) -> Result<Option<AcmeOrder>> {
        self.get_json(&format!("{}{order_id}", orders_prefix(key_id))).await
    }

    pub async fn store_acme_order(&self, order: &AcmeOrder) -> Result<()> {
        self.put_json(
            &format!("{}{}", orders_prefix(&order.account_id), order.order_id),
            order,
        )
        .await
    }

    pub async fn delete_acme_order(&self, key_id: &str, order_id: &str) -> Result<()> {
        self.delete(&format!("{}{order_id}", orders_prefix(key_id))).await
    }
}

pub fn cert_key(serial: &str) -> String {
    format!("{CERTS_PREFIX}{}", normalize_serial(serial))
}

pub fn revoked_key(serial: &str) -> String {
    format!("{REVOKED_PREFIX}{}", normalize_serial(serial))
}

fn orders_prefix(key_id: &str) -> String {
    format!("{ACME_PREFIX}{key_id}/orders/")
}

fn leaf_entries(children: Vec<String>) -> Vec<String> {
    children.into_iter().filter(|c| !c.ends_with('/')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn storage() -> PkiStorage {
        PkiStorage::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_serials_are_canonicalized() {
        let s = storage();
        s.store_cert("AB-CD-01", b"der").await.unwrap();
        assert!(s.fetch_cert_der("ab:cd:01").await.unwrap().is_some());
        assert_eq!(s.list_certs().await.unwrap(), vec!["ab:cd:01"]);
        s.delete_cert("AB:CD:01").await.unwrap();
        assert!(s.list_certs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_when_absent() {
        let s = storage();
        assert!(s.fetch_urls().await.unwrap().is_empty());
        assert!(!s.fetch_crl_config().await.unwrap().disable);
        assert_eq!(s.fetch_path_length().await.unwrap(), None);
        assert!(s.fetch_role("missing").await.unwrap().is_none());
        let err = s.fetch_signing_bundle().await.unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_internal_error() {
        let s = storage();
        s.put_raw(URLS_KEY, b"{not json".to_vec()).await.unwrap();
        let err = s.fetch_urls().await.unwrap_err();
        assert!(!err.is_user_error());
    }

    #[tokio::test]
    async fn test_acme_listing_skips_order_subtrees() {
        let s = storage();
        let account = AcmeAccount::new("kid-1");
        s.store_acme_account(&account).await.unwrap();
        let order = AcmeOrder::new("kid-1", "order-1");
        s.store_acme_order(&order).await.unwrap();

        assert_eq!(s.list_acme_accounts().await.unwrap(), vec!["kid-1"]);
        assert_eq!(s.list_acme_orders("kid-1").await.unwrap(), vec!["order-1"]);
        assert!(s.fetch_acme_order("kid-1", "order-1").await.unwrap().is_some());
    }
}
