//! The payer's current-state entry in the key-value cache.

use common::{ArrangementId, BillingItemId, PayerId};
use domain::{License, LicenseKey};
use serde::{Deserialize, Serialize};
use store::{CacheKey, KeyValueCache, RecordStore};

use crate::error::Result;

/// One active license as seen by low-latency readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLicense {
    pub license_key: LicenseKey,
    pub billing_item_id: BillingItemId,
    pub arrangement_id: ArrangementId,
    pub bound_resource_id: Option<String>,
}

impl From<&License> for CachedLicense {
    fn from(license: &License) -> Self {
        Self {
            license_key: license.license_key.clone(),
            billing_item_id: license.billing_item_id.clone(),
            arrangement_id: license.billing_arrangement_id.clone(),
            bound_resource_id: license.bound_resource_id.clone(),
        }
    }
}

/// Builds the cached view from the payer's licenses, keeping active ones.
pub fn active_entries(licenses: &[License]) -> Vec<CachedLicense> {
    licenses
        .iter()
        .filter(|l| l.is_active())
        .map(CachedLicense::from)
        .collect()
}

/// Rewrites the payer's entry from the relational store.
pub async fn refresh<S, C>(store: &S, cache: &C, payer_id: &PayerId) -> Result<()>
where
    S: RecordStore,
    C: KeyValueCache,
{
    let licenses = store.licenses_for_payer(payer_id).await?;
    let value = serde_json::to_value(active_entries(&licenses))?;
    cache.put(&CacheKey::payer_licenses(payer_id), value).await?;
    Ok(())
}

/// Refreshes the entry, logging instead of failing.
pub async fn refresh_best_effort<S, C>(store: &S, cache: &C, payer_id: &PayerId)
where
    S: RecordStore,
    C: KeyValueCache,
{
    if let Err(err) = refresh(store, cache, payer_id).await {
        metrics::counter!("cache_writes_failed_total").increment(1);
        tracing::warn!(payer_id = %payer_id, error = %err, "payer cache refresh failed");
    }
}
