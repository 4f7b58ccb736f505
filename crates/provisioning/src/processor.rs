//! Payment processor client trait and in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{ArrangementId, BillingItemId, PayerId};
use domain::Money;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisioningError, Result};

/// Amount the processor will bill the payer at the next invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingCharge {
    pub amount_due: Money,
    pub currency: String,
}

/// A refund issued by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub charge_ref: Option<String>,
    pub amount: Money,
    pub metadata: BTreeMap<String, String>,
}

/// Client for the payment processor, the source of truth for billing.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Adds one billable item to an arrangement.
    async fn create_billing_item(
        &self,
        arrangement: &ArrangementId,
        price_ref: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<BillingItemId>;

    /// Removes a billable item from its arrangement.
    async fn delete_billing_item(&self, item: &BillingItemId) -> Result<()>;

    /// Charges the payer immediately. Returns the charge reference.
    ///
    /// A repeated call with the same `idempotency_key` returns the original
    /// charge instead of creating another.
    async fn create_charge(
        &self,
        payer: &PayerId,
        amount: Money,
        currency: &str,
        description: &str,
        idempotency_key: &str,
    ) -> Result<String>;

    /// Refunds part of a charge. Returns the refund id.
    async fn refund(
        &self,
        charge_ref: Option<&str>,
        amount: Money,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String>;

    async fn get_upcoming_charge(
        &self,
        payer: &PayerId,
        arrangement: &ArrangementId,
    ) -> Result<UpcomingCharge>;

    /// Unit price of a catalog price, if the processor knows it.
    async fn get_unit_price(&self, price_ref: &str) -> Result<Option<Money>>;
}

/// Processor calls that tests can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorCall {
    CreateBillingItem,
    DeleteBillingItem,
    CreateCharge,
    Refund,
    UpcomingCharge,
    UnitPrice,
}

impl ProcessorCall {
    fn name(&self) -> &'static str {
        match self {
            ProcessorCall::CreateBillingItem => "create_billing_item",
            ProcessorCall::DeleteBillingItem => "delete_billing_item",
            ProcessorCall::CreateCharge => "create_charge",
            ProcessorCall::Refund => "refund",
            ProcessorCall::UpcomingCharge => "get_upcoming_charge",
            ProcessorCall::UnitPrice => "get_unit_price",
        }
    }
}

#[derive(Debug, Clone)]
struct BillingItemRecord {
    arrangement: ArrangementId,
    price_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct ChargeRecord {
    charge_id: String,
    amount: Money,
    idempotency_key: String,
}

#[derive(Debug, Default)]
struct InMemoryProcessorState {
    items: HashMap<BillingItemId, BillingItemRecord>,
    charges: Vec<ChargeRecord>,
    refunds: Vec<RefundReceipt>,
    prices: HashMap<String, Money>,
    upcoming: HashMap<ArrangementId, Money>,
    transient_failures: HashMap<ProcessorCall, u32>,
    permanent_failures: HashMap<ProcessorCall, bool>,
    calls: HashMap<ProcessorCall, u32>,
    next_id: u32,
}

/// In-memory payment processor for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentProcessor {
    state: Arc<RwLock<InMemoryProcessorState>>,
}

impl InMemoryPaymentProcessor {
    /// Creates a new in-memory processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls of this kind fail with a transient error.
    pub fn fail_next(&self, call: ProcessorCall, n: u32) {
        self.write().transient_failures.insert(call, n);
    }

    /// Makes every call of this kind fail with a permanent error.
    pub fn set_fail_always(&self, call: ProcessorCall, fail: bool) {
        self.write().permanent_failures.insert(call, fail);
    }

    /// Registers a catalog price.
    pub fn set_unit_price(&self, price_ref: &str, amount: Money) {
        self.write().prices.insert(price_ref.to_string(), amount);
    }

    /// Sets the amount due at the arrangement's next invoice.
    pub fn set_upcoming_charge(&self, arrangement: &ArrangementId, amount: Money) {
        self.write().upcoming.insert(arrangement.clone(), amount);
    }

    /// Number of times a call was attempted, failed or not.
    pub fn call_count(&self, call: ProcessorCall) -> u32 {
        self.read().calls.get(&call).copied().unwrap_or(0)
    }

    /// Number of live billing items.
    pub fn billing_item_count(&self) -> usize {
        self.read().items.len()
    }

    pub fn has_billing_item(&self, item: &BillingItemId) -> bool {
        self.read().items.contains_key(item)
    }

    /// Price reference a live billing item was created with.
    pub fn billing_item_price(&self, item: &BillingItemId) -> Option<String> {
        self.read()
            .items
            .get(item)
            .and_then(|record| record.price_ref.clone())
    }

    /// Billing items attached to an arrangement.
    pub fn billing_items_on(&self, arrangement: &ArrangementId) -> usize {
        self.read()
            .items
            .values()
            .filter(|record| &record.arrangement == arrangement)
            .count()
    }

    /// Every refund issued so far.
    pub fn refunds(&self) -> Vec<RefundReceipt> {
        self.read().refunds.clone()
    }

    /// Every immediate charge created so far.
    pub fn charges(&self) -> Vec<(String, Money)> {
        self.read()
            .charges
            .iter()
            .map(|charge| (charge.charge_id.clone(), charge.amount))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryProcessorState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryProcessorState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Counts the call and applies any configured failure.
    fn begin(&self, call: ProcessorCall) -> Result<std::sync::RwLockWriteGuard<'_, InMemoryProcessorState>> {
        let mut state = self.write();
        *state.calls.entry(call).or_insert(0) += 1;

        if state.permanent_failures.get(&call).copied().unwrap_or(false) {
            return Err(ProvisioningError::permanent(call.name(), "rejected by processor"));
        }
        if let Some(remaining) = state.transient_failures.get_mut(&call)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProvisioningError::transient(call.name(), "processor unavailable"));
        }
        Ok(state)
    }
}

impl InMemoryProcessorState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:06}", self.next_id)
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryPaymentProcessor {
    async fn create_billing_item(
        &self,
        arrangement: &ArrangementId,
        price_ref: Option<&str>,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<BillingItemId> {
        let mut state = self.begin(ProcessorCall::CreateBillingItem)?;
        let id = BillingItemId::new(state.next_id("si"));
        state.items.insert(
            id.clone(),
            BillingItemRecord {
                arrangement: arrangement.clone(),
                price_ref: price_ref.map(str::to_string),
            },
        );
        Ok(id)
    }

    async fn delete_billing_item(&self, item: &BillingItemId) -> Result<()> {
        let mut state = self.begin(ProcessorCall::DeleteBillingItem)?;
        if state.items.remove(item).is_none() {
            return Err(ProvisioningError::permanent(
                "delete_billing_item",
                format!("no such billing item: {item}"),
            ));
        }
        Ok(())
    }

    async fn create_charge(
        &self,
        _payer: &PayerId,
        amount: Money,
        _currency: &str,
        _description: &str,
        idempotency_key: &str,
    ) -> Result<String> {
        let mut state = self.begin(ProcessorCall::CreateCharge)?;
        if let Some(existing) = state
            .charges
            .iter()
            .find(|charge| charge.idempotency_key == idempotency_key)
        {
            return Ok(existing.charge_id.clone());
        }
        let charge_id = state.next_id("ch");
        state.charges.push(ChargeRecord {
            charge_id: charge_id.clone(),
            amount,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(charge_id)
    }

    async fn refund(
        &self,
        charge_ref: Option<&str>,
        amount: Money,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.begin(ProcessorCall::Refund)?;
        if charge_ref.is_none() {
            return Err(ProvisioningError::permanent(
                "refund",
                "no charge reference to refund against",
            ));
        }
        let refund_id = state.next_id("re");
        state.refunds.push(RefundReceipt {
            refund_id: refund_id.clone(),
            charge_ref: charge_ref.map(str::to_string),
            amount,
            metadata: metadata.clone(),
        });
        Ok(refund_id)
    }

    async fn get_upcoming_charge(
        &self,
        _payer: &PayerId,
        arrangement: &ArrangementId,
    ) -> Result<UpcomingCharge> {
        let state = self.begin(ProcessorCall::UpcomingCharge)?;
        Ok(UpcomingCharge {
            amount_due: state.upcoming.get(arrangement).copied().unwrap_or_default(),
            currency: "usd".to_string(),
        })
    }

    async fn get_unit_price(&self, price_ref: &str) -> Result<Option<Money>> {
        let state = self.begin(ProcessorCall::UnitPrice)?;
        Ok(state.prices.get(price_ref).copied())
    }
}
