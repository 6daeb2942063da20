use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use cp_base::{Money, OrgId, Provider, RunId};
use cp_store::{
    CreditBalance, DurableStore, ReconciliationRow, TokenCallRequest, TokenRecord,
};
use dashmap_like::OrgLimiters;
use governor::{Quota, RateLimiter};
use tracing::{error, info, warn};

use crate::error::{BillingError, Result};
use crate::pricing::{cost_for_tokens, PricingCache};
use crate::token_counter::TokenCounter;

/// Internal operating mode, self-demoted after repeated charge-path
/// failures. Stored as a `u8` behind an atomic so every
/// call site can cheaply check it without a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Normal,
    ReadOnly,
    Disabled,
}

impl OperatingMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => OperatingMode::Normal,
            1 => OperatingMode::ReadOnly,
            _ => OperatingMode::Disabled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OperatingMode::Normal => 0,
            OperatingMode::ReadOnly => 1,
            OperatingMode::Disabled => 2,
        }
    }
}

/// Outcome of a charge attempt, distinguishing a real row from the
/// `READ_ONLY` skip-and-succeed path.
#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Charged(TokenRecord),
    BillingDisabled,
}

/// A minimal per-org `governor` keyring, kept in its own module so the
/// ledger doesn't need a `dashmap` dependency just for this one map.
mod dashmap_like {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    pub struct OrgLimiters {
        requests_per_minute: u32,
        limiters: RwLock<
            HashMap<OrgId, Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>>,
        >,
    }

    impl OrgLimiters {
        pub fn new(requests_per_minute: u32) -> Self {
            Self {
                requests_per_minute,
                limiters: RwLock::new(HashMap::new()),
            }
        }

        pub fn check(&self, org_id: OrgId) -> bool {
            if let Some(limiter) = self.limiters.read().get(&org_id) {
                return limiter.check().is_ok();
            }
            let quota = Quota::per_minute(
                NonZeroU32::new(self.requests_per_minute.max(1)).expect("checked non-zero above"),
            );
            let limiter = Arc::new(RateLimiter::direct(quota));
            let allowed = limiter.check().is_ok();
            self.limiters.write().insert(org_id, limiter);
            allowed
        }
    }
}

pub struct LedgerConfig {
    pub failure_threshold: u32,
    pub rate_limit_requests_per_minute: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rate_limit_requests_per_minute: 120,
        }
    }
}

/// Billing facade: pre-call estimate, budget check, idempotent charge,
/// self-demoting operating modes, and reconciliation.
pub struct BillingLedger {
    store: Arc<dyn DurableStore>,
    pricing: PricingCache,
    counter: TokenCounter,
    limiters: OrgLimiters,
    mode: AtomicU8,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
}

impl BillingLedger {
    pub fn new(store: Arc<dyn DurableStore>, config: LedgerConfig) -> Self {
        Self {
            pricing: PricingCache::new(store.clone()),
            limiters: OrgLimiters::new(config.rate_limit_requests_per_minute),
            store,
            counter: TokenCounter::new(),
            mode: AtomicU8::new(OperatingMode::Normal.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: config.failure_threshold,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Manual restore after an operator has addressed whatever caused
    /// the self-demotion.
    pub fn restore_normal_mode(&self) {
        self.mode.store(OperatingMode::Normal.as_u8(), Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        info!("billing ledger restored to normal mode");
    }

    fn record_charge_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold && self.mode() == OperatingMode::Normal {
            self.mode.store(OperatingMode::ReadOnly.as_u8(), Ordering::SeqCst);
            warn!(
                failures,
                threshold = self.failure_threshold,
                "self-demoting billing ledger to read-only mode"
            );
        }
    }

    fn record_charge_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Counts tokens, prices them, and returns the projected input/output
    /// token counts alongside the cost estimate.
    pub async fn estimate_call_cost(
        &self,
        model: &str,
        provider: Provider,
        input_text: &str,
        max_tokens: Option<u64>,
    ) -> Result<(u64, u64, Money)> {
        let input_tokens = self.counter.count_text(input_text, provider);
        let output_tokens = TokenCounter::estimate_output_tokens(input_tokens, max_tokens);
        let quote = self.pricing.quote(model, provider).await?;
        let cost = cost_for_tokens(&quote, input_tokens, output_tokens);
        Ok((input_tokens, output_tokens, cost))
    }

    /// Fails with `InsufficientCredits` if `available < amount`.
    pub async fn check_budget(&self, org_id: OrgId, amount: Money) -> Result<CreditBalance> {
        let balance = self.store.get_credit_balance(org_id).await?;
        if balance.available() < amount {
            return Err(BillingError::InsufficientCredits {
                available: balance.available(),
                requested: amount,
            });
        }
        Ok(balance)
    }

    /// Per-org sliding rate limit ahead of the charge path.
    fn check_rate_limit(&self, org_id: OrgId) -> Result<()> {
        if self.limiters.check(org_id) {
            Ok(())
        } else {
            Err(BillingError::RateLimited {
                retry_after_secs: 1,
            })
        }
    }

    /// Rate-limits, then (mode-dependent) either delegates to the store's
    /// idempotent charge procedure or skips the charge in
    /// `READ_ONLY`/`DISABLED` mode.
    pub async fn bill_token_call(
        &self,
        run_id: RunId,
        org_id: OrgId,
        model: &str,
        provider: Provider,
        input_tokens: u64,
        output_tokens: u64,
        idempotency_key: String,
    ) -> Result<ChargeOutcome> {
        self.check_rate_limit(org_id)?;

        match self.mode() {
            OperatingMode::Disabled => {
                info!(%run_id, %org_id, "billing disabled, skipping charge");
                return Ok(ChargeOutcome::BillingDisabled);
            }
            OperatingMode::ReadOnly => {
                info!(%run_id, %org_id, "billing read-only, skipping charge");
                return Ok(ChargeOutcome::BillingDisabled);
            }
            OperatingMode::Normal => {}
        }

        let quote = match self.pricing.quote(model, provider).await {
            Ok(quote) => quote,
            Err(err) => {
                self.record_charge_failure();
                return Err(err);
            }
        };
        let cost_usd = cost_for_tokens(&quote, input_tokens, output_tokens);

        let request = TokenCallRequest {
            run_id,
            org_id,
            model: model.to_string(),
            provider,
            input_tokens,
            output_tokens,
            cost_usd,
            idempotency_key,
        };

        match self.store.record_token_call(request).await {
            Ok(record) => {
                self.record_charge_success();
                Ok(ChargeOutcome::Charged(record))
            }
            Err(err) => {
                error!(%run_id, %org_id, error = %err, "charge-path exception");
                self.record_charge_failure();
                Err(err.into())
            }
        }
    }

    /// Delegates to the store's end-of-run reconciliation stored
    /// procedure.
    pub async fn reconcile(&self, run_id: RunId) -> Result<ReconciliationRow> {
        Ok(self.store.reconcile_run(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::UserId;
    use cp_store::InMemoryStore;
    use cp_store::{Plan, Run, RunState};

    fn make_run(run_id: RunId, org_id: OrgId) -> Run {
        let now = chrono::Utc::now();
        Run {
            id: run_id,
            user_id: UserId::new(),
            org_id,
            created_at: now,
            updated_at: now,
            state: RunState::Executing,
            state_version: 0,
            fencing_token: None,
            token_expires_at: None,
            plan: Plan::default(),
            current_phase_number: 0,
            error: None,
            completed_at: None,
            worker_id: None,
            deadline_at: None,
            priority: 0,
        }
    }

    async fn seeded_ledger() -> (BillingLedger, RunId, OrgId) {
        let store = Arc::new(InMemoryStore::new());
        let org_id = OrgId::new();
        let run_id = RunId::new();
        store.create_run(make_run(run_id, org_id)).await.unwrap();
        store
            .add_credits(org_id, Money::from_decimal(rust_decimal::Decimal::new(100, 0)), "seed")
            .await
            .unwrap();
        let ledger = BillingLedger::new(store, LedgerConfig::default());
        (ledger, run_id, org_id)
    }

    #[tokio::test]
    async fn budget_check_rejects_when_balance_too_low() {
        let (ledger, _run_id, org_id) = seeded_ledger().await;
        let err = ledger
            .check_budget(org_id, Money::from_decimal(rust_decimal::Decimal::new(1_000, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { .. }));
    }

    #[tokio::test]
    async fn repeated_charge_with_same_key_is_idempotent() {
        let (ledger, run_id, org_id) = seeded_ledger().await;
        let first = ledger
            .bill_token_call(run_id, org_id, "gpt-4-turbo", Provider::OpenAi, 100, 50, "call-1".into())
            .await
            .unwrap();
        let second = ledger
            .bill_token_call(run_id, org_id, "gpt-4-turbo", Provider::OpenAi, 100, 50, "call-1".into())
            .await
            .unwrap();
        match (first, second) {
            (ChargeOutcome::Charged(a), ChargeOutcome::Charged(b)) => assert_eq!(a.id, b.id),
            other => panic!("expected both charges, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_mode_skips_charges() {
        let (ledger, run_id, org_id) = seeded_ledger().await;
        ledger.mode.store(OperatingMode::ReadOnly.as_u8(), Ordering::SeqCst);
        let outcome = ledger
            .bill_token_call(run_id, org_id, "gpt-4-turbo", Provider::OpenAi, 10, 10, "call-ro".into())
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::BillingDisabled));
    }

    #[tokio::test]
    async fn estimate_call_cost_produces_a_positive_quote() {
        let (ledger, _run_id, _org_id) = seeded_ledger().await;
        let (input, output, cost) = ledger
            .estimate_call_cost("gpt-4-turbo", Provider::OpenAi, "hello world", Some(100))
            .await
            .unwrap();
        assert!(input > 0);
        assert!(output <= 100);
        assert!(cost.as_decimal() >= rust_decimal::Decimal::ZERO);
    }
}
