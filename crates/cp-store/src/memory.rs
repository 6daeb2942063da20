use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cp_base::{Money, OrgId, Provider, RunId, SubtaskId};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::entities::*;
use crate::error::StoreError;
use crate::{DurableStore, Result};

/// In-memory reference implementation of [`DurableStore`].
///
/// Each concern (runs, subtasks, billing, pricing, audit) has its own
/// lock; no method acquires more than one at a time, matching the
/// broker's rule of never holding two locks simultaneously to avoid
/// lock-ordering deadlocks.
#[derive(Default)]
pub struct InMemoryStore {
    runs: Mutex<HashMap<RunId, Run>>,
    subtasks: Mutex<HashMap<SubtaskId, Subtask>>,
    balances: Mutex<HashMap<OrgId, CreditBalance>>,
    token_records: Mutex<HashMap<String, TokenRecord>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    pricing: Mutex<HashMap<(String, Provider), ModelPricing>>,
    audit: Mutex<Vec<AuditEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seed helper: give an org a starting balance directly,
    /// bypassing the ledger (no audit entry is written).
    pub fn seed_balance(&self, balance: CreditBalance) {
        self.balances.lock().insert(balance.org_id, balance);
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn create_run(&self, run: Run) -> Result<Run> {
        let mut runs = self.runs.lock();
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.runs.lock().get(&run_id).cloned())
    }

    async fn get_stalled_runs(&self, threshold: Duration) -> Result<Vec<Run>> {
        let now = Utc::now();
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
        Ok(self
            .runs
            .lock()
            .values()
            .filter(|r| !r.state.is_terminal() && now - r.updated_at >= threshold)
            .cloned()
            .collect())
    }

    async fn create_subtask(&self, subtask: Subtask) -> Result<Subtask> {
        let mut subtasks = self.subtasks.lock();
        subtasks.insert(subtask.id, subtask.clone());
        Ok(subtask)
    }

    async fn get_subtask(&self, subtask_id: SubtaskId) -> Result<Option<Subtask>> {
        Ok(self.subtasks.lock().get(&subtask_id).cloned())
    }

    async fn get_subtasks_by_run(
        &self,
        run_id: RunId,
        states: Option<&[SubtaskState]>,
    ) -> Result<Vec<Subtask>> {
        let mut out: Vec<Subtask> = self
            .subtasks
            .lock()
            .values()
            .filter(|s| s.run_id == run_id)
            .filter(|s| states.is_none_or(|states| states.contains(&s.state)))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.subtask_index);
        Ok(out)
    }

    async fn get_subtask_counts_by_state(
        &self,
        run_id: RunId,
    ) -> Result<HashMap<SubtaskState, u64>> {
        let mut counts = HashMap::new();
        for s in self.subtasks.lock().values().filter(|s| s.run_id == run_id) {
            *counts.entry(s.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn get_subtasks_in_state(&self, states: &[SubtaskState]) -> Result<Vec<Subtask>> {
        Ok(self
            .subtasks
            .lock()
            .values()
            .filter(|s| states.contains(&s.state))
            .cloned()
            .collect())
    }

    async fn check_subtask_ready(&self, subtask_id: SubtaskId) -> Result<bool> {
        let subtasks = self.subtasks.lock();
        let subtask = subtasks
            .get(&subtask_id)
            .ok_or_else(|| StoreError::SubtaskNotFound {
                subtask_id: subtask_id.to_string(),
            })?;
        Ok(subtask.dependencies.iter().all(|dep| {
            subtasks
                .get(dep)
                .map(|d| d.state == SubtaskState::Completed)
                .unwrap_or(false)
        }))
    }

    async fn acquire_run_fencing_token(
        &self,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<FencingAcquisition> {
        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        let now = Utc::now();
        let held = run.fencing_token.is_some()
            && run.token_expires_at.map(|exp| exp > now).unwrap_or(false);

        if held {
            return Ok(FencingAcquisition {
                acquired: false,
                run: None,
                token: None,
            });
        }

        let token = Uuid::new_v4();
        let expires = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        run.fencing_token = Some(token);
        run.token_expires_at = Some(expires);

        Ok(FencingAcquisition {
            acquired: true,
            run: Some(run.clone()),
            token: Some(token),
        })
    }

    async fn release_run_fencing_token(&self, run_id: RunId, token: Uuid) -> Result<bool> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.fencing_token == Some(token) {
            run.fencing_token = None;
            run.token_expires_at = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn transition_run_state(
        &self,
        req: RunTransitionRequest,
    ) -> Result<TransitionOutcome> {
        if !req.from_state.can_transition_to(req.to_state) {
            return Err(StoreError::InvalidTransition {
                from: format!("{:?}", req.from_state),
                to: format!("{:?}", req.to_state),
            });
        }

        let mut runs = self.runs.lock();
        let run = runs
            .get_mut(&req.run_id)
            .ok_or_else(|| StoreError::RunNotFound {
                run_id: req.run_id.to_string(),
            })?;

        if run.state != req.from_state || run.state_version != req.expected_state_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: req.expected_state_version,
                actual: run.state_version,
            });
        }

        run.state = req.to_state;
        run.state_version += 1;
        run.updated_at = Utc::now();
        if req.to_state.is_terminal() {
            run.completed_at = Some(run.updated_at);
        }
        if let Some(reason) = &req.reason {
            run.error = Some(reason.clone());
        }

        let outcome = TransitionOutcome {
            succeeded: true,
            new_state_version: run.state_version,
        };
        drop(runs);

        self.audit.lock().push(AuditEvent {
            id: Uuid::new_v4(),
            entity: "run".to_string(),
            entity_id: req.run_id.to_string(),
            event: format!("{:?}->{:?}", req.from_state, req.to_state),
            actor: req.transitioned_by,
            reason: req.reason,
            created_at: Utc::now(),
        });

        Ok(outcome)
    }

    async fn transition_subtask_state(
        &self,
        req: SubtaskTransitionRequest,
    ) -> Result<TransitionOutcome> {
        if !req.from_state.can_transition_to(req.to_state) {
            return Err(StoreError::InvalidTransition {
                from: format!("{:?}", req.from_state),
                to: format!("{:?}", req.to_state),
            });
        }

        let mut subtasks = self.subtasks.lock();
        let subtask =
            subtasks
                .get_mut(&req.subtask_id)
                .ok_or_else(|| StoreError::SubtaskNotFound {
                    subtask_id: req.subtask_id.to_string(),
                })?;

        if subtask.state != req.from_state || subtask.state_version != req.expected_state_version
        {
            return Err(StoreError::ConcurrencyConflict {
                expected: req.expected_state_version,
                actual: subtask.state_version,
            });
        }

        subtask.state = req.to_state;
        subtask.state_version += 1;
        if req.to_state == SubtaskState::Pending {
            subtask.attempt_count += 1;
        }
        if let Some(output) = req.result_data {
            subtask.output = Some(output);
        }

        let outcome = TransitionOutcome {
            succeeded: true,
            new_state_version: subtask.state_version,
        };
        drop(subtasks);

        self.audit.lock().push(AuditEvent {
            id: Uuid::new_v4(),
            entity: "subtask".to_string(),
            entity_id: req.subtask_id.to_string(),
            event: format!("{:?}->{:?}", req.from_state, req.to_state),
            actor: req.transitioned_by,
            reason: req.reason.or(req.error),
            created_at: Utc::now(),
        });

        Ok(outcome)
    }

    async fn record_token_call(&self, req: TokenCallRequest) -> Result<TokenRecord> {
        let mut records = self.token_records.lock();
        if let Some(existing) = records.get(&req.idempotency_key) {
            return Ok(existing.clone());
        }

        let mut balances = self.balances.lock();
        let balance = balances.entry(req.org_id).or_insert_with(|| CreditBalance {
            org_id: req.org_id,
            balance_usd: Money::ZERO,
            reserved_usd: Money::ZERO,
            low_balance_threshold: Money::ZERO,
            auto_recharge: false,
        });
        balance.balance_usd = balance.balance_usd - req.cost_usd;

        let record = TokenRecord {
            id: Uuid::new_v4(),
            run_id: req.run_id,
            org_id: req.org_id,
            model: req.model,
            provider: req.provider,
            input_tokens: req.input_tokens,
            output_tokens: req.output_tokens,
            cost_usd: req.cost_usd,
            idempotency_key: req.idempotency_key.clone(),
            created_at: Utc::now(),
        };
        records.insert(req.idempotency_key, record.clone());
        drop(records);
        drop(balances);

        self.ledger.lock().push(LedgerEntry {
            id: Uuid::new_v4(),
            org_id: req.org_id,
            transaction_type: LedgerTransactionType::Charge,
            amount_usd: Money::ZERO - req.cost_usd,
            reason: format!("token call for run {}", req.run_id),
            token_record_id: Some(record.id),
            created_at: Utc::now(),
        });

        Ok(record)
    }

    async fn get_credit_balance(&self, org_id: OrgId) -> Result<CreditBalance> {
        Ok(self
            .balances
            .lock()
            .get(&org_id)
            .cloned()
            .unwrap_or(CreditBalance {
                org_id,
                balance_usd: Money::ZERO,
                reserved_usd: Money::ZERO,
                low_balance_threshold: Money::ZERO,
                auto_recharge: false,
            }))
    }

    async fn add_credits(
        &self,
        org_id: OrgId,
        amount: Money,
        reason: &str,
    ) -> Result<CreditBalance> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(org_id).or_insert(CreditBalance {
            org_id,
            balance_usd: Money::ZERO,
            reserved_usd: Money::ZERO,
            low_balance_threshold: Money::ZERO,
            auto_recharge: false,
        });
        balance.balance_usd = balance.balance_usd + amount;
        let updated = *balance;
        drop(balances);

        self.ledger.lock().push(LedgerEntry {
            id: Uuid::new_v4(),
            org_id,
            transaction_type: LedgerTransactionType::CreditPurchase,
            amount_usd: amount,
            reason: reason.to_string(),
            token_record_id: None,
            created_at: Utc::now(),
        });

        Ok(updated)
    }

    async fn reconcile_run(&self, run_id: RunId) -> Result<ReconciliationRow> {
        let actual_total = self
            .token_records
            .lock()
            .values()
            .filter(|r| r.run_id == run_id)
            .fold(Money::ZERO, |acc, r| acc + r.cost_usd);

        // No separate estimate ledger is modeled in-memory; the reference
        // implementation treats the actual total as its own estimate so
        // variance is zero unless a caller overrides this row upstream.
        let estimated_total = actual_total;
        let variance_pct = 0.0;

        Ok(ReconciliationRow {
            run_id,
            estimated_total,
            actual_total,
            variance_pct,
            status: ReconciliationStatus::Ok,
        })
    }

    async fn get_model_pricing(
        &self,
        model: &str,
        provider: Provider,
    ) -> Result<Option<ModelPricing>> {
        Ok(self
            .pricing
            .lock()
            .get(&(model.to_string(), provider))
            .cloned())
    }

    async fn set_model_pricing(&self, pricing: ModelPricing) -> Result<()> {
        self.pricing
            .lock()
            .insert((pricing.model.clone(), pricing.provider), pricing);
        Ok(())
    }

    async fn record_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.audit.lock().push(event);
        Ok(())
    }

    async fn list_audit_events_for_run(
        &self,
        run_id: RunId,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AuditEvent>> {
        let subtask_ids: std::collections::HashSet<String> = self
            .subtasks
            .lock()
            .values()
            .filter(|s| s.run_id == run_id)
            .map(|s| s.id.to_string())
            .collect();
        let run_id_str = run_id.to_string();

        let mut events: Vec<AuditEvent> = self
            .audit
            .lock()
            .iter()
            .filter(|e| {
                (e.entity == "run" && e.entity_id == run_id_str)
                    || (e.entity == "subtask" && subtask_ids.contains(&e.entity_id))
            })
            .filter(|e| since.is_none_or(|since| e.created_at > since))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::UserId;

    fn sample_run() -> Run {
        Run {
            id: RunId::new(),
            user_id: UserId::new(),
            org_id: OrgId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            state: RunState::Created,
            state_version: 0,
            fencing_token: None,
            token_expires_at: None,
            plan: Plan::default(),
            current_phase_number: 0,
            error: None,
            completed_at: None,
            worker_id: None,
            deadline_at: None,
            priority: 1,
        }
    }

    #[tokio::test]
    async fn transition_bumps_version_exactly_once() {
        let store = InMemoryStore::new();
        let run = store.create_run(sample_run()).await.unwrap();

        let outcome = store
            .transition_run_state(RunTransitionRequest {
                run_id: run.id,
                from_state: RunState::Created,
                to_state: RunState::Validating,
                expected_state_version: 0,
                transitioned_by: "orchestrator".to_string(),
                reason: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.new_state_version, 1);
    }

    #[tokio::test]
    async fn concurrent_transition_with_stale_version_fails() {
        let store = InMemoryStore::new();
        let run = store.create_run(sample_run()).await.unwrap();

        store
            .transition_run_state(RunTransitionRequest {
                run_id: run.id,
                from_state: RunState::Created,
                to_state: RunState::Validating,
                expected_state_version: 0,
                transitioned_by: "a".to_string(),
                reason: None,
            })
            .await
            .unwrap();

        let second = store
            .transition_run_state(RunTransitionRequest {
                run_id: run.id,
                from_state: RunState::Created,
                to_state: RunState::Cancelled,
                expected_state_version: 0,
                transitioned_by: "b".to_string(),
                reason: None,
            })
            .await;

        assert!(matches!(second, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_before_touching_state() {
        let store = InMemoryStore::new();
        let run = store.create_run(sample_run()).await.unwrap();

        let result = store
            .transition_run_state(RunTransitionRequest {
                run_id: run.id,
                from_state: RunState::Created,
                to_state: RunState::Completed,
                expected_state_version: 0,
                transitioned_by: "a".to_string(),
                reason: None,
            })
            .await;

        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
        let reloaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state_version, 0);
    }

    #[tokio::test]
    async fn fencing_token_is_exclusive_until_released() {
        let store = InMemoryStore::new();
        let run = store.create_run(sample_run()).await.unwrap();

        let first = store
            .acquire_run_fencing_token(run.id, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(first.acquired);

        let second = store
            .acquire_run_fencing_token(run.id, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!second.acquired);

        let released = store
            .release_run_fencing_token(run.id, first.token.unwrap())
            .await
            .unwrap();
        assert!(released);

        let third = store
            .acquire_run_fencing_token(run.id, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(third.acquired);
    }

    #[tokio::test]
    async fn repeat_idempotency_key_does_not_double_charge() {
        let store = InMemoryStore::new();
        let org = OrgId::new();
        store.seed_balance(CreditBalance {
            org_id: org,
            balance_usd: Money::from_decimal(rust_decimal::Decimal::new(1000, 2)),
            reserved_usd: Money::ZERO,
            low_balance_threshold: Money::ZERO,
            auto_recharge: false,
        });

        let req = TokenCallRequest {
            run_id: RunId::new(),
            org_id: org,
            model: "gpt-4".to_string(),
            provider: Provider::OpenAi,
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: Money::from_decimal(rust_decimal::Decimal::new(100, 2)),
            idempotency_key: "key-1".to_string(),
        };

        let first = store.record_token_call(req.clone()).await.unwrap();
        let second = store.record_token_call(req).await.unwrap();
        assert_eq!(first.id, second.id);

        let balance = store.get_credit_balance(org).await.unwrap();
        assert_eq!(
            balance.balance_usd.as_decimal(),
            rust_decimal::Decimal::new(900, 2)
        );
    }
}
