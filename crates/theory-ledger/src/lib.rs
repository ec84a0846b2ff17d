// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-ledger
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use theory_core::{canonical_json, sha256_hex};
use tracing::debug;

/// Budget accounting anchor for a logical plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan key.
    pub key: String,
    /// Micro-units currently reserved. Never negative.
    pub reserved_micro: i64,
    /// Micro-units spent to date. Never negative.
    pub spent_micro: i64,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Plan key this event belongs to.
    pub plan: String,
    /// Per-plan sequence number, contiguous from 1.
    pub seq: u64,
    /// `this_hash` of the previous row; `None` iff `seq == 1`.
    pub prev_hash: Option<String>,
    /// Deterministic hash of `payload`.
    pub this_hash: String,
    /// Event payload.
    pub payload: Value,
}

/// Deterministic hash of a ledger payload: SHA-256 over canonical JSON.
///
/// # Examples
///
/// ```
/// let h = theory_ledger::event_hash(&serde_json::json!({"a": 1}));
/// assert_eq!(h.len(), 64);
/// ```
#[must_use]
pub fn event_hash(payload: &Value) -> String {
    let canon = canonical_json(payload).unwrap_or_default();
    sha256_hex(canon.as_bytes())
}

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Unknown plan key.
    #[error("no such plan: {0}")]
    NoSuchPlan(String),
    /// A budget mutation would drive a counter negative.
    #[error("budget constraint violated for plan {plan}: {detail}")]
    BudgetNegative {
        /// The plan key.
        plan: String,
        /// Which counter would go negative and by how much.
        detail: String,
    },
    /// A negative amount was supplied.
    #[error("amounts must be non-negative, got {0}")]
    NegativeAmount(i64),
    /// The optimistic append lost the `(plan, seq)` race. Retry.
    #[error("sequence conflict on plan {plan} at seq {seq}")]
    SeqConflict {
        /// The plan key.
        plan: String,
        /// The sequence number that was already taken.
        seq: u64,
    },
}

/// Chain-integrity violations found by [`Ledger::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Sequence numbers are not contiguous from 1.
    #[error("non-contiguous sequence at seq {0}")]
    NonContiguous(u64),
    /// A stored hash does not match the recomputed payload hash.
    #[error("hash mismatch at seq {0}")]
    HashMismatch(u64),
    /// `prev_hash` does not match the previous row's `this_hash`.
    #[error("broken link at seq {0}")]
    BrokenLink(u64),
}

/// Success settlement parameters.
#[derive(Debug, Clone)]
pub struct SettleSuccess {
    /// Plan key.
    pub plan: String,
    /// Execution being settled.
    pub execution_id: String,
    /// High-watermark estimate that was reserved.
    pub estimate_hi_micro: i64,
    /// Metered actual cost.
    pub actual_micro: i64,
    /// URI of the determinism receipt.
    pub determinism_uri: String,
}

/// Failure settlement parameters.
#[derive(Debug, Clone)]
pub struct SettleFailure {
    /// Plan key.
    pub plan: String,
    /// Execution being settled.
    pub execution_id: String,
    /// High-watermark estimate that was reserved.
    pub estimate_hi_micro: i64,
    /// Metered cost before the failure.
    pub metered_actual_micro: i64,
    /// Failure reason (usually the error code).
    pub reason: String,
}

#[derive(Debug, Default)]
struct Inner {
    plans: HashMap<String, Plan>,
    events: HashMap<String, Vec<Event>>,
}

/// The ledger: plans plus their hash-chained event logs.
///
/// Append is optimistic: the observed tail is read, the new row is
/// computed, and the commit re-checks that the tail is unchanged: a
/// loser gets [`LedgerError::SeqConflict`] and retries, the in-process
/// equivalent of a `(plan, seq)` uniqueness violation.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    inner: Arc<Mutex<Inner>>,
}

impl Ledger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a plan, creating it with the given starting reservation if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NegativeAmount`] for a negative start.
    pub fn ensure_plan(&self, key: &str, initial_reserved: i64) -> Result<Plan, LedgerError> {
        if initial_reserved < 0 {
            return Err(LedgerError::NegativeAmount(initial_reserved));
        }
        let mut inner = self.lock();
        let plan = inner
            .plans
            .entry(key.to_string())
            .or_insert_with(|| Plan {
                key: key.to_string(),
                reserved_micro: initial_reserved,
                spent_micro: 0,
            })
            .clone();
        Ok(plan)
    }

    /// Current state of a plan.
    #[must_use]
    pub fn plan(&self, key: &str) -> Option<Plan> {
        self.lock().plans.get(key).cloned()
    }

    /// All events of a plan ordered by `seq`.
    #[must_use]
    pub fn events(&self, key: &str) -> Vec<Event> {
        self.lock().events.get(key).cloned().unwrap_or_default()
    }

    /// Reserve `micro` against the plan and append a `budget.reserved`
    /// event, atomically.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoSuchPlan`] for unknown plans,
    /// [`LedgerError::NegativeAmount`] for negative reservations.
    pub fn reserve(&self, plan: &str, micro: i64) -> Result<Event, LedgerError> {
        if micro < 0 {
            return Err(LedgerError::NegativeAmount(micro));
        }
        self.transact(plan, |row| {
            row.reserved_micro += micro;
            Ok(json!({
                "event_type": "budget.reserved",
                "amount_micro": micro,
                "plan_id": row.key,
            }))
        })
    }

    /// Settle a successful execution: release the reservation, record the
    /// actual spend, append `execution.settle.success`. One atomic step.
    ///
    /// # Errors
    ///
    /// [`LedgerError::BudgetNegative`] when the release exceeds the
    /// outstanding reservation; nothing is mutated in that case.
    pub fn settle_success(&self, s: &SettleSuccess) -> Result<Event, LedgerError> {
        if s.estimate_hi_micro < 0 || s.actual_micro < 0 {
            return Err(LedgerError::NegativeAmount(
                s.estimate_hi_micro.min(s.actual_micro),
            ));
        }
        self.transact(&s.plan, |row| {
            let reserved = row.reserved_micro - s.estimate_hi_micro;
            if reserved < 0 {
                return Err(LedgerError::BudgetNegative {
                    plan: row.key.clone(),
                    detail: format!("reserved_micro would be {reserved}"),
                });
            }
            row.reserved_micro = reserved;
            row.spent_micro += s.actual_micro;
            Ok(json!({
                "event_type": "execution.settle.success",
                "execution_id": s.execution_id,
                "plan_id": row.key,
                "estimate_hi_micro": s.estimate_hi_micro,
                "actual_micro": s.actual_micro,
                "refund_micro": (s.estimate_hi_micro - s.actual_micro).max(0),
                "determinism_uri": s.determinism_uri,
            }))
        })
    }

    /// Settle a failed execution: release the reservation, record any
    /// metered spend, append `execution.settle.failure`.
    ///
    /// # Errors
    ///
    /// Same constraints as [`Ledger::settle_success`].
    pub fn settle_failure(&self, s: &SettleFailure) -> Result<Event, LedgerError> {
        if s.estimate_hi_micro < 0 || s.metered_actual_micro < 0 {
            return Err(LedgerError::NegativeAmount(
                s.estimate_hi_micro.min(s.metered_actual_micro),
            ));
        }
        self.transact(&s.plan, |row| {
            let reserved = row.reserved_micro - s.estimate_hi_micro;
            if reserved < 0 {
                return Err(LedgerError::BudgetNegative {
                    plan: row.key.clone(),
                    detail: format!("reserved_micro would be {reserved}"),
                });
            }
            row.reserved_micro = reserved;
            row.spent_micro += s.metered_actual_micro;
            Ok(json!({
                "event_type": "execution.settle.failure",
                "execution_id": s.execution_id,
                "plan_id": row.key,
                "estimate_hi_micro": s.estimate_hi_micro,
                "actual_micro": s.metered_actual_micro,
                "refund_micro": (s.estimate_hi_micro - s.metered_actual_micro).max(0),
                "reason": s.reason,
            }))
        })
    }

    /// Append a generic event, retrying on sequence conflicts.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoSuchPlan`] for unknown plans.
    pub fn append(&self, plan: &str, payload: Value) -> Result<Event, LedgerError> {
        loop {
            let (seq, prev_hash) = self.tail(plan)?;
            match self.try_append_at(plan, seq + 1, prev_hash, payload.clone()) {
                Err(LedgerError::SeqConflict { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Observed tail of a plan's chain: `(max_seq, this_hash of tail)`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoSuchPlan`] for unknown plans.
    pub fn tail(&self, plan: &str) -> Result<(u64, Option<String>), LedgerError> {
        let inner = self.lock();
        if !inner.plans.contains_key(plan) {
            return Err(LedgerError::NoSuchPlan(plan.to_string()));
        }
        Ok(match inner.events.get(plan).and_then(|e| e.last()) {
            Some(last) => (last.seq, Some(last.this_hash.clone())),
            None => (0, None),
        })
    }

    /// Commit a row at exactly `seq`. The `(plan, seq)` uniqueness check
    /// runs inside the commit; a concurrent winner leaves the loser with
    /// [`LedgerError::SeqConflict`].
    ///
    /// # Errors
    ///
    /// [`LedgerError::SeqConflict`] when `seq` is already taken;
    /// [`LedgerError::NoSuchPlan`] for unknown plans.
    pub fn try_append_at(
        &self,
        plan: &str,
        seq: u64,
        prev_hash: Option<String>,
        payload: Value,
    ) -> Result<Event, LedgerError> {
        let mut inner = self.lock();
        if !inner.plans.contains_key(plan) {
            return Err(LedgerError::NoSuchPlan(plan.to_string()));
        }
        let rows = inner.events.entry(plan.to_string()).or_default();
        let current = rows.last().map_or(0, |e| e.seq);
        if seq != current + 1 {
            return Err(LedgerError::SeqConflict {
                plan: plan.to_string(),
                seq,
            });
        }
        let event = Event {
            plan: plan.to_string(),
            seq,
            prev_hash,
            this_hash: event_hash(&payload),
            payload,
        };
        rows.push(event.clone());
        debug!(plan = %plan, seq, "ledger append");
        Ok(event)
    }

    /// Verify the full chain of a plan by recomputation.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChainError`] found.
    pub fn verify_chain(&self, plan: &str) -> Result<(), ChainError> {
        let events = self.events(plan);
        let mut prev: Option<&Event> = None;
        for (i, event) in events.iter().enumerate() {
            if event.seq != (i as u64) + 1 {
                return Err(ChainError::NonContiguous(event.seq));
            }
            if event.this_hash != event_hash(&event.payload) {
                return Err(ChainError::HashMismatch(event.seq));
            }
            let expected_prev = prev.map(|p| p.this_hash.clone());
            if event.prev_hash != expected_prev {
                return Err(ChainError::BrokenLink(event.seq));
            }
            prev = Some(event);
        }
        Ok(())
    }

    /// Budget mutation + event append as one atomic step. The mutation
    /// closure runs against a scratch copy; nothing is visible unless the
    /// whole step succeeds.
    fn transact<F>(&self, plan: &str, mutate: F) -> Result<Event, LedgerError>
    where
        F: FnOnce(&mut Plan) -> Result<Value, LedgerError>,
    {
        let mut inner = self.lock();
        let mut row = inner
            .plans
            .get(plan)
            .cloned()
            .ok_or_else(|| LedgerError::NoSuchPlan(plan.to_string()))?;
        let payload = mutate(&mut row)?;
        debug_assert!(row.reserved_micro >= 0 && row.spent_micro >= 0);

        let rows = inner.events.entry(plan.to_string()).or_default();
        let seq = rows.last().map_or(0, |e| e.seq) + 1;
        let prev_hash = rows.last().map(|e| e.this_hash.clone());
        let event = Event {
            plan: plan.to_string(),
            seq,
            prev_hash,
            this_hash: event_hash(&payload),
            payload,
        };
        rows.push(event.clone());
        inner.plans.insert(plan.to_string(), row);
        debug!(plan = %plan, seq, event = %event.payload["event_type"], "ledger settle");
        Ok(event)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ledger lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_plan(reserved: i64) -> Ledger {
        let ledger = Ledger::new();
        ledger.ensure_plan("p-1", reserved).unwrap();
        ledger
    }

    #[test]
    fn reserve_then_settle_success() {
        let ledger = ledger_with_plan(1_000_000);
        let reserve = ledger.reserve("p-1", 50_000).unwrap();
        assert_eq!(reserve.seq, 1);
        assert_eq!(reserve.prev_hash, None);
        assert_eq!(reserve.payload["event_type"], "budget.reserved");
        assert_eq!(ledger.plan("p-1").unwrap().reserved_micro, 1_050_000);

        let settle = ledger
            .settle_success(&SettleSuccess {
                plan: "p-1".into(),
                execution_id: "e-1".into(),
                estimate_hi_micro: 50_000,
                actual_micro: 30_000,
                determinism_uri: "world://outputs/e-1/receipt.json".into(),
            })
            .unwrap();
        assert_eq!(settle.seq, 2);
        assert_eq!(settle.prev_hash.as_deref(), Some(reserve.this_hash.as_str()));
        assert_eq!(settle.payload["refund_micro"], 20_000);

        let plan = ledger.plan("p-1").unwrap();
        assert_eq!(plan.reserved_micro, 1_000_000);
        assert_eq!(plan.spent_micro, 30_000);
        ledger.verify_chain("p-1").unwrap();
    }

    #[test]
    fn settle_failure_refunds_everything() {
        let ledger = ledger_with_plan(0);
        ledger.reserve("p-1", 75_000).unwrap();
        let settle = ledger
            .settle_failure(&SettleFailure {
                plan: "p-1".into(),
                execution_id: "e-1".into(),
                estimate_hi_micro: 75_000,
                metered_actual_micro: 0,
                reason: "ERR_HEALTH".into(),
            })
            .unwrap();
        assert_eq!(settle.payload["event_type"], "execution.settle.failure");
        assert_eq!(settle.payload["reason"], "ERR_HEALTH");

        let plan = ledger.plan("p-1").unwrap();
        assert_eq!(plan.reserved_micro, 0);
        assert_eq!(plan.spent_micro, 0);
    }

    #[test]
    fn over_release_fails_without_partial_settle() {
        let ledger = ledger_with_plan(10_000);
        let before = ledger.plan("p-1").unwrap();
        let err = ledger
            .settle_success(&SettleSuccess {
                plan: "p-1".into(),
                execution_id: "e-1".into(),
                estimate_hi_micro: 20_000,
                actual_micro: 5_000,
                determinism_uri: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::BudgetNegative { .. }));
        // Nothing changed: no event, no budget movement.
        assert_eq!(ledger.plan("p-1").unwrap(), before);
        assert!(ledger.events("p-1").is_empty());
    }

    #[test]
    fn negative_amounts_rejected() {
        let ledger = ledger_with_plan(0);
        assert!(matches!(
            ledger.reserve("p-1", -1),
            Err(LedgerError::NegativeAmount(-1))
        ));
    }

    #[test]
    fn unknown_plan_rejected() {
        let ledger = Ledger::new();
        assert!(matches!(
            ledger.reserve("nope", 1),
            Err(LedgerError::NoSuchPlan(_))
        ));
    }

    #[test]
    fn chain_verifies_and_detects_tamper() {
        let ledger = ledger_with_plan(0);
        for i in 0..5 {
            ledger
                .append("p-1", json!({"event_type": "test", "i": i}))
                .unwrap();
        }
        ledger.verify_chain("p-1").unwrap();

        // Tamper with a payload in place.
        {
            let mut inner = ledger.inner.lock().unwrap();
            inner.events.get_mut("p-1").unwrap()[2].payload = json!({"event_type": "evil"});
        }
        assert_eq!(ledger.verify_chain("p-1"), Err(ChainError::HashMismatch(3)));
    }

    #[test]
    fn stale_tail_gets_seq_conflict() {
        let ledger = ledger_with_plan(0);
        let (seq, prev) = ledger.tail("p-1").unwrap();
        ledger.append("p-1", json!({"event_type": "winner"})).unwrap();
        let err = ledger
            .try_append_at("p-1", seq + 1, prev, json!({"event_type": "loser"}))
            .unwrap_err();
        assert!(matches!(err, LedgerError::SeqConflict { seq: 1, .. }));
    }

    #[test]
    fn concurrent_reserves_are_contiguous() {
        let ledger = ledger_with_plan(0);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                ledger.reserve("p-1", 1_000).unwrap()
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let plan = ledger.plan("p-1").unwrap();
        assert_eq!(plan.reserved_micro, 5_000);
        let seqs: Vec<u64> = ledger.events("p-1").iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        ledger.verify_chain("p-1").unwrap();
    }

    #[test]
    fn event_hash_is_key_order_insensitive() {
        let a = event_hash(&json!({"b": 1, "a": 2}));
        let b = event_hash(&json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any interleaving of reserves and settlements keeps both
            // counters non-negative at every observable state.
            #[test]
            fn budget_never_negative(ops in proptest::collection::vec(0u8..3, 1..40)) {
                let ledger = Ledger::new();
                ledger.ensure_plan("p", 0).unwrap();
                let mut outstanding: Vec<i64> = Vec::new();
                for op in ops {
                    match op {
                        0 => {
                            ledger.reserve("p", 500).unwrap();
                            outstanding.push(500);
                        }
                        1 => if let Some(amount) = outstanding.pop() {
                            ledger.settle_success(&SettleSuccess {
                                plan: "p".into(),
                                execution_id: "e".into(),
                                estimate_hi_micro: amount,
                                actual_micro: amount / 2,
                                determinism_uri: String::new(),
                            }).unwrap();
                        },
                        _ => if let Some(amount) = outstanding.pop() {
                            ledger.settle_failure(&SettleFailure {
                                plan: "p".into(),
                                execution_id: "e".into(),
                                estimate_hi_micro: amount,
                                metered_actual_micro: 0,
                                reason: "ERR_RUNTIME".into(),
                            }).unwrap();
                        },
                    }
                    let plan = ledger.plan("p").unwrap();
                    prop_assert!(plan.reserved_micro >= 0);
                    prop_assert!(plan.spent_micro >= 0);
                }
                ledger.verify_chain("p").unwrap();
            }
        }
    }
}
