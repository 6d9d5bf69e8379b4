// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Budget & quota gate: pre-admission cost and concurrency enforcement.
//!
//! Counters are compare-and-swap cells, no global lock. Reservations happen
//! at admission; observed cost is reconciled after execution. Daily and
//! monthly windows reset at a configured UTC hour, idempotently.

use crate::audit::Auditor;
use crate::config::BudgetConfig;
use crate::error::EngineError;
use chrono::{Datelike, TimeZone, Utc};
use fm_core::{AuditEntry, BudgetScope, Clock, EntityKind, ErrorKind, Event, Quota, TenantBudget};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

const ALERT_WARN: u8 = 0b01;
const ALERT_CRIT: u8 = 0b10;

struct BudgetCell {
    scope: BudgetScope,
    limit: AtomicU64,
    consumed: AtomicU64,
    reset_at_ms: AtomicU64,
    /// Bitmask of thresholds already alerted this window
    alerted: AtomicU8,
}

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub kind: ErrorKind,
    pub message: String,
}

/// The budget/quota gate.
pub struct BudgetGate {
    config: BudgetConfig,
    auditor: Auditor,
    cells: Mutex<HashMap<String, Arc<BudgetCell>>>,
    quotas: Mutex<HashMap<String, Quota>>,
}

impl BudgetGate {
    pub fn new(config: BudgetConfig, auditor: Auditor) -> Self {
        let gate =
            Self { config, auditor, cells: Mutex::new(HashMap::new()), quotas: Mutex::new(HashMap::new()) };
        gate.load_from_state();
        gate
    }

    /// Rebuild live cells from replayed state (startup / recovery).
    pub fn load_from_state(&self) {
        let budgets = self.auditor.with_state(|state| state.budgets.clone());
        let quotas = self.auditor.with_state(|state| state.quotas.clone());
        let mut cells = self.cells.lock();
        cells.clear();
        for (tenant, budget) in budgets {
            cells.insert(
                tenant,
                Arc::new(BudgetCell {
                    scope: budget.scope,
                    limit: AtomicU64::new(budget.limit),
                    consumed: AtomicU64::new(budget.consumed),
                    reset_at_ms: AtomicU64::new(budget.reset_at_ms),
                    alerted: AtomicU8::new(0),
                }),
            );
        }
        *self.quotas.lock() = quotas;
    }

    /// Install or replace a tenant budget.
    pub fn set_budget(
        &self,
        tenant: &str,
        scope: BudgetScope,
        limit: u64,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let reset_at_ms = next_reset_ms(scope, clock.epoch_ms(), self.config.reset_hour_utc);
        let budget = TenantBudget { reset_at_ms, ..TenantBudget::new(tenant, scope, limit, 0) };

        self.audit_budget(&budget, "configured", None, clock)?;

        self.cells.lock().insert(
            tenant.to_string(),
            Arc::new(BudgetCell {
                scope,
                limit: AtomicU64::new(limit),
                consumed: AtomicU64::new(0),
                reset_at_ms: AtomicU64::new(reset_at_ms),
                alerted: AtomicU8::new(0),
            }),
        );
        Ok(())
    }

    /// Install or replace a tenant quota.
    pub fn set_quota(&self, quota: Quota) {
        self.quotas.lock().insert(quota.tenant.clone(), quota);
    }

    pub fn quota(&self, tenant: &str) -> Option<Quota> {
        self.quotas.lock().get(tenant).cloned()
    }

    /// Pre-admission gate.
    ///
    /// Rejects when the tenant has no budget (absent an override), when the
    /// estimate does not fit the remaining window, or when the active-task
    /// quota is full. On success the estimate is reserved atomically.
    pub fn admit(
        &self,
        tenant: &str,
        estimate: u64,
        active_tasks: usize,
        override_budget: bool,
        clock: &impl Clock,
    ) -> Result<(), AdmissionDecision> {
        if let Some(quota) = self.quota(tenant) {
            if active_tasks >= quota.max_active_tasks as usize {
                return Err(AdmissionDecision {
                    kind: ErrorKind::BudgetExceeded,
                    message: format!(
                        "tenant {} at active-task quota ({})",
                        tenant, quota.max_active_tasks
                    ),
                });
            }
        }

        let cell = self.cells.lock().get(tenant).cloned();
        let Some(cell) = cell else {
            if override_budget || !self.config.require_budget {
                return Ok(());
            }
            return Err(AdmissionDecision {
                kind: ErrorKind::BudgetExceeded,
                message: format!("tenant {} has no active budget", tenant),
            });
        };

        let limit = cell.limit.load(Ordering::Acquire);
        let reserve = cell.consumed.fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
            let projected = consumed.saturating_add(estimate);
            if projected > limit && !override_budget {
                None
            } else {
                Some(projected)
            }
        });

        match reserve {
            Ok(_) => {
                self.auditor
                    .publish(Event::BudgetReserved { tenant: tenant.to_string(), amount: estimate });
                self.check_alerts(tenant, &cell);
                Ok(())
            }
            Err(consumed) => Err(AdmissionDecision {
                kind: ErrorKind::BudgetExceeded,
                message: format!(
                    "tenant {} budget exhausted (consumed {} + estimate {} > limit {})",
                    tenant, consumed, estimate, limit
                ),
            }),
        }
    }

    /// Post-execution reconciliation of a reservation with observed cost.
    ///
    /// Overshoot beyond the configured slack emits `budget:overshoot` but
    /// never fails the completed task.
    pub fn reconcile(
        &self,
        tenant: &str,
        reserved: u64,
        observed: u64,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let cell = self.cells.lock().get(tenant).cloned();
        let Some(cell) = cell else {
            return Ok(());
        };

        if observed > reserved {
            cell.consumed.fetch_add(observed - reserved, Ordering::AcqRel);
        } else {
            // Saturate: the reservation may predate a window reset.
            let refund = reserved - observed;
            let _ = cell.consumed.fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                Some(consumed.saturating_sub(refund))
            });
        }

        self.auditor.publish(Event::BudgetReconciled {
            tenant: tenant.to_string(),
            reserved,
            observed,
        });

        let slack_bound = reserved as f64 * (1.0 + self.config.overshoot_slack);
        if reserved > 0 && observed as f64 > slack_bound {
            self.auditor.publish(Event::BudgetOvershoot {
                tenant: tenant.to_string(),
                reserved,
                observed,
            });
        }

        self.check_alerts(tenant, &cell);
        self.audit_budget(&self.snapshot_cell(tenant, &cell), "reconciled", None, clock)?;
        Ok(())
    }

    /// Reset any window whose boundary has passed. Idempotent within a
    /// window: the boundary advances on the first reset, so repeats no-op.
    pub fn maybe_reset(&self, clock: &impl Clock) -> Result<(), EngineError> {
        let now_ms = clock.epoch_ms();
        let cells: Vec<(String, Arc<BudgetCell>)> = self
            .cells
            .lock()
            .iter()
            .map(|(tenant, cell)| (tenant.clone(), Arc::clone(cell)))
            .collect();

        for (tenant, cell) in cells {
            if cell.scope == BudgetScope::TaskLocal {
                continue;
            }
            let reset_at = cell.reset_at_ms.load(Ordering::Acquire);
            if now_ms < reset_at {
                continue;
            }
            let next = next_reset_ms(cell.scope, now_ms, self.config.reset_hour_utc);
            if cell
                .reset_at_ms
                .compare_exchange(reset_at, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue; // Another reset won the race this window.
            }
            cell.consumed.store(0, Ordering::Release);
            cell.alerted.store(0, Ordering::Release);

            debug!(tenant = %tenant, next_reset_ms = next, "budget window reset");
            self.auditor
                .publish(Event::BudgetReset { tenant: tenant.clone(), reset_at_ms: next });
            self.audit_budget(&self.snapshot_cell(&tenant, &cell), "reset", None, clock)?;
        }
        Ok(())
    }

    /// Emit threshold alerts, once per threshold per window.
    fn check_alerts(&self, tenant: &str, cell: &BudgetCell) {
        let limit = cell.limit.load(Ordering::Acquire);
        if limit == 0 {
            return;
        }
        let consumed = cell.consumed.load(Ordering::Acquire);
        let pct = (consumed as f64 / limit as f64) * 100.0;

        for (threshold, bit) in
            [(self.config.warn_pct, ALERT_WARN), (self.config.crit_pct, ALERT_CRIT)]
        {
            if pct >= f64::from(threshold) {
                let prior = cell.alerted.fetch_or(bit, Ordering::AcqRel);
                if prior & bit == 0 {
                    self.auditor.publish(Event::BudgetAlert {
                        tenant: tenant.to_string(),
                        threshold_pct: threshold,
                    });
                }
            }
        }
    }

    fn snapshot_cell(&self, tenant: &str, cell: &BudgetCell) -> TenantBudget {
        TenantBudget {
            tenant: tenant.to_string(),
            scope: cell.scope,
            limit: cell.limit.load(Ordering::Acquire),
            consumed: cell.consumed.load(Ordering::Acquire),
            reset_at_ms: cell.reset_at_ms.load(Ordering::Acquire),
            schema_version: 1,
        }
    }

    fn audit_budget(
        &self,
        budget: &TenantBudget,
        to_state: &str,
        reason: Option<String>,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let from = self
            .auditor
            .with_state(|state| state.budgets.get(&budget.tenant).map(|b| b.consumed));
        let entry = AuditEntry::new(
            clock.epoch_ms(),
            EntityKind::TenantBudget,
            budget.tenant.clone(),
            from.map(|c| format!("consumed:{}", c)).unwrap_or_else(|| "absent".into()),
            to_state,
            "budget",
            reason,
            serde_json::to_value(budget).map_err(fm_storage::AuditError::from)?,
        );
        self.auditor.record(entry, vec![])?;
        Ok(())
    }
}

/// Epoch milliseconds of the next window boundary after `after_ms`.
fn next_reset_ms(scope: BudgetScope, after_ms: u64, reset_hour_utc: u32) -> u64 {
    let at = |ms: u64| {
        Utc.timestamp_millis_opt(ms as i64)
            .single()
            .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH)
    };
    match scope {
        BudgetScope::TaskLocal => u64::MAX,
        BudgetScope::Daily => {
            let after = at(after_ms);
            let candidate = after
                .date_naive()
                .and_hms_opt(reset_hour_utc, 0, 0)
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or(after);
            let next = if candidate.timestamp_millis() as u64 > after_ms {
                candidate
            } else {
                candidate + chrono::Duration::days(1)
            };
            next.timestamp_millis() as u64
        }
        BudgetScope::Monthly => {
            let after = at(after_ms);
            let first_this_month = after
                .date_naive()
                .with_day(1)
                .and_then(|d| d.and_hms_opt(reset_hour_utc, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or(after);
            let next = if first_this_month.timestamp_millis() as u64 > after_ms {
                first_this_month
            } else {
                // First day of the following month.
                let (year, month) = if after.month() == 12 {
                    (after.year() + 1, 1)
                } else {
                    (after.year(), after.month() + 1)
                };
                chrono::NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(reset_hour_utc, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt))
                    .unwrap_or(first_this_month)
            };
            next.timestamp_millis() as u64
        }
    }
}

#[cfg(test)]
#[path = "budget_tests.rs"]
mod tests;
