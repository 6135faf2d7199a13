//! Per-tenant concurrency limiter.
//!
//! Admission and release happen under one mutex, so no two callers can both
//! observe "under limit" when a single slot is free. An admitted caller holds
//! a `SlotTicket`; the slot returns to the tenant when the ticket is dropped,
//! which makes a double release impossible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::model::TenantId;

#[derive(Debug, Default, Clone, Copy)]
struct Slots {
    limit: u32,
    in_flight: u32,
}

/// Result of `ConcurrencyLimiter::try_admit`.
#[derive(Debug)]
pub enum Admission {
    /// A slot was granted; it is held until the ticket is dropped.
    Admitted(SlotTicket),
    /// The tenant is at its limit. Nothing was mutated.
    Rejected { in_flight: u32, limit: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Tracks in-flight pipeline counts per tenant against configured limits.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimiter {
    inner: Arc<Mutex<HashMap<TenantId, Slots>>>,
    default_limit: u32,
}

impl ConcurrencyLimiter {
    /// Create a limiter; tenants never configured use `default_limit`.
    pub fn new(default_limit: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            default_limit,
        }
    }

    /// Set the limit for `tenant`. Lowering a limit below the current
    /// in-flight count does not evict anything; new admissions simply wait.
    pub fn configure(&self, tenant: &TenantId, limit: u32) {
        if let Ok(mut slots) = self.inner.lock() {
            slots.entry(tenant.clone()).or_default().limit = limit;
        }
    }

    /// Atomically admit one pipeline for `tenant` if it is below its limit.
    pub fn try_admit(&self, tenant: &TenantId) -> Admission {
        let Ok(mut slots) = self.inner.lock() else {
            warn!(tenant = %tenant, "concurrency limiter lock poisoned, rejecting admission");
            return Admission::Rejected {
                in_flight: 0,
                limit: 0,
            };
        };
        let default_limit = self.default_limit;
        let entry = slots.entry(tenant.clone()).or_insert(Slots {
            limit: default_limit,
            in_flight: 0,
        });
        if entry.in_flight >= entry.limit {
            debug!(
                tenant = %tenant,
                in_flight = entry.in_flight,
                limit = entry.limit,
                "admission deferred"
            );
            return Admission::Rejected {
                in_flight: entry.in_flight,
                limit: entry.limit,
            };
        }
        entry.in_flight += 1;
        Admission::Admitted(SlotTicket {
            limiter: self.clone(),
            tenant: tenant.clone(),
        })
    }

    /// Take a slot for a pipeline that was already running before restart.
    ///
    /// Reclaimed slots count even if they exceed the limit: those pipelines
    /// exist whether or not the limit was lowered in the meantime.
    pub fn reclaim(&self, tenant: &TenantId) -> SlotTicket {
        if let Ok(mut slots) = self.inner.lock() {
            let default_limit = self.default_limit;
            let entry = slots.entry(tenant.clone()).or_insert(Slots {
                limit: default_limit,
                in_flight: 0,
            });
            entry.in_flight += 1;
            if entry.in_flight > entry.limit {
                warn!(
                    tenant = %tenant,
                    in_flight = entry.in_flight,
                    limit = entry.limit,
                    "recovered pipelines exceed tenant limit"
                );
            }
        }
        SlotTicket {
            limiter: self.clone(),
            tenant: tenant.clone(),
        }
    }

    /// Return one slot to `tenant`. Clamps at zero.
    pub fn release(&self, tenant: &TenantId) {
        if let Ok(mut slots) = self.inner.lock() {
            match slots.get_mut(tenant) {
                Some(entry) if entry.in_flight > 0 => entry.in_flight -= 1,
                _ => warn!(
                    tenant = %tenant,
                    "release with no in-flight pipelines, clamping at zero"
                ),
            }
        }
    }

    pub fn in_flight(&self, tenant: &TenantId) -> u32 {
        self.inner
            .lock()
            .ok()
            .and_then(|slots| slots.get(tenant).map(|s| s.in_flight))
            .unwrap_or(0)
    }

    pub fn limit(&self, tenant: &TenantId) -> u32 {
        self.inner
            .lock()
            .ok()
            .and_then(|slots| slots.get(tenant).map(|s| s.limit))
            .unwrap_or(self.default_limit)
    }
}

/// A held concurrency slot. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct SlotTicket {
    limiter: ConcurrencyLimiter,
    tenant: TenantId,
}

impl SlotTicket {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        self.limiter.release(&self.tenant);
    }
}
