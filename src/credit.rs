//! Server-side credit accounting.
//!
//! The controller is the only cross-upload shared state on the server. It
//! tracks how much send credit is outstanding across all uploads (the
//! "debt"), hands out an initial grant when an upload is accepted, and
//! tops uploads up as writes complete, subject to the per-upload ceiling
//! and the global budget. It is owned and mutated by the event loop only,
//! so it needs no locking.
//!
//! Credit is counted in whole chunks; the byte budget is the chunk budget
//! times the server-wide chunk size.

use crate::transport::ClientId;
use std::collections::HashMap;
use std::time::Instant;

/// Per-upload credit handle.
#[derive(Debug)]
struct Grant {
    credit: u32,
    maxqueue: u32,
    last_activity: Instant,
    /// Set while the upload is being probed for liveness; suspended
    /// grants are skipped by distribution until activity clears them.
    suspended: bool,
}

/// Global credit scheduler.
#[derive(Debug)]
pub struct CreditController {
    /// Total credit that may be outstanding at once, in chunks.
    budget: u32,
    /// Distribution runs whenever debt falls below this.
    low_watermark: u32,
    /// Uploads already holding this much credit are skipped by top-ups.
    topup_threshold: u32,
    debt: u32,
    grants: HashMap<ClientId, Grant>,
}

impl CreditController {
    pub fn new(budget: u32, low_watermark: u32, topup_threshold: u32) -> Self {
        Self {
            budget,
            low_watermark,
            topup_threshold,
            debt: 0,
            grants: HashMap::new(),
        }
    }

    /// Registers a newly accepted upload and returns its initial credit.
    ///
    /// The grant is `min(maxqueue, budget - debt)` and may be zero; a
    /// zero-credit upload is approved but quiescent until a later top-up.
    pub fn on_accept(&mut self, id: ClientId, maxqueue: u32, now: Instant) -> u32 {
        let initial = maxqueue.min(self.budget.saturating_sub(self.debt));
        self.debt += initial;
        self.grants.insert(
            id,
            Grant {
                credit: initial,
                maxqueue,
                last_activity: now,
                suspended: false,
            },
        );
        initial
    }

    /// One chunk was persisted: the client spent one credit.
    pub fn on_write_complete(&mut self, id: ClientId, now: Instant) {
        if let Some(grant) = self.grants.get_mut(&id) {
            if grant.credit > 0 {
                grant.credit -= 1;
                self.debt = self.debt.saturating_sub(1);
            }
            grant.last_activity = now;
            grant.suspended = false;
        }
    }

    /// Records liveness without changing credit.
    pub fn on_activity(&mut self, id: ClientId, now: Instant) {
        if let Some(grant) = self.grants.get_mut(&id) {
            grant.last_activity = now;
            grant.suspended = false;
        }
    }

    /// Current outstanding credit for one upload.
    pub fn credit_of(&self, id: ClientId) -> u32 {
        self.grants.get(&id).map(|g| g.credit).unwrap_or(0)
    }

    /// Reclaims an unresponsive upload's outstanding credit.
    ///
    /// The grant stays registered; a live client resynchronizes via the
    /// status report and is re-funded by the next distribution pass.
    pub fn on_timeout(&mut self, id: ClientId) -> u32 {
        if let Some(grant) = self.grants.get_mut(&id) {
            let reclaimed = grant.credit;
            grant.credit = 0;
            grant.suspended = true;
            self.debt = self.debt.saturating_sub(reclaimed);
            reclaimed
        } else {
            0
        }
    }

    /// Removes an upload and returns its credit to the pool.
    pub fn on_disconnect(&mut self, id: ClientId) {
        if let Some(grant) = self.grants.remove(&id) {
            self.debt = self.debt.saturating_sub(grant.credit);
        }
    }

    /// Whether a distribution pass would be useful right now.
    pub fn needs_distribution(&self) -> bool {
        self.debt < self.low_watermark && !self.grants.is_empty()
    }

    /// Hands newly available budget to the hungriest uploads.
    ///
    /// Candidates below the top-up threshold are served in order of lowest
    /// `credit / maxqueue` ratio, ties broken by oldest activity; each is
    /// filled to its ceiling while budget remains. Returns the `(upload,
    /// amount)` pairs to announce with `transfer-credit`.
    pub fn distribute(&mut self) -> Vec<(ClientId, u32)> {
        let mut candidates: Vec<ClientId> = self
            .grants
            .iter()
            .filter(|(_, g)| !g.suspended && g.credit < self.topup_threshold && g.credit < g.maxqueue)
            .map(|(id, _)| *id)
            .collect();

        // Lowest fill ratio first; compare a/b < c/d as a*d < c*b to stay
        // in integers.
        candidates.sort_by(|a, b| {
            let ga = &self.grants[a];
            let gb = &self.grants[b];
            let ra = ga.credit as u64 * gb.maxqueue as u64;
            let rb = gb.credit as u64 * ga.maxqueue as u64;
            ra.cmp(&rb)
                .then_with(|| ga.last_activity.cmp(&gb.last_activity))
        });

        let mut transfers = Vec::new();
        for id in candidates {
            if self.debt >= self.budget {
                break;
            }
            let grant = self.grants.get_mut(&id).expect("candidate id is live");
            let headroom = grant.maxqueue - grant.credit;
            let amount = headroom.min(self.budget - self.debt);
            if amount == 0 {
                continue;
            }
            grant.credit += amount;
            self.debt += amount;
            transfers.push((id, amount));
        }
        transfers
    }

    /// Total outstanding credit, in chunks.
    pub fn debt(&self) -> u32 {
        self.debt
    }

    /// Number of registered uploads.
    pub fn active(&self) -> usize {
        self.grants.len()
    }
}
