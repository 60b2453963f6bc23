//! Slot generations and claim token issuance

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::job::ClaimToken;

/// Current generation of every execution slot of one queue instance
///
/// Claims are minted here, and here they are judged. A claim of the current
/// run is stale once its slot's generation has been replaced. A claim of any
/// other run, whichever instance made it, is stale once that run stops
/// heartbeating.
#[derive(Debug)]
pub struct GenerationTable {
    owner: String,
    run_id: RwLock<Uuid>,
    slots: RwLock<HashMap<String, u64>>,
}

impl GenerationTable {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            run_id: RwLock::new(Uuid::now_v7()),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn run_id(&self) -> Uuid {
        *self.run_id.read()
    }

    /// Start a new run: every claim of the previous run becomes stale
    pub fn begin_run(&self) -> Uuid {
        let run_id = Uuid::now_v7();
        *self.run_id.write() = run_id;
        self.slots.write().clear();
        run_id
    }

    /// Claim token for the slot's current generation
    pub fn token(&self, slot: &str) -> ClaimToken {
        let generation = *self.slots.write().entry(slot.to_string()).or_insert(0);
        ClaimToken::new(self.owner.clone(), self.run_id(), slot, generation)
    }

    /// Record a restart of the slot's worker; returns the new generation
    pub fn bump(&self, slot: &str) -> u64 {
        let mut slots = self.slots.write();
        let generation = slots.entry(slot.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn current(&self, slot: &str) -> Option<u64> {
        self.slots.read().get(slot).copied()
    }

    /// True if the claim's worker is gone
    ///
    /// `live_runs` are the runs with a recent heartbeat.
    pub fn is_stale(&self, claim: &ClaimToken, live_runs: &HashSet<Uuid>) -> bool {
        if claim.run_id == self.run_id() {
            return self.is_superseded(claim);
        }
        !live_runs.contains(&claim.run_id)
    }

    /// True if the claim was not issued for the current generation of this run
    pub fn is_superseded(&self, claim: &ClaimToken) -> bool {
        claim.run_id != self.run_id() || self.current(&claim.slot) != Some(claim.generation)
    }
}
