//! Deterministic failure injection for protocol tests.
//!
//! A node configured with a [`FailureSim`] consults it before every phase
//! send; a positive verdict silently drops the message, which is exactly
//! what a crashed or partitioned node looks like to the rest of the tree.
//! The PRNG is seeded from the node name so a test run is reproducible.
//! None of this participates in the production contract.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use cosi_common::HashId;

#[derive(Debug)]
pub struct FailureSim {
    /// Per-message drop probability, percent.
    rate: u8,
    /// Phases for which every send is dropped.
    dead_for: HashSet<String>,
    /// Node drops everything, all phases.
    dead: bool,
    rng: ChaCha8Rng,
}

impl FailureSim {
    /// Build a simulator seeded from the node name.
    #[must_use]
    pub fn new(name: &str, rate: u8) -> Self {
        let digest = HashId::hash(name.as_bytes());
        let seed = u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8-byte prefix"));
        FailureSim {
            rate: rate.min(100),
            dead_for: HashSet::new(),
            dead: false,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Mark a phase (`announce`, `commit`, `challenge`, `response`) dead.
    pub fn set_dead_for(&mut self, phase: &str, dead: bool) {
        if dead {
            self.dead_for.insert(phase.to_string());
        } else {
            self.dead_for.remove(phase);
        }
    }

    /// Drop everything from now on.
    pub fn die(&mut self) {
        self.dead = true;
    }

    /// Whether the next send for `phase` should be dropped.
    pub fn should_drop(&mut self, phase: &str) -> bool {
        if self.dead || self.dead_for.contains(phase) {
            return true;
        }
        self.rate > 0 && self.rng.gen_range(0..100u8) < self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_never_drops() {
        let mut sim = FailureSim::new("host0", 0);
        for _ in 0..100 {
            assert!(!sim.should_drop("commit"));
        }
    }

    #[test]
    fn test_full_rate_always_drops() {
        let mut sim = FailureSim::new("host0", 100);
        for _ in 0..100 {
            assert!(sim.should_drop("commit"));
        }
    }

    #[test]
    fn test_dead_for_is_per_phase() {
        let mut sim = FailureSim::new("host2", 0);
        sim.set_dead_for("commit", true);
        assert!(sim.should_drop("commit"));
        assert!(!sim.should_drop("response"));

        sim.set_dead_for("commit", false);
        assert!(!sim.should_drop("commit"));
    }

    #[test]
    fn test_die_kills_all_phases() {
        let mut sim = FailureSim::new("host5", 0);
        sim.die();
        for phase in ["announce", "commit", "challenge", "response"] {
            assert!(sim.should_drop(phase));
        }
    }

    #[test]
    fn test_same_name_same_verdicts() {
        let mut a = FailureSim::new("host3", 40);
        let mut b = FailureSim::new("host3", 40);
        let verdicts_a: Vec<bool> = (0..64).map(|_| a.should_drop("commit")).collect();
        let verdicts_b: Vec<bool> = (0..64).map(|_| b.should_drop("commit")).collect();
        assert_eq!(verdicts_a, verdicts_b);
    }
}
