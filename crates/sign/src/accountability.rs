//! Root-only accountability chain over consecutive global roots.
//!
//! Each round's back link hashes the previous round's number, back link,
//! and global Merkle root:
//!
//! ```text
//! back_link(R)   = H(R-1 ‖ back_link(R-1) ‖ mt_root(R-1))     back_link(first) = 0
//! acc_round(R)   = H(R ‖ back_link(R))
//! ```
//!
//! An auditor holding `(R, acc_round, mt_root, back_link)` for any round
//! can verify continuity by walking forward with the retained roots.

use cosi_common::HashId;
use tracing::warn;

/// One closed round, as retained for auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccRecord {
    pub round: u64,
    pub mt_root: HashId,
    pub back_link: HashId,
    pub acc_round: HashId,
}

/// The root's in-memory chain of closed rounds.
#[derive(Debug, Default)]
pub struct AccountabilityLog {
    records: Vec<AccRecord>,
}

fn chain_hash(round: u64, back_link: &HashId, mt_root: &HashId) -> HashId {
    HashId::hash_parts(&[&round.to_le_bytes(), back_link.as_ref(), mt_root.as_ref()])
}

impl AccountabilityLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The back link for round `round`, derived from the last retained
    /// record. Zero when there is no predecessor; a gap (the predecessor
    /// round failed and was never retained) also yields zero, restarting
    /// the chain.
    #[must_use]
    pub fn back_link_for(&self, round: u64) -> HashId {
        match self.records.last() {
            Some(prev) if prev.round + 1 == round => {
                chain_hash(prev.round, &prev.back_link, &prev.mt_root)
            }
            Some(prev) => {
                warn!(round, last_retained = prev.round, "back link gap, restarting chain");
                HashId::ZERO
            }
            None => HashId::ZERO,
        }
    }

    /// `acc_round` for a round with a known back link.
    #[must_use]
    pub fn acc_round_for(round: u64, back_link: &HashId) -> HashId {
        HashId::hash_parts(&[&round.to_le_bytes(), back_link.as_ref()])
    }

    /// Retain a closed round.
    pub fn append(&mut self, round: u64, mt_root: HashId, back_link: HashId, acc_round: HashId) {
        self.records.push(AccRecord {
            round,
            mt_root,
            back_link,
            acc_round,
        });
    }

    #[must_use]
    pub fn records(&self) -> &[AccRecord] {
        &self.records
    }

    #[must_use]
    pub fn last(&self) -> Option<&AccRecord> {
        self.records.last()
    }

    /// Walk the retained chain forward and check every link.
    #[must_use]
    pub fn verify_chain(&self) -> bool {
        for window in self.records.windows(2) {
            let (prev, next) = (&window[0], &window[1]);
            if prev.round + 1 != next.round {
                // A gap restarts the chain at zero.
                if !next.back_link.is_zero() {
                    return false;
                }
                continue;
            }
            if next.back_link != chain_hash(prev.round, &prev.back_link, &prev.mt_root) {
                return false;
            }
        }
        self.records.iter().all(|record| {
            record.acc_round == Self::acc_round_for(record.round, &record.back_link)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_round(log: &mut AccountabilityLog, round: u64, statement: &[u8]) {
        let back_link = log.back_link_for(round);
        let acc_round = AccountabilityLog::acc_round_for(round, &back_link);
        log.append(round, HashId::hash(statement), back_link, acc_round);
    }

    #[test]
    fn test_first_round_links_to_zero() {
        let mut log = AccountabilityLog::new();
        append_round(&mut log, 1, b"r1");
        assert_eq!(log.records()[0].back_link, HashId::ZERO);
        assert!(log.verify_chain());
    }

    #[test]
    fn test_consecutive_rounds_chain() {
        let mut log = AccountabilityLog::new();
        for round in 1..=5 {
            append_round(&mut log, round, format!("Hello World{round}").as_bytes());
        }
        assert!(log.verify_chain());

        // Spot-check the definition at round 3.
        let r2 = &log.records()[1];
        let expected = HashId::hash_parts(&[&2u64.to_le_bytes(), r2.back_link.as_ref(), r2.mt_root.as_ref()]);
        assert_eq!(log.records()[2].back_link, expected);
    }

    #[test]
    fn test_tampered_root_breaks_chain() {
        let mut log = AccountabilityLog::new();
        for round in 1..=3 {
            append_round(&mut log, round, format!("r{round}").as_bytes());
        }
        log.records[1].mt_root = HashId::hash(b"rewritten-history");
        assert!(!log.verify_chain());
    }

    #[test]
    fn test_gap_restarts_chain() {
        let mut log = AccountabilityLog::new();
        append_round(&mut log, 1, b"r1");
        // Round 2 failed; round 3 links to zero.
        append_round(&mut log, 3, b"r3");
        assert_eq!(log.records()[1].back_link, HashId::ZERO);
        assert!(log.verify_chain());
    }
}
