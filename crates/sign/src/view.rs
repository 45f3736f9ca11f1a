//! View bookkeeping for leader rotation.
//!
//! A view is a numbered epoch naming which host acts as root:
//! `root_for(view) = host_list[view % len]` over the sorted host list.
//! When the current root stops advancing rounds, any node may propose the
//! next view; the change commits once a strict majority of hosts have
//! acknowledged it. While a change is in flight, new signing rounds are
//! refused with a distinguished error.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// The host acting as root in `view`.
#[must_use]
pub fn root_for(host_list: &[String], view: u64) -> &str {
    &host_list[(view as usize) % host_list.len()]
}

/// Acks needed to commit a view: a strict majority of the host list.
#[must_use]
pub fn quorum(host_count: usize) -> usize {
    host_count / 2 + 1
}

/// One node's view-change state.
#[derive(Debug, Default)]
pub struct ViewState {
    view_no: AtomicU64,
    changing: AtomicBool,
    am_next_root: AtomicBool,
    /// Highest view this node has proposed or seen proposed.
    proposed: Mutex<u64>,
    /// Hosts that acknowledged the proposed view.
    acks: Mutex<HashSet<String>>,
}

impl ViewState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.view_no.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_changing(&self) -> bool {
        self.changing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn am_next_root(&self) -> bool {
        self.am_next_root.load(Ordering::Acquire)
    }

    pub fn set_am_next_root(&self, val: bool) {
        self.am_next_root.store(val, Ordering::Release);
    }

    /// Begin changing to `proposed`. Returns false if that view was
    /// already proposed or committed (flood deduplication).
    pub fn start_change(&self, proposed: u64) -> bool {
        if proposed <= self.current() {
            return false;
        }
        let mut highest = self.proposed.lock();
        if proposed <= *highest {
            return false;
        }
        *highest = proposed;
        self.acks.lock().clear();
        self.changing.store(true, Ordering::Release);
        true
    }

    /// Record an ack for `view`. Returns the new ack count if the
    /// accepter was new, `None` for duplicates or stale views.
    pub fn record_ack(&self, view: u64, accepter: &str) -> Option<usize> {
        if view != *self.proposed.lock() || view <= self.current() {
            return None;
        }
        let mut acks = self.acks.lock();
        if acks.insert(accepter.to_string()) {
            Some(acks.len())
        } else {
            None
        }
    }

    /// Install the new view and leave the changing state.
    pub fn commit(&self, view: u64) {
        self.view_no.store(view, Ordering::Release);
        self.changing.store(false, Ordering::Release);
        self.acks.lock().clear();
    }
}
