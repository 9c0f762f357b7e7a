use core::fmt;
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
    thread::sleep,
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    error::DbError,
    types::{Completion, PageKey, SessionId, TreeHandle},
};

/// Default patience before a claim attempt gives up with an in-use
/// signal.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// What a claim protects: a whole tree or one buffered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimTarget {
    Tree(TreeHandle),
    Page(PageKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct ClaimTableInner {
    shared: HashMap<ClaimTarget, HashMap<SessionId, usize>>,
    exclusive: HashMap<ClaimTarget, (SessionId, usize)>,
}

impl ClaimTableInner {
    // Idempotent attempt; reentrant for the owning session. Returns
    // false when another session stands in the way.
    fn try_claim(&mut self, session: SessionId, target: ClaimTarget, claim: Claim) -> bool {
        if let Some((owner, count)) = self.exclusive.get_mut(&target) {
            if *owner != session {
                return false;
            }
            // the exclusive claim covers reentrant shared requests too
            *count += 1;
            return true;
        }

        match claim {
            Claim::Shared => {
                *self
                    .shared
                    .entry(target)
                    .or_insert_with(HashMap::new)
                    .entry(session)
                    .or_insert(0) += 1;
                true
            }
            Claim::Exclusive => {
                if let Some(readers) = self.shared.get(&target) {
                    // an upgrade is allowed only when this session is
                    // the lone reader; its shared counts fold into the
                    // exclusive claim
                    if readers.keys().any(|owner| *owner != session) {
                        return false;
                    }
                }
                let folded = self
                    .shared
                    .remove(&target)
                    .and_then(|m| m.get(&session).copied())
                    .unwrap_or(0);
                self.exclusive.insert(target, (session, folded + 1));
                true
            }
        }
    }

    fn release(&mut self, session: SessionId, target: ClaimTarget) {
        if let Some((owner, count)) = self.exclusive.get_mut(&target) {
            if *owner == session {
                *count -= 1;
                if *count == 0 {
                    self.exclusive.remove(&target);
                }
                return;
            }
        }
        if let Some(readers) = self.shared.get_mut(&target) {
            if let Some(count) = readers.get_mut(&session) {
                *count -= 1;
                if *count == 0 {
                    readers.remove(&session);
                }
            }
            if readers.is_empty() {
                self.shared.remove(&target);
            }
        }
    }
}

/// Reader/writer claims over trees and buffer frames: reentrant for
/// the owning session, acquired with a timeout, upgradable when the
/// session is the lone reader.
///
/// The table is a single latch registry polled under a mutex; actual
/// byte access goes through the target's own `RwLock` once the claim
/// is held.
pub struct ClaimTable {
    inner: Mutex<ClaimTableInner>,
    timeout: Duration,
}

impl ClaimTable {
    pub fn new() -> ClaimTable {
        Self::with_timeout(DEFAULT_CLAIM_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> ClaimTable {
        ClaimTable {
            inner: Mutex::new(ClaimTableInner::default()),
            timeout,
        }
    }

    /// Block until the claim is granted or the timeout expires. On
    /// expiry the operation fails with an in-use signal and no state
    /// change.
    pub fn claim(&self, session: SessionId, target: ClaimTarget, claim: Claim) -> Completion {
        self.claim_with_timeout(session, target, claim, self.timeout)
    }

    pub fn claim_with_timeout(
        &self,
        session: SessionId,
        target: ClaimTarget,
        claim: Claim,
        timeout: Duration,
    ) -> Completion {
        let start = Instant::now();
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.try_claim(session, target, claim) {
                    return Ok(());
                }
            }
            if start.elapsed() >= timeout {
                break;
            }
            sleep(POLL_INTERVAL);
        }

        let err = DbError::exhausted(&format!(
            "{:?} in use: session {} timed out waiting for {:?} claim",
            target, session, claim
        ));
        err.show_backtrace();
        Err(err)
    }

    /// Try once, without waiting.
    pub fn try_claim(&self, session: SessionId, target: ClaimTarget, claim: Claim) -> bool {
        self.inner.lock().unwrap().try_claim(session, target, claim)
    }

    pub fn release(&self, session: SessionId, target: ClaimTarget) {
        self.inner.lock().unwrap().release(session, target);
    }

    /// Drop every claim the session still holds. Used by the retry
    /// driver before restarting with stronger claims, and when a
    /// session ends.
    pub fn release_all(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();

        let targets: Vec<ClaimTarget> = inner
            .exclusive
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(t, _)| *t)
            .collect();
        for t in targets {
            inner.exclusive.remove(&t);
        }

        let targets: Vec<ClaimTarget> = inner
            .shared
            .iter()
            .filter(|(_, readers)| readers.contains_key(&session))
            .map(|(t, _)| *t)
            .collect();
        for t in targets {
            if let Some(readers) = inner.shared.get_mut(&t) {
                readers.remove(&session);
                if readers.is_empty() {
                    inner.shared.remove(&t);
                }
            }
        }
        debug!("session {} released all claims", session);
    }

    /// The strongest claim the session holds on the target.
    pub fn holds(&self, session: SessionId, target: ClaimTarget) -> Option<Claim> {
        let inner = self.inner.lock().unwrap();
        if let Some((owner, _)) = inner.exclusive.get(&target) {
            if *owner == session {
                return Some(Claim::Exclusive);
            }
        }
        if let Some(readers) = inner.shared.get(&target) {
            if readers.contains_key(&session) {
                return Some(Claim::Shared);
            }
        }
        None
    }
}

impl fmt::Display for ClaimTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        let mut depiction = "\n".to_string();

        depiction.push_str("shared: {");
        for (target, readers) in inner.shared.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?}", target, readers));
        }
        depiction.push_str("\n}\n");

        depiction.push_str("exclusive: {");
        for (target, owner) in inner.exclusive.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?}", target, owner));
        }
        depiction.push_str("\n}\n");

        write!(f, "{}", depiction)
    }
}

/// Quiesce barrier between structural operations and checkpoints.
///
/// Operations enter freely while no checkpoint is running, and may
/// nest (an operation that triggers another operation on the same
/// thread just raises the count). A checkpoint waits for the active
/// count to reach zero and only then closes the gate, so a nested
/// entry can never deadlock against it.
pub struct OpsGate {
    state: Mutex<GateState>,
    signal: Condvar,
}

#[derive(Default)]
struct GateState {
    active_ops: usize,
    checkpointing: bool,
}

pub struct OpGuard<'a> {
    gate: &'a OpsGate,
}

pub struct CheckpointGuard<'a> {
    gate: &'a OpsGate,
}

impl OpsGate {
    pub fn new() -> OpsGate {
        OpsGate {
            state: Mutex::new(GateState::default()),
            signal: Condvar::new(),
        }
    }

    pub fn enter_op(&self) -> OpGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.checkpointing {
            state = self.signal.wait(state).unwrap();
        }
        state.active_ops += 1;
        OpGuard { gate: self }
    }

    pub fn enter_checkpoint(&self) -> CheckpointGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.active_ops > 0 || state.checkpointing {
            state = self.signal.wait(state).unwrap();
        }
        state.checkpointing = true;
        CheckpointGuard { gate: self }
    }
}

impl Default for OpsGate {
    fn default() -> OpsGate {
        OpsGate::new()
    }
}

impl<'a> Drop for OpGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.active_ops -= 1;
        if state.active_ops == 0 {
            self.gate.signal.notify_all();
        }
    }
}

impl<'a> Drop for CheckpointGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.checkpointing = false;
        self.gate.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageKey;

    fn page(n: u64) -> ClaimTarget {
        ClaimTarget::Page(PageKey::new(1, n))
    }

    #[test]
    fn shared_claims_coexist() {
        let table = ClaimTable::new();
        table.claim(1, page(5), Claim::Shared).unwrap();
        table.claim(2, page(5), Claim::Shared).unwrap();
        assert_eq!(table.holds(1, page(5)), Some(Claim::Shared));
        assert_eq!(table.holds(2, page(5)), Some(Claim::Shared));
    }

    #[test]
    fn exclusive_excludes_others() {
        let table = ClaimTable::with_timeout(Duration::from_millis(20));
        table.claim(1, page(5), Claim::Exclusive).unwrap();

        let err = table.claim(2, page(5), Claim::Shared).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exhausted);

        table.release(1, page(5));
        table.claim(2, page(5), Claim::Shared).unwrap();
    }

    #[test]
    fn reentrant_for_owner() {
        let table = ClaimTable::new();
        table.claim(1, page(5), Claim::Exclusive).unwrap();
        table.claim(1, page(5), Claim::Exclusive).unwrap();
        table.claim(1, page(5), Claim::Shared).unwrap();

        table.release(1, page(5));
        table.release(1, page(5));
        assert_eq!(table.holds(1, page(5)), Some(Claim::Exclusive));
        table.release(1, page(5));
        assert_eq!(table.holds(1, page(5)), None);
    }

    #[test]
    fn lone_reader_upgrades() {
        let table = ClaimTable::with_timeout(Duration::from_millis(20));
        table.claim(1, page(5), Claim::Shared).unwrap();
        table.claim(1, page(5), Claim::Exclusive).unwrap();
        assert_eq!(table.holds(1, page(5)), Some(Claim::Exclusive));

        // both grants fold into the exclusive entry
        table.release(1, page(5));
        table.release(1, page(5));
        assert_eq!(table.holds(1, page(5)), None);
    }

    #[test]
    fn contended_upgrade_times_out() {
        let table = ClaimTable::with_timeout(Duration::from_millis(20));
        table.claim(1, page(5), Claim::Shared).unwrap();
        table.claim(2, page(5), Claim::Shared).unwrap();

        let err = table.claim(1, page(5), Claim::Exclusive).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exhausted);
        // the failed upgrade left the shared claim in place
        assert_eq!(table.holds(1, page(5)), Some(Claim::Shared));
    }

    #[test]
    fn release_all_clears_session() {
        let table = ClaimTable::new();
        table.claim(1, page(1), Claim::Shared).unwrap();
        table.claim(1, page(2), Claim::Exclusive).unwrap();
        table.claim(1, ClaimTarget::Tree(9), Claim::Shared).unwrap();

        table.release_all(1);
        assert_eq!(table.holds(1, page(1)), None);
        assert_eq!(table.holds(1, page(2)), None);
        assert_eq!(table.holds(1, ClaimTarget::Tree(9)), None);
    }

    #[test]
    fn ops_gate_nests_and_excludes_checkpoints() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let gate = Arc::new(OpsGate::new());

        // nesting on one thread never blocks
        let outer = gate.enter_op();
        let inner = gate.enter_op();
        drop(inner);

        // a checkpoint waits for the outer op to finish
        let reached = Arc::new(AtomicBool::new(false));
        let handle = {
            let gate = gate.clone();
            let reached = reached.clone();
            std::thread::spawn(move || {
                let _cp = gate.enter_checkpoint();
                reached.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(30));
        assert!(!reached.load(Ordering::SeqCst));

        drop(outer);
        handle.join().unwrap();
        assert!(reached.load(Ordering::SeqCst));
    }
}
