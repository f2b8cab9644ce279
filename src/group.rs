//! Session group (spec §4.8): a per-application map of logical sessions,
//! keyed by session ID, with a broadcast that tolerates handlers calling back
//! into the group mid-iteration.
//!
//! Grounded in `Common/SessionGroup.go`'s map + recursive-mutex design; the
//! Rust translation is the read-snapshot-then-iterate pattern recorded in
//! SPEC_FULL.md §5 (no safe recursive write lock exists here).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Owns logical sessions by ID. Generic over `T`, the application's own
/// logical-session type — the core has no opinion on what that type looks
/// like beyond requiring it be shareable across the broadcast snapshot.
pub struct SessionGroup<T> {
    sessions: Mutex<HashMap<u64, Arc<T>>>,
    running: AtomicBool,
}

impl<T> Default for SessionGroup<T> {
    fn default() -> Self {
        SessionGroup::new()
    }
}

impl<T> SessionGroup<T> {
    pub fn new() -> Self {
        SessionGroup { sessions: Mutex::new(HashMap::new()), running: AtomicBool::new(false) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Adds `session` under `id`. Fails if `id` is already present.
    pub fn add(&self, id: u64, session: Arc<T>) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&id) {
            return Err(Error::DuplicateSession { id });
        }
        sessions.insert(id, session);
        Ok(())
    }

    pub fn remove(&self, id: u64) -> Option<Arc<T>> {
        self.sessions.lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Linear scan lookup by an application-defined predicate (spec: "lookup
    /// by name").
    pub fn find<F: Fn(&T) -> bool>(&self, pred: F) -> Option<Arc<T>> {
        self.sessions.lock().unwrap().values().find(|s| pred(s)).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` once per session. Takes a short-lived lock only to clone a
    /// snapshot `Vec` of the current sessions, then releases it before
    /// invoking `f` — so a handler that calls `remove`/`get`/`add` on this
    /// same group from inside `f` never deadlocks, the property the original
    /// recursive mutex existed to provide.
    pub fn broadcast<F: FnMut(&Arc<T>)>(&self, mut f: F) {
        let snapshot: Vec<Arc<T>> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in &snapshot {
            f(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(u64);

    #[test]
    fn rejects_duplicate_id() {
        let group: SessionGroup<Dummy> = SessionGroup::new();
        group.add(1, Arc::new(Dummy(1))).unwrap();
        let err = group.add(1, Arc::new(Dummy(1))).unwrap_err();
        assert!(matches!(err, Error::DuplicateSession { id: 1 }));
    }

    #[test]
    fn broadcast_survives_self_removal() {
        let group: SessionGroup<Dummy> = SessionGroup::new();
        group.add(1, Arc::new(Dummy(1))).unwrap();
        group.add(2, Arc::new(Dummy(2))).unwrap();

        group.broadcast(|session| {
            // A handler removing itself mid-broadcast must not deadlock.
            let _ = group.remove(session.0);
        });

        assert!(group.is_empty());
    }

    #[test]
    fn find_by_predicate() {
        let group: SessionGroup<Dummy> = SessionGroup::new();
        group.add(7, Arc::new(Dummy(7))).unwrap();
        let found = group.find(|d| d.0 == 7);
        assert!(found.is_some());
        assert!(group.find(|d| d.0 == 99).is_none());
    }
}
