use crate::session::{SessionShared, SessionState};

use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide id→session index. Entries are the cross-thread summaries;
/// the rich session object never leaves its worker. Passed around as an
/// explicit context object.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<SessionShared>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn register(&self, session: Arc<SessionShared>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn deregister(&self, id: u64) {
        self.sessions.remove(&id);
    }

    /// Look up a session and take a reference on it under the shard lock.
    /// Sessions already stopping or freed are not handed out.
    pub fn get_by_id(&self, id: u64) -> Option<Arc<SessionShared>> {
        let entry = self.sessions.get(&id)?;
        let session = entry.value();
        if session.get_ref() {
            Some(Arc::clone(session))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot for the admin surface.
    pub fn snapshot(&self) -> Vec<Arc<SessionShared>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count_in_state(&self, state: SessionState) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionShared;

    #[test]
    fn lookup_refuses_stopping_sessions() {
        let registry = SessionRegistry::new();
        let session = Arc::new(SessionShared::new(1, "app", "localhost", "rw-split"));
        session.set_state(SessionState::Started);
        registry.register(Arc::clone(&session));

        let found = registry.get_by_id(session.id()).unwrap();
        found.put_ref();

        session.set_state(SessionState::Stopping);
        assert!(registry.get_by_id(session.id()).is_none());
        registry.deregister(session.id());
        assert!(registry.get_by_id(session.id()).is_none());
    }
}
