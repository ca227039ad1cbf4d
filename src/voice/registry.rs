//! # Session Registry
//!
//! The process-wide map of live sessions. Admission is atomic: the capacity
//! check, the duplicate check and the insert happen under one write lock, so
//! two connections racing on the same id can never both own it.
//!
//! ## Ownership:
//! The registry only holds each session's immutable profile and its shared
//! [`SessionControl`]. Audio buffers and conversation memory stay inside the
//! session task and are released when that task ends.

use super::session::{SessionControl, SessionProfile, SessionState};
use crate::error::VoiceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// A live session as seen from outside its task.
#[derive(Debug)]
pub struct SessionHandle {
    pub profile: SessionProfile,
    pub control: Arc<SessionControl>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.profile.session_id.clone(),
            user_id: self.profile.user_id.clone(),
            agent_id: self.profile.agent.id.clone(),
            agent_name: self.profile.agent.name.clone(),
            language: self.profile.language.clone(),
            state: self.control.state(),
            created_at: self.profile.created_at,
        }
    }
}

/// Read-only view returned by the sessions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub language: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// Result of [`SessionRegistry::create`].
#[derive(Debug)]
pub enum Admission {
    /// The caller now owns the session id
    Created(Arc<SessionHandle>),
    /// The id was already live; the existing session is returned untouched
    Existing(Arc<SessionHandle>),
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Admit a session, or return the one already registered under the same id.
    ///
    /// ## Returns:
    /// - **Ok(Created)**: inserted; `control` is now the live controller for this id
    /// - **Ok(Existing)**: the id is taken; nothing was changed
    /// - **Err(CapacityReached)**: the registry is full
    pub fn create(&self, profile: SessionProfile, control: Arc<SessionControl>) -> Result<Admission, VoiceError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = sessions.get(&profile.session_id) {
            return Ok(Admission::Existing(existing.clone()));
        }
        if sessions.len() >= self.max_sessions {
            return Err(VoiceError::CapacityReached(self.max_sessions));
        }

        let session_id = profile.session_id.clone();
        let handle = Arc::new(SessionHandle { profile, control });
        sessions.insert(session_id.clone(), handle.clone());
        info!(session_id = %session_id, active = sessions.len(), "Session registered");
        Ok(Admission::Created(handle))
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>, VoiceError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| VoiceError::SessionNotFound(session_id.to_string()))
    }

    /// Remove a session and tell its task to stop. Safe to call repeatedly.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        match removed {
            Some(handle) => {
                handle.control.terminate();
                info!(session_id, "Session removed");
                true
            }
            None => {
                debug!(session_id, "Session already removed");
                false
            }
        }
    }

    /// Remove `session_id` only if it is still owned by `control`.
    ///
    /// Used by a session task on teardown so it can never evict a newer
    /// session that reused its id.
    pub fn release(&self, session_id: &str, control: &Arc<SessionControl>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let owned = sessions
            .get(session_id)
            .map_or(false, |handle| Arc::ptr_eq(&handle.control, control));
        if owned {
            sessions.remove(session_id);
            debug!(session_id, active = sessions.len(), "Session released");
        }
        owned
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Number of live sessions per state.
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = BTreeMap::new();
        for handle in sessions.values() {
            *counts.entry(handle.control.state().as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentDirectory, StaticAgentDirectory};
    use std::thread;

    fn profile(id: &str) -> SessionProfile {
        let agent = StaticAgentDirectory::builtin("eve_black_career").default_agent();
        SessionProfile {
            session_id: id.to_string(),
            user_id: "u1".to_string(),
            voice_id: agent.voice_for("en-IN"),
            agent,
            language: "en-IN".to_string(),
            region: "IN".to_string(),
            consent: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_is_idempotent_per_id() {
        let registry = SessionRegistry::new(10);
        let first = Arc::new(SessionControl::new());
        let second = Arc::new(SessionControl::new());

        assert!(matches!(
            registry.create(profile("s1"), first.clone()).unwrap(),
            Admission::Created(_)
        ));
        match registry.create(profile("s1"), second).unwrap() {
            Admission::Existing(handle) => assert!(Arc::ptr_eq(&handle.control, &first)),
            Admission::Created(_) => panic!("second create must not replace the session"),
        }
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let registry = SessionRegistry::new(10);
        let control = Arc::new(SessionControl::new());
        registry.create(profile("s1"), control.clone()).unwrap();

        assert_eq!(registry.get("s1").unwrap().profile.user_id, "u1");
        assert_eq!(
            registry.get("nope").unwrap_err(),
            VoiceError::SessionNotFound("nope".to_string())
        );

        assert!(registry.remove("s1"));
        assert!(!registry.remove("s1"));
        assert!(registry.get("s1").is_err());
        // removal asks the session task to stop at its next checkpoint
        assert!(control.take_cancel());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(1);
        registry.create(profile("s1"), Arc::new(SessionControl::new())).unwrap();
        assert_eq!(
            registry
                .create(profile("s2"), Arc::new(SessionControl::new()))
                .unwrap_err(),
            VoiceError::CapacityReached(1)
        );
    }

    #[test]
    fn test_release_only_removes_own_session() {
        let registry = SessionRegistry::new(10);
        let owner = Arc::new(SessionControl::new());
        let stranger = Arc::new(SessionControl::new());
        registry.create(profile("s1"), owner.clone()).unwrap();

        assert!(!registry.release("s1", &stranger));
        assert_eq!(registry.count(), 1);
        assert!(registry.release("s1", &owner));
        assert!(!registry.release("s1", &owner));
    }

    #[test]
    fn test_concurrent_create_admits_exactly_one() {
        let registry = Arc::new(SessionRegistry::new(100));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    matches!(
                        registry.create(profile("shared"), Arc::new(SessionControl::new())),
                        Ok(Admission::Created(_))
                    )
                })
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(created, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_state_counts_and_snapshot() {
        let registry = SessionRegistry::new(10);
        let listening = Arc::new(SessionControl::new());
        listening.set_state(SessionState::Listening);
        registry.create(profile("a"), listening).unwrap();
        registry.create(profile("b"), Arc::new(SessionControl::new())).unwrap();

        let counts = registry.state_counts();
        assert_eq!(counts.get("listening"), Some(&1));
        assert_eq!(counts.get("connecting"), Some(&1));

        let snapshot = registry.get("a").unwrap().snapshot();
        assert_eq!(snapshot.agent_id, "eve_black_career");
        assert_eq!(snapshot.state, SessionState::Listening);
    }
}
