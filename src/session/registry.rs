//! Session Registry
//!
//! In-memory map from connection id to session, using DashMap. Mutation goes
//! through `upsert`/`update`, which run a state-machine step while holding the
//! entry lock, so readers only ever see whole transitions.

use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::SessionError;
use super::events::SessionEvent;
use super::machine::Step;
use super::state::{Session, SessionInfo, SessionStatus};
use crate::protocol::ConnectionId;

/// Registry of every session known to one client instance
pub struct SessionRegistry {
    /// Sessions (connection_id -> Session)
    sessions: Arc<DashMap<ConnectionId, Session>>,
    /// Notification broadcaster
    event_tx: broadcast::Sender<SessionEvent>,
    /// Maximum simultaneously active sessions
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::with_limits(10)
    }

    /// Create with a custom session limit
    pub fn with_limits(max_sessions: usize) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            sessions: Arc::new(DashMap::new()),
            event_tx,
            max_sessions,
        }
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Broadcast a notification
    pub fn notify(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Snapshot of a session
    pub fn get(&self, id: &ConnectionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| SessionInfo::from(s.value()))
    }

    /// Current status of a session
    pub fn status(&self, id: &ConnectionId) -> Option<SessionStatus> {
        self.sessions.get(id).map(|s| s.status)
    }

    /// Read a session without cloning it
    pub fn with_session<R>(&self, id: &ConnectionId, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.sessions.get(id).map(|s| f(s.value()))
    }

    /// Apply `f` to the session, creating an idle one first if absent
    pub fn upsert<F>(&self, id: &ConnectionId, f: F) -> Result<Step, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<Step, SessionError>,
    {
        let step = {
            let mut entry = self
                .sessions
                .entry(id.clone())
                .or_insert_with(|| Session::new(id.clone()));
            f(entry.value_mut())?
        };

        self.publish(&step);
        Ok(step)
    }

    /// Apply `f` to an existing session.
    ///
    /// `f` may produce several steps (one server frame can carry several events);
    /// all of them are applied under one lock.
    pub fn update<F>(&self, id: &ConnectionId, f: F) -> Result<Vec<Step>, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<Vec<Step>, SessionError>,
    {
        let steps = {
            let mut entry = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;
            f(entry.value_mut())?
        };

        for step in &steps {
            self.publish(step);
        }
        Ok(steps)
    }

    fn publish(&self, step: &Step) {
        if step.status_changed() {
            debug!(
                "Session {}: {} -> {}",
                step.id, step.old_status, step.new_status
            );
            self.notify(SessionEvent::StatusChanged {
                session_id: step.id.clone(),
                old_status: step.old_status,
                new_status: step.new_status,
            });
        }

        for line in &step.appended {
            self.notify(SessionEvent::LineAppended {
                session_id: step.id.clone(),
                line: line.clone(),
            });
        }

        if step.release_focus {
            self.notify(SessionEvent::FocusReleased {
                session_id: step.id.clone(),
            });
        }
    }

    /// Remove a session
    pub fn remove(&self, id: &ConnectionId) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            self.notify(SessionEvent::Removed {
                session_id: id.clone(),
            });
        }
        removed
    }

    /// Drop every session (logout)
    pub fn clear(&self) {
        self.sessions.clear();
        self.notify(SessionEvent::Cleared);
    }

    /// Ids of sessions in Connecting, Connected or Disconnecting
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Count of active sessions
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.status.is_active()).count()
    }

    /// Check whether a new connect for `id` would exceed the session limit
    pub fn at_capacity_for(&self, id: &ConnectionId) -> bool {
        let already_active = self
            .sessions
            .get(id)
            .map(|s| s.status.is_active())
            .unwrap_or(false);
        !already_active && self.active_count() >= self.max_sessions
    }

    /// All sessions, sorted by id
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|s| SessionInfo::from(s.value()))
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Plain-text export of a session log
    pub fn export_log(&self, id: &ConnectionId) -> Option<String> {
        self.sessions.get(id).map(|s| s.log.export())
    }

    /// Commands sent on a session, oldest first
    pub fn command_history(&self, id: &ConnectionId) -> Option<Vec<String>> {
        self.sessions.get(id).map(|s| s.log.commands())
    }

    /// Forget server sequence numbers for every session (new channel connection)
    pub fn reset_remote_marks(&self) {
        for mut session in self.sessions.iter_mut() {
            session.log.reset_remote();
        }
    }

    /// Sessions stuck in Disconnecting for longer than `threshold`
    pub fn stuck_sessions(&self, threshold: chrono::Duration) -> Vec<ConnectionId> {
        let now = Utc::now();
        self.sessions
            .iter()
            .filter(|s| {
                s.status == SessionStatus::Disconnecting && now - s.status_changed_at > threshold
            })
            .map(|s| s.id.clone())
            .collect()
    }

    /// Remove closed sessions, returning how many were dropped
    pub fn prune_closed(&self) -> usize {
        let closed: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|s| matches!(s.status, SessionStatus::Disconnected | SessionStatus::Failed))
            .map(|s| s.id.clone())
            .collect();

        for id in &closed {
            self.remove(id);
        }
        closed.len()
    }

    /// Total session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
