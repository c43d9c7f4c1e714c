//! Session Manager
//!
//! The single dispatch point of a client instance. User intents and channel
//! signals are funneled through one queue and evaluated one at a time, so no
//! two events for a session are ever applied concurrently.

use dashmap::DashSet;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::SessionError;
use super::events::SessionEvent;
use super::machine::{self, Effect, Step};
use super::registry::SessionRegistry;
use super::state::SessionStatus;
use crate::channel::ChannelSignal;
use crate::orchestrator::Orchestrator;
use crate::protocol::{ChannelEvent, ConnectionId, DisconnectReason, ProfileRef, ServerEnvelope, ServerMessage};

/// A user action, addressed to an explicit session
#[derive(Debug, Clone)]
pub enum Intent {
    Connect {
        id: ConnectionId,
        profile: Option<ProfileRef>,
    },
    Command {
        id: ConnectionId,
        text: String,
    },
    Disconnect {
        id: ConnectionId,
    },
    /// Forget a closed session
    Close {
        id: ConnectionId,
    },
    /// Forget every closed session
    Prune,
    Logout,
}

impl Intent {
    /// Session the intent targets
    pub fn id(&self) -> Option<&ConnectionId> {
        match self {
            Self::Connect { id, .. }
            | Self::Command { id, .. }
            | Self::Disconnect { id }
            | Self::Close { id } => Some(id),
            Self::Prune | Self::Logout => None,
        }
    }
}

/// Everything the dispatch loop consumes
#[derive(Debug, Clone)]
pub enum Input {
    Intent(Intent),
    Frame(ServerEnvelope),
    TransportClosed { reason: String },
}

impl From<ChannelSignal> for Input {
    fn from(signal: ChannelSignal) -> Self {
        match signal {
            ChannelSignal::Frame(envelope) => Self::Frame(envelope),
            ChannelSignal::Closed { reason } => Self::TransportClosed { reason },
        }
    }
}

impl From<Intent> for Input {
    fn from(intent: Intent) -> Self {
        Self::Intent(intent)
    }
}

/// Session manager - drives the registry through the state machine
pub struct SessionManager {
    /// Sessions of this client
    registry: Arc<SessionRegistry>,
    /// Where connect/command/disconnect requests go
    orchestrator: Arc<dyn Orchestrator>,
    /// How long a session may sit in Disconnecting before it is reported
    stuck_after: Duration,
    /// Ids logged out while active, awaiting their `ssh_disconnected`
    draining: DashSet<ConnectionId>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(registry: Arc<SessionRegistry>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            registry,
            orchestrator,
            stuck_after: Duration::from_secs(30),
            draining: DashSet::new(),
        }
    }

    /// Set the stuck-session reporting threshold
    pub fn with_stuck_threshold(mut self, stuck_after: Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one input. Failures are logged; refused user intents are also
    /// reported to subscribers as `SessionEvent::Rejected`.
    pub fn dispatch(&self, input: Input) {
        match input {
            Input::Intent(intent) => {
                let id = intent.id().cloned();
                let Err(err) = self.handle_intent(intent) else {
                    return;
                };
                if !err.is_rejection() {
                    error!("Request failed: {}", err);
                    return;
                }
                warn!("Request rejected: {}", err);
                if let Some(session_id) = id {
                    self.registry.notify(SessionEvent::Rejected {
                        session_id,
                        reason: err.to_string(),
                    });
                }
            }
            Input::Frame(envelope) => {
                if let Err(err) = self.handle_frame(envelope) {
                    warn!("Dropped inbound frame: {}", err);
                }
            }
            Input::TransportClosed { reason } => {
                self.handle_transport_failure(&reason);
            }
        }
    }

    /// Handle a user intent
    pub fn handle_intent(&self, intent: Intent) -> Result<(), SessionError> {
        match intent {
            Intent::Connect { id, profile } => self.connect(id, profile).map(|_| ()),
            Intent::Command { id, text } => self.send_command(&id, &text).map(|_| ()),
            Intent::Disconnect { id } => self.disconnect(&id).map(|_| ()),
            Intent::Close { id } => self.close(&id),
            Intent::Prune => {
                let pruned = self.registry.prune_closed();
                info!("Pruned {} closed sessions", pruned);
                Ok(())
            }
            Intent::Logout => {
                self.logout();
                Ok(())
            }
        }
    }

    /// Start a session. Rejected while the session is already active.
    pub fn connect(
        &self,
        id: ConnectionId,
        profile: Option<ProfileRef>,
    ) -> Result<SessionStatus, SessionError> {
        if self.draining.contains(&id) {
            return Err(SessionError::Draining(id));
        }
        if self.registry.at_capacity_for(&id) {
            return Err(SessionError::MaxSessionsReached(self.registry.max_sessions()));
        }

        let event = ChannelEvent::ConnectRequest { id: id.clone() };
        let step = self.registry.upsert(&id, |session| {
            let transition = machine::transition(session, &event)?;
            if profile.is_some() {
                session.profile = profile;
            }
            Ok(machine::apply(session, transition))
        })?;

        info!("Connecting session {}", id);
        self.perform(&step)?;
        Ok(step.new_status)
    }

    /// Send a command. Only a Connected session forwards it.
    pub fn send_command(&self, id: &ConnectionId, text: &str) -> Result<SessionStatus, SessionError> {
        let event = ChannelEvent::CommandRequest {
            id: id.clone(),
            text: text.to_string(),
        };
        let step = self.apply_one(id, &event)?;
        self.perform(&step)?;
        Ok(step.new_status)
    }

    /// Ask the server to close a session. The session stays Disconnecting
    /// until the server confirms.
    pub fn disconnect(&self, id: &ConnectionId) -> Result<SessionStatus, SessionError> {
        let event = ChannelEvent::DisconnectRequest { id: id.clone() };
        let step = self.apply_one(id, &event)?;

        info!("Disconnecting session {}", id);
        self.perform(&step)?;
        Ok(step.new_status)
    }

    /// Forget a session that is no longer active
    pub fn close(&self, id: &ConnectionId) -> Result<(), SessionError> {
        match self.registry.status(id) {
            None => Err(SessionError::SessionNotFound(id.clone())),
            Some(status) if status.is_active() => Err(SessionError::StillActive {
                id: id.clone(),
                status,
            }),
            Some(_) => {
                self.registry.remove(id);
                Ok(())
            }
        }
    }

    /// Best-effort disconnect of every active session, then clear the registry.
    ///
    /// Ids whose disconnect was submitted cannot be reconnected until the
    /// server confirms, so a late `ssh_disconnected` never lands on a new
    /// session with the same id.
    pub fn logout(&self) -> usize {
        let active = self.registry.active_ids();
        for id in &active {
            match self.orchestrator.disconnect(id) {
                Ok(()) => {
                    self.draining.insert(id.clone());
                }
                Err(err) => debug!("Disconnect of {} on logout failed: {}", id, err),
            }
        }

        self.registry.clear();
        info!("Logged out, dropped {} active sessions", active.len());
        active.len()
    }

    /// Apply one server frame. Returns the number of transitions applied.
    pub fn handle_frame(&self, envelope: ServerEnvelope) -> Result<usize, SessionError> {
        let ServerEnvelope { seq, message } = envelope;
        let name = message.event_name();
        let id = message
            .connection_id()
            .cloned()
            .ok_or(SessionError::Unroutable(name))?;
        let confirms_close = matches!(message, ServerMessage::SshDisconnected { .. });
        let events = message.into_events();

        if self.draining.contains(&id) {
            if confirms_close {
                self.draining.remove(&id);
                debug!("Session {} finished closing after logout", id);
            } else {
                debug!("Dropping {} for logged-out session {}", name, id);
            }
            return Ok(0);
        }

        let steps = self.registry.update(&id, |session| {
            if let Some(seq) = seq {
                if !session.log.accept_remote(seq) {
                    debug!("Dropping redelivered {} #{} for {}", name, seq, session.id);
                    return Ok(Vec::new());
                }
            }

            let mut steps = Vec::with_capacity(events.len());
            for event in &events {
                match machine::step(session, event) {
                    Ok(step) => steps.push(step),
                    Err(err) => warn!("{}", err),
                }
            }
            Ok(steps)
        })?;

        Ok(steps.len())
    }

    /// The channel dropped: force every active session to Disconnected.
    /// Returns how many sessions were closed.
    pub fn handle_transport_failure(&self, reason: &str) -> usize {
        let active = self.registry.active_ids();
        warn!(
            "Event channel lost ({}), closing {} active sessions",
            reason,
            active.len()
        );

        let mut closed = 0;
        for id in active {
            let event = ChannelEvent::Disconnected {
                id: id.clone(),
                reason: DisconnectReason::TransportLost,
            };
            match self.apply_one(&id, &event) {
                Ok(_) => closed += 1,
                Err(err) => error!("Could not close session {}: {}", id, err),
            }
        }

        // nothing more will be confirmed on a dead channel
        self.draining.clear();
        self.registry.reset_remote_marks();
        closed
    }

    /// Run the dispatch loop until every input sender is gone
    pub async fn run(self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        info!("Session dispatch loop started");
        let mut ticker = tokio::time::interval(self.stuck_after);
        ticker.tick().await;

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.dispatch(input),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.report_stuck();
                }
            }
        }

        info!("Session dispatch loop stopped");
    }

    /// Log sessions that never received their disconnect confirmation
    pub fn report_stuck(&self) -> Vec<ConnectionId> {
        let threshold = chrono::Duration::from_std(self.stuck_after).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let stuck = self.registry.stuck_sessions(threshold);
        for id in &stuck {
            warn!(
                "Session {} has been disconnecting for over {}s without confirmation",
                id,
                self.stuck_after.as_secs()
            );
        }
        stuck
    }

    fn apply_one(&self, id: &ConnectionId, event: &ChannelEvent) -> Result<Step, SessionError> {
        let mut steps = self
            .registry
            .update(id, |session| Ok(vec![machine::step(session, event)?]))?;
        steps.pop().ok_or_else(|| SessionError::SessionNotFound(id.clone()))
    }

    /// Make the orchestrator call a transition asked for. A failed submission
    /// is recorded against the session as a remote error.
    fn perform(&self, step: &Step) -> Result<(), SessionError> {
        let Some(effect) = &step.effect else {
            return Ok(());
        };

        let result = match effect {
            Effect::Connect => {
                let profile = self
                    .registry
                    .with_session(&step.id, |s| s.profile.clone())
                    .flatten();
                self.orchestrator.connect(&step.id, profile.as_ref())
            }
            Effect::SendCommand(command) => self.orchestrator.send_command(&step.id, command),
            Effect::Disconnect => self.orchestrator.disconnect(&step.id),
        };

        if let Err(err) = result {
            error!("{} failed for {}: {}", self.orchestrator.orchestrator_type(), step.id, err);
            let event = ChannelEvent::Error {
                id: step.id.clone(),
                message: err.to_string(),
            };
            if let Err(apply_err) = self.apply_one(&step.id, &event) {
                warn!("Could not record failure for {}: {}", step.id, apply_err);
            }
            return Err(err.into());
        }

        Ok(())
    }
}
