//! Session State Machine
//!
//! Pure transition function over `(SessionStatus, ChannelEvent)`. It decides the
//! next status, the log lines to append and the orchestrator call to make; the
//! registry applies the result atomically and the manager performs the call.

use super::error::SessionError;
use super::log::LogLine;
use super::state::{Session, SessionStatus};
use crate::protocol::{ChannelEvent, ConnectionId, DisconnectReason, LogKind};

/// Orchestrator call requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect,
    SendCommand(String),
    Disconnect,
}

/// Outcome of evaluating one event against one session, not yet applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionStatus,
    pub lines: Vec<(LogKind, String)>,
    pub effect: Option<Effect>,
    pub new_segment: bool,
    pub release_focus: bool,
    pub error: Option<String>,
}

impl Transition {
    fn to(next: SessionStatus) -> Self {
        Self {
            next,
            lines: Vec::new(),
            effect: None,
            new_segment: false,
            release_focus: false,
            error: None,
        }
    }

    fn line(mut self, kind: LogKind, text: impl Into<String>) -> Self {
        self.lines.push((kind, text.into()));
        self
    }

    fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }
}

/// An applied transition, as reported to the registry and the manager
#[derive(Debug, Clone)]
pub struct Step {
    pub id: ConnectionId,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    pub appended: Vec<LogLine>,
    pub effect: Option<Effect>,
    pub release_focus: bool,
}

impl Step {
    pub fn status_changed(&self) -> bool {
        self.old_status != self.new_status
    }
}

/// Warning line written when a session reaches `Disconnected`
pub fn disconnect_notice(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::Remote => "Disconnected from server",
        DisconnectReason::TransportLost => "Connection to server lost",
    }
}

/// Evaluate `event` against the session's current status.
///
/// Rejected user requests come back as `AlreadyActive`, `NotConnected`,
/// `NotActive` or `EmptyCommand`; inbound events the status forbids come back
/// as `ProtocolViolation`. Neither changes the session.
pub fn transition(session: &Session, event: &ChannelEvent) -> Result<Transition, SessionError> {
    use SessionStatus::*;

    let status = session.status;
    let id = &session.id;

    match event {
        ChannelEvent::ConnectRequest { .. } => match status {
            Idle | Disconnected | Failed => {
                let mut t = Transition::to(Connecting).effect(Effect::Connect);
                t.new_segment = true;
                Ok(t)
            }
            Connecting | Connected | Disconnecting => Err(SessionError::AlreadyActive {
                id: id.clone(),
                status,
            }),
        },

        ChannelEvent::Connected { .. } => match status {
            Connecting => Ok(Transition::to(Connected).line(
                LogKind::Success,
                format!("Connected to {}", session.display_name()),
            )),
            _ => Err(violation(session, event)),
        },

        ChannelEvent::CommandRequest { text, .. } => match status {
            Connected => {
                let command = text.trim();
                if command.is_empty() {
                    return Err(SessionError::EmptyCommand(id.clone()));
                }
                Ok(Transition::to(Connected)
                    .line(LogKind::Prompt, format!("$ {}", command))
                    .effect(Effect::SendCommand(command.to_string())))
            }
            _ => Err(SessionError::NotConnected {
                id: id.clone(),
                status,
            }),
        },

        // Output racing a disconnect request still belongs to the session
        ChannelEvent::Output { text, kind, .. } => match status {
            Connected | Disconnecting => Ok(Transition::to(status).line(*kind, text.clone())),
            _ => Err(violation(session, event)),
        },

        ChannelEvent::Error { message, .. } => {
            let next = match status {
                Connecting | Connected => Failed,
                Disconnecting => Disconnecting,
                _ => return Err(violation(session, event)),
            };
            let mut t = Transition::to(next).line(LogKind::Error, format!("Error: {}", message));
            t.error = Some(message.clone());
            Ok(t)
        }

        ChannelEvent::DisconnectRequest { .. } => match status {
            Connecting | Connected => Ok(Transition::to(Disconnecting).effect(Effect::Disconnect)),
            _ => Err(SessionError::NotActive {
                id: id.clone(),
                status,
            }),
        },

        ChannelEvent::Disconnected { reason, .. } => match status {
            Connecting | Connected => {
                let mut t = Transition::to(Disconnected).line(LogKind::Warning, disconnect_notice(*reason));
                t.release_focus = true;
                Ok(t)
            }
            Disconnecting => {
                Ok(Transition::to(Disconnected).line(LogKind::Warning, disconnect_notice(*reason)))
            }
            _ => Err(violation(session, event)),
        },
    }
}

/// Apply an evaluated transition to the session
pub fn apply(session: &mut Session, transition: Transition) -> Step {
    if transition.new_segment {
        session.log.start_segment();
    }

    let old_status = session.set_status(transition.next);
    if let Some(message) = transition.error {
        session.last_error = Some(message);
    }

    let appended = transition
        .lines
        .into_iter()
        .map(|(kind, text)| session.log.append(kind, text).clone())
        .collect();

    Step {
        id: session.id.clone(),
        old_status,
        new_status: session.status,
        appended,
        effect: transition.effect,
        release_focus: transition.release_focus,
    }
}

/// Evaluate and apply in one go
pub fn step(session: &mut Session, event: &ChannelEvent) -> Result<Step, SessionError> {
    let transition = transition(session, event)?;
    Ok(apply(session, transition))
}

fn violation(session: &Session, event: &ChannelEvent) -> SessionError {
    SessionError::ProtocolViolation {
        id: session.id.clone(),
        event: event.name(),
        status: session.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ConnectionId {
        ConnectionId::from(7)
    }

    fn session_in(status: SessionStatus) -> Session {
        let mut session = Session::new(id());
        session.status = status;
        session
    }

    fn connect() -> ChannelEvent {
        ChannelEvent::ConnectRequest { id: id() }
    }

    fn command(text: &str) -> ChannelEvent {
        ChannelEvent::CommandRequest {
            id: id(),
            text: text.to_string(),
        }
    }

    fn output(text: &str) -> ChannelEvent {
        ChannelEvent::Output {
            id: id(),
            text: text.to_string(),
            kind: LogKind::Output,
        }
    }

    fn error(message: &str) -> ChannelEvent {
        ChannelEvent::Error {
            id: id(),
            message: message.to_string(),
        }
    }

    fn disconnected() -> ChannelEvent {
        ChannelEvent::Disconnected {
            id: id(),
            reason: DisconnectReason::Remote,
        }
    }

    #[test]
    fn test_connect_from_resettable_states() {
        for status in [SessionStatus::Idle, SessionStatus::Disconnected, SessionStatus::Failed] {
            let t = transition(&session_in(status), &connect()).unwrap();
            assert_eq!(t.next, SessionStatus::Connecting);
            assert_eq!(t.effect, Some(Effect::Connect));
            assert!(t.new_segment);
        }
    }

    #[test]
    fn test_connect_rejected_while_active() {
        for status in [
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Disconnecting,
        ] {
            let result = transition(&session_in(status), &connect());
            assert!(matches!(result, Err(SessionError::AlreadyActive { .. })));
        }
    }

    #[test]
    fn test_connected_ack_appends_success() {
        let mut session = session_in(SessionStatus::Connecting);
        let step = step(&mut session, &ChannelEvent::Connected { id: id() }).unwrap();
        assert_eq!(step.new_status, SessionStatus::Connected);
        assert_eq!(step.appended.len(), 1);
        assert_eq!(step.appended[0].kind, LogKind::Success);
        assert_eq!(step.appended[0].text, "Connected to 7");
    }

    #[test]
    fn test_command_only_when_connected() {
        let t = transition(&session_in(SessionStatus::Connected), &command("  ls -la ")).unwrap();
        assert_eq!(t.effect, Some(Effect::SendCommand("ls -la".to_string())));
        assert_eq!(t.lines, vec![(LogKind::Prompt, "$ ls -la".to_string())]);

        for status in [
            SessionStatus::Idle,
            SessionStatus::Connecting,
            SessionStatus::Disconnecting,
            SessionStatus::Disconnected,
            SessionStatus::Failed,
        ] {
            let result = transition(&session_in(status), &command("ls"));
            assert!(matches!(result, Err(SessionError::NotConnected { .. })));
        }
    }

    #[test]
    fn test_blank_command_rejected() {
        let result = transition(&session_in(SessionStatus::Connected), &command("   "));
        assert!(matches!(result, Err(SessionError::EmptyCommand(_))));
    }

    #[test]
    fn test_error_fails_session() {
        let mut session = session_in(SessionStatus::Connecting);
        let step = step(&mut session, &error("auth failed")).unwrap();
        assert_eq!(step.new_status, SessionStatus::Failed);
        assert_eq!(step.appended[0].kind, LogKind::Error);
        assert!(step.appended[0].text.contains("auth failed"));
        assert_eq!(session.last_error.as_deref(), Some("auth failed"));
        assert!(step.effect.is_none());
    }

    #[test]
    fn test_error_while_disconnecting_keeps_waiting() {
        let mut session = session_in(SessionStatus::Disconnecting);
        let step = step(&mut session, &error("exit failed")).unwrap();
        assert_eq!(step.new_status, SessionStatus::Disconnecting);
    }

    #[test]
    fn test_output_outside_connected_is_violation() {
        let result = transition(&session_in(SessionStatus::Connecting), &output("x"));
        assert!(matches!(
            result,
            Err(SessionError::ProtocolViolation { event: "Output", .. })
        ));
        assert!(transition(&session_in(SessionStatus::Disconnecting), &output("x")).is_ok());
    }

    #[test]
    fn test_unsolicited_disconnect_releases_focus() {
        let t = transition(&session_in(SessionStatus::Connected), &disconnected()).unwrap();
        assert_eq!(t.next, SessionStatus::Disconnected);
        assert!(t.release_focus);
        assert_eq!(t.lines[0], (LogKind::Warning, "Disconnected from server".to_string()));

        let t = transition(&session_in(SessionStatus::Disconnecting), &disconnected()).unwrap();
        assert!(!t.release_focus);
    }

    #[test]
    fn test_duplicate_disconnect_is_violation() {
        let result = transition(&session_in(SessionStatus::Disconnected), &disconnected());
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_disconnect_request() {
        let t = transition(
            &session_in(SessionStatus::Connected),
            &ChannelEvent::DisconnectRequest { id: id() },
        )
        .unwrap();
        assert_eq!(t.next, SessionStatus::Disconnecting);
        assert_eq!(t.effect, Some(Effect::Disconnect));

        let result = transition(
            &session_in(SessionStatus::Failed),
            &ChannelEvent::DisconnectRequest { id: id() },
        );
        assert!(matches!(result, Err(SessionError::NotActive { .. })));
    }
}
