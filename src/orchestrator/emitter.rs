//! Event Emitter
//!
//! Server-side sink for `ssh_*` events. Assigns each frame its per-connection
//! sequence number and drops frames from shell workers that have since been
//! replaced by a newer `ssh_connect` for the same id.

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ConnectionId, ServerEnvelope, ServerMessage};

#[derive(Debug, Default)]
struct Slot {
    /// Generation of the worker currently allowed to emit
    generation: u64,
    /// Last sequence number handed out
    seq: u64,
}

struct Inner {
    slots: HashMap<ConnectionId, Slot>,
    tx: mpsc::UnboundedSender<ServerEnvelope>,
}

/// Per-socket emitter
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Mutex<Inner>>,
}

impl EventEmitter {
    /// Create an emitter writing into `tx`
    pub fn new(tx: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                tx,
            })),
        }
    }

    /// Start a new worker generation for `id`. Emitters handed out earlier for
    /// the same id go quiet.
    pub fn begin(&self, id: &ConnectionId) -> SessionEmitter {
        let mut inner = self.inner.lock();
        let slot = inner.slots.entry(id.clone()).or_default();
        slot.generation += 1;
        debug!("Emitter generation {} for connection {}", slot.generation, id);

        SessionEmitter {
            emitter: self.clone(),
            id: id.clone(),
            generation: slot.generation,
        }
    }

    /// Emitter bound to the current generation of `id`
    pub fn session(&self, id: &ConnectionId) -> SessionEmitter {
        let mut inner = self.inner.lock();
        let generation = inner.slots.entry(id.clone()).or_default().generation;

        SessionEmitter {
            emitter: self.clone(),
            id: id.clone(),
            generation,
        }
    }

    /// Emit a frame that belongs to no session
    pub fn emit_unrouted(&self, message: ServerMessage) -> bool {
        self.inner
            .lock()
            .tx
            .send(ServerEnvelope::unsequenced(message))
            .is_ok()
    }

    fn emit(&self, id: &ConnectionId, generation: u64, message: ServerMessage) -> bool {
        let mut inner = self.inner.lock();
        let slot = inner.slots.entry(id.clone()).or_default();
        if slot.generation != generation {
            trace!(
                "Dropping {} from stale worker {} of {}",
                message.event_name(),
                generation,
                id
            );
            return false;
        }

        slot.seq += 1;
        let envelope = ServerEnvelope::sequenced(slot.seq, message);
        inner.tx.send(envelope).is_ok()
    }
}

/// Emitter for one worker generation of one connection
#[derive(Clone)]
pub struct SessionEmitter {
    emitter: EventEmitter,
    id: ConnectionId,
    generation: u64,
}

impl SessionEmitter {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emit `ssh_connected`
    pub fn connected(&self, message: Option<String>) -> bool {
        self.emitter.emit(
            &self.id,
            self.generation,
            ServerMessage::SshConnected {
                connection_id: self.id.clone(),
                message,
            },
        )
    }

    /// Emit `ssh_output`
    pub fn output(&self, output: Option<String>, error: Option<String>, exit_code: Option<i32>) -> bool {
        self.emitter.emit(
            &self.id,
            self.generation,
            ServerMessage::SshOutput {
                connection_id: self.id.clone(),
                output,
                error,
                exit_code,
            },
        )
    }

    /// Emit `ssh_error`
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emitter.emit(
            &self.id,
            self.generation,
            ServerMessage::SshError {
                connection_id: Some(self.id.clone()),
                message: message.into(),
            },
        )
    }

    /// Emit `ssh_disconnected`
    pub fn disconnected(&self) -> bool {
        self.emitter.emit(
            &self.id,
            self.generation,
            ServerMessage::SshDisconnected {
                connection_id: self.id.clone(),
            },
        )
    }
}
