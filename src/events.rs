//! Supervisor lifecycle events.
//!
//! The supervisor never talks to an event bus directly; it posts to whatever
//! [`EventSink`] it was given. [`TracingSink`] is the default.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    ApplicationStarted { pid: u32 },
    ApplicationExited { code: Option<i32> },
    CommandReceived { name: String },
    RestartScheduled,
    SupervisorStopped,
}

pub trait EventSink: Send + Sync {
    fn post(&self, event: SupervisorEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn post(&self, event: SupervisorEvent) {
        match &event {
            SupervisorEvent::ApplicationStarted { pid } => {
                info!(pid, "Application started")
            }
            SupervisorEvent::ApplicationExited { code } => {
                info!(code = ?code, "Application exited")
            }
            SupervisorEvent::CommandReceived { name } => {
                info!(command = %name, "Control command received")
            }
            SupervisorEvent::RestartScheduled => info!("Application restart scheduled"),
            SupervisorEvent::SupervisorStopped => info!("Supervisor stopped"),
        }
    }
}

/// Keeps every posted event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SupervisorEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn post(&self, event: SupervisorEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
