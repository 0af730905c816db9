//! Core State Machines
//!
//! Registry of the local core state machines. Applying a command and
//! capturing a snapshot take the same lock, so a capture never observes a
//! half-applied command.

use std::collections::BTreeMap;

use tokio::sync::Mutex;

use super::{CoreSnapshot, CoreStateType, SnapshotPayload};
use crate::error::{Error, Result};
use crate::log::{LogIndex, LogPosition, Term};

/// A replicated state machine whose state is part of the core snapshot
pub trait CoreStateMachine: Send {
    /// Which snapshot slot this machine owns
    fn state_type(&self) -> CoreStateType;

    /// Serialize the current state
    fn snapshot(&self) -> Result<SnapshotPayload>;

    /// Reject a payload this machine cannot install, e.g. an unknown version
    fn check(&self, _payload: &SnapshotPayload) -> Result<()> {
        Ok(())
    }

    /// Replace the current state with `payload`
    fn install(&mut self, payload: &SnapshotPayload) -> Result<()>;

    /// Apply a committed command
    fn apply_command(&mut self, index: LogIndex, command: &[u8]) -> Result<()>;
}

struct Registry {
    machines: BTreeMap<CoreStateType, Box<dyn CoreStateMachine>>,
    applied: LogPosition,
}

/// All core state machines of this member
pub struct CoreStateMachines {
    inner: Mutex<Registry>,
}

impl CoreStateMachines {
    /// Create a registry; at most one machine per state type
    pub fn new(machines: Vec<Box<dyn CoreStateMachine>>) -> Result<Self> {
        let mut registered = BTreeMap::new();
        for machine in machines {
            let state_type = machine.state_type();
            if registered.insert(state_type, machine).is_some() {
                return Err(Error::StateMachine(format!(
                    "State machine {} registered twice",
                    state_type
                )));
            }
        }
        Ok(Self {
            inner: Mutex::new(Registry {
                machines: registered,
                applied: LogPosition::BASE,
            }),
        })
    }

    /// Position of the last applied command or installed snapshot
    pub async fn applied_position(&self) -> LogPosition {
        self.inner.lock().await.applied
    }

    /// Registered state types
    pub async fn state_types(&self) -> Vec<CoreStateType> {
        self.inner.lock().await.machines.keys().copied().collect()
    }

    /// Apply a committed command at `(index, term)` to one machine.
    ///
    /// Returns false if the position was already applied.
    pub async fn apply(
        &self,
        index: LogIndex,
        term: Term,
        state_type: CoreStateType,
        command: &[u8],
    ) -> Result<bool> {
        let mut registry = self.inner.lock().await;
        if index <= registry.applied.index {
            tracing::debug!("Skipping already applied index {}", index);
            return Ok(false);
        }
        let machine = registry.machines.get_mut(&state_type).ok_or_else(|| {
            Error::StateMachine(format!("No state machine registered for {}", state_type))
        })?;
        machine.apply_command(index, command)?;
        registry.applied = LogPosition::new(index, term);
        Ok(true)
    }

    /// Capture every machine, labelled with `(prev_index, prev_term)`
    pub async fn capture(&self, prev_index: LogIndex, prev_term: Term) -> Result<CoreSnapshot> {
        let registry = self.inner.lock().await;
        Self::capture_locked(&registry, LogPosition::new(prev_index, prev_term))
    }

    /// Capture every machine at the last applied position
    pub async fn snapshot(&self) -> Result<CoreSnapshot> {
        let registry = self.inner.lock().await;
        Self::capture_locked(&registry, registry.applied)
    }

    /// Install `snapshot` into every registered machine.
    ///
    /// Either every machine takes its payload or none does: payloads are
    /// checked up front, and if an install still fails the machines already
    /// installed are restored to their previous state.
    pub async fn install_snapshot(&self, snapshot: &CoreSnapshot) -> Result<()> {
        let mut registry = self.inner.lock().await;
        let mut payloads = Vec::with_capacity(registry.machines.len());
        for (state_type, machine) in &registry.machines {
            let payload = snapshot.get(*state_type).ok_or_else(|| {
                Error::StateMachine(format!("Snapshot has no payload for {}", state_type))
            })?;
            machine.check(payload)?;
            payloads.push((*state_type, payload));
        }

        let previous = Self::capture_locked(&registry, registry.applied)?;
        let mut installed = Vec::with_capacity(payloads.len());
        for (state_type, payload) in payloads {
            let Some(machine) = registry.machines.get_mut(&state_type) else {
                continue;
            };
            if let Err(e) = machine.install(payload) {
                Self::restore(&mut registry, &previous, &installed);
                return Err(e);
            }
            installed.push(state_type);
        }

        registry.applied = snapshot.position();
        tracing::info!("Installed core snapshot at {}", registry.applied);
        Ok(())
    }

    /// Put `installed` machines back to their state in `previous`
    fn restore(registry: &mut Registry, previous: &CoreSnapshot, installed: &[CoreStateType]) {
        for state_type in installed {
            let (Some(machine), Some(payload)) =
                (registry.machines.get_mut(state_type), previous.get(*state_type))
            else {
                continue;
            };
            if let Err(e) = machine.install(payload) {
                tracing::error!("Failed to restore {} after a failed install: {}", state_type, e);
            }
        }
    }

    fn capture_locked(registry: &Registry, position: LogPosition) -> Result<CoreSnapshot> {
        let mut snapshot = CoreSnapshot::new(position.index, position.term);
        for (state_type, machine) in &registry.machines {
            snapshot.add(*state_type, machine.snapshot()?);
        }
        Ok(snapshot)
    }
}
