use crate::error::{KfdError, KfdResult};
use crate::utils::IdPool;
use std::collections::BTreeMap;

const KFD_SIGNAL_EVENT_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Signal,
    NodeChange,
    DeviceStateChange,
    HwException,
    SystemEvent,
    Debug,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub auto_reset: bool,
    pub signaled: bool,
}

/// Events of one process, addressed by event id.
#[derive(Debug)]
pub struct EventTable {
    ids: IdPool,
    events: BTreeMap<u32, Event>,
}

impl Default for EventTable {
    fn default() -> Self {
        Self {
            ids: IdPool::with_capacity(KFD_SIGNAL_EVENT_LIMIT),
            events: BTreeMap::new(),
        }
    }
}

impl EventTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `ResourceExhausted` once the event slots run out.
    pub fn create_event(&mut self, kind: EventKind, auto_reset: bool) -> KfdResult<u32> {
        let id = self
            .ids
            .acquire(0)
            .ok_or(KfdError::ResourceExhausted("event slots"))?;
        #[allow(clippy::cast_possible_truncation)]
        let id = id as u32;
        self.events.insert(
            id,
            Event {
                kind,
                auto_reset,
                signaled: false,
            },
        );
        Ok(id)
    }

    fn get_mut(&mut self, id: u32) -> KfdResult<&mut Event> {
        self.events
            .get_mut(&id)
            .ok_or_else(|| KfdError::invalid(format!("no event {id}")))
    }

    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn set_event(&mut self, id: u32) -> KfdResult<()> {
        self.get_mut(id)?.signaled = true;
        Ok(())
    }

    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn reset_event(&mut self, id: u32) -> KfdResult<()> {
        self.get_mut(id)?.signaled = false;
        Ok(())
    }

    /// Consumes the signaled state. Auto-reset events drop back to unsignaled.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn poll_event(&mut self, id: u32) -> KfdResult<bool> {
        let event = self.get_mut(id)?;
        let signaled = event.signaled;
        if signaled && event.auto_reset {
            event.signaled = false;
        }
        Ok(signaled)
    }

    /// # Errors
    /// Returns `InvalidArgument` for an unknown id.
    pub fn destroy_event(&mut self, id: u32) -> KfdResult<()> {
        self.events
            .remove(&id)
            .ok_or_else(|| KfdError::invalid(format!("no event {id}")))?;
        self.ids.release(id as usize);
        Ok(())
    }

    pub fn free_all(&mut self) {
        for id in std::mem::take(&mut self.events).into_keys() {
            self.ids.release(id as usize);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
