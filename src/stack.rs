//! The pushdown stack of connection stages.
//!
//! Each stage, once satisfied, pushes the next; a failing stage pops itself
//! (and possibly ancestors) to retry from an earlier point.  Stages below the
//! top are satisfied and paused.  The stack only stores stages; entering and
//! releasing them is done by [`crate::controller::RowerController`], which
//! owns the gateway.

use crate::gateway::StageId;
use crate::session::Session;

/// One phase of connection establishment, holding only that phase's data.
#[derive(Debug)]
pub enum Stage {
    Permission,
    LocationService {
        /// A location watch is registered and must be released.
        watching: bool,
    },
    Radio {
        watching: bool,
    },
    DeviceSelection {
        /// The picker is open and must be cancelled.
        prompting: bool,
    },
    Session(Box<Session>),
}

/// Stage discriminant, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Permission,
    LocationService,
    Radio,
    DeviceSelection,
    Session,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Permission => StageKind::Permission,
            Stage::LocationService { .. } => StageKind::LocationService,
            Stage::Radio { .. } => StageKind::Radio,
            Stage::DeviceSelection { .. } => StageKind::DeviceSelection,
            Stage::Session(_) => StageKind::Session,
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: StageId,
    stage: Stage,
}

/// LIFO of stages; the last entry is current.
///
/// Empty means fully disconnected.
#[derive(Debug, Default)]
pub struct ConnectionStack {
    entries: Vec<Entry>,
    next_id: u64,
}

impl ConnectionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push `stage` on top and return its fresh id.
    pub fn push(&mut self, stage: Stage) -> StageId {
        self.next_id += 1;
        let id = StageId(self.next_id);
        self.entries.push(Entry { id, stage });
        id
    }

    /// Remove the current stage.  The caller releases it.
    pub fn pop(&mut self) -> Option<(StageId, Stage)> {
        self.entries.pop().map(|e| (e.id, e.stage))
    }

    pub fn current(&self) -> Option<StageId> {
        self.entries.last().map(|e| e.id)
    }

    /// Whether `id` is the top of the stack.
    pub fn is_current(&self, id: StageId) -> bool {
        self.current() == Some(id)
    }

    /// Whether `id` is still anywhere on the stack.
    pub fn contains(&self, id: StageId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: StageId) -> Option<&Stage> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.stage)
    }

    pub fn get_mut(&mut self, id: StageId) -> Option<&mut Stage> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .map(|e| &mut e.stage)
    }

    /// Kinds from bottom to top.
    pub fn kinds(&self) -> Vec<StageKind> {
        self.entries.iter().map(|e| e.stage.kind()).collect()
    }
}
