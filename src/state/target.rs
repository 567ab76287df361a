use crate::error::EngineError;
use crate::types::{ContextId, ContextKind, ContextRecord};

/// Binding state of one context kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    Empty,
    PendingCreate,
    Bound(ContextRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The created context is now the active one.
    Active,
    /// Bound to its slot, but the user has since moved to another kind.
    Inactive,
    /// The slot was rebound or cleared while creating; the result is unused.
    Superseded,
}

/// Tracks which conversation and which work are selected, and which of the
/// two is active.
#[derive(Debug, Clone)]
pub struct TargetContexts {
    active_kind: ContextKind,
    conversation: Slot,
    work: Slot,
}

impl TargetContexts {
    pub fn new(active_kind: ContextKind) -> Self {
        Self {
            active_kind,
            conversation: Slot::Empty,
            work: Slot::Empty,
        }
    }

    pub fn active_kind(&self) -> ContextKind {
        self.active_kind
    }

    pub fn slot(&self, kind: ContextKind) -> &Slot {
        match kind {
            ContextKind::Conversation => &self.conversation,
            ContextKind::Work => &self.work,
        }
    }

    fn slot_mut(&mut self, kind: ContextKind) -> &mut Slot {
        match kind {
            ContextKind::Conversation => &mut self.conversation,
            ContextKind::Work => &mut self.work,
        }
    }

    pub fn active(&self) -> Option<&ContextRecord> {
        match self.slot(self.active_kind) {
            Slot::Bound(record) => Some(record),
            Slot::Empty | Slot::PendingCreate => None,
        }
    }

    pub fn active_id(&self) -> Option<&ContextId> {
        self.active().map(|record| &record.id)
    }

    pub fn is_active(&self, id: &ContextId) -> bool {
        self.active_id() == Some(id)
    }

    /// The bound record for `id` in either slot.
    pub fn find(&self, id: &ContextId) -> Option<&ContextRecord> {
        [ContextKind::Conversation, ContextKind::Work]
            .into_iter()
            .find_map(|kind| match self.slot(kind) {
                Slot::Bound(record) if &record.id == id => Some(record),
                _ => None,
            })
    }

    /// `NONE -> PENDING_CREATE`. Returns the bound id when one already exists.
    pub fn begin_create(&mut self, kind: ContextKind) -> Result<Option<ContextId>, EngineError> {
        let slot = self.slot_mut(kind);
        match slot {
            Slot::Bound(record) => Ok(Some(record.id.clone())),
            Slot::PendingCreate => Err(EngineError::CreateInFlight(kind.label())),
            Slot::Empty => {
                *slot = Slot::PendingCreate;
                Ok(None)
            }
        }
    }

    /// `PENDING_CREATE -> ACTIVE`, provided nothing rebound the slot meanwhile.
    pub fn complete_create(&mut self, record: ContextRecord) -> CreateOutcome {
        let kind = record.kind;
        let active_kind = self.active_kind;
        let slot = self.slot_mut(kind);
        if *slot != Slot::PendingCreate {
            return CreateOutcome::Superseded;
        }
        *slot = Slot::Bound(record);
        if kind == active_kind {
            CreateOutcome::Active
        } else {
            CreateOutcome::Inactive
        }
    }

    pub fn abandon_create(&mut self, kind: ContextKind) {
        let slot = self.slot_mut(kind);
        if *slot == Slot::PendingCreate {
            *slot = Slot::Empty;
        }
    }

    /// Makes `record` the active context, returning the one it replaces.
    pub fn bind(&mut self, record: ContextRecord) -> Option<ContextRecord> {
        let previous = self.active().cloned();
        let kind = record.kind;
        self.active_kind = kind;
        *self.slot_mut(kind) = Slot::Bound(record);
        previous
    }

    /// Activates `kind` with nothing bound; the next turn creates a context.
    pub fn clear(&mut self, kind: ContextKind) -> Option<ContextRecord> {
        let previous = self.active().cloned();
        self.active_kind = kind;
        *self.slot_mut(kind) = Slot::Empty;
        previous
    }

    /// Drops `id` from whichever slot holds it.
    pub fn forget(&mut self, id: &ContextId) -> bool {
        for kind in [ContextKind::Conversation, ContextKind::Work] {
            let slot = self.slot_mut(kind);
            if matches!(slot, Slot::Bound(record) if &record.id == id) {
                *slot = Slot::Empty;
                return true;
            }
        }
        false
    }

    pub fn rename(&mut self, id: &ContextId, title: &str) -> bool {
        for kind in [ContextKind::Conversation, ContextKind::Work] {
            if let Slot::Bound(record) = self.slot_mut(kind) {
                if &record.id == id {
                    record.title = title.to_string();
                    return true;
                }
            }
        }
        false
    }
}
