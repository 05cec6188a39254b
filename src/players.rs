use crate::graph::SourceSlot;
use crate::resolver::ResolvedSource;
use crate::track::Track;

/// The two interchangeable playout slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(&self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    /// The graph source node this slot feeds.
    pub fn source_slot(&self) -> SourceSlot {
        match self {
            SlotId::A => SourceSlot::PlayerA,
            SlotId::B => SourceSlot::PlayerB,
        }
    }

    fn index(&self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

/// What a slot currently holds.
#[derive(Debug, Clone)]
pub struct LoadedTrack {
    pub track: Track,
    pub source: ResolvedSource,
}

/// Two logical players bound to the graph's A/B source nodes.
/// Exactly one is active; hand-off swaps the pointer in one step.
pub struct PlayerPool {
    active: SlotId,
    slots: [Option<LoadedTrack>; 2],
}

impl PlayerPool {
    pub fn new() -> Self {
        PlayerPool {
            active: SlotId::A,
            slots: [None, None],
        }
    }

    pub fn active(&self) -> SlotId {
        self.active
    }

    pub fn inactive(&self) -> SlotId {
        self.active.other()
    }

    /// Preload a resolved track into a slot.
    pub fn load(&mut self, slot: SlotId, track: Track, source: ResolvedSource) {
        self.slots[slot.index()] = Some(LoadedTrack { track, source });
    }

    pub fn loaded(&self, slot: SlotId) -> Option<&LoadedTrack> {
        self.slots[slot.index()].as_ref()
    }

    pub fn clear(&mut self, slot: SlotId) {
        self.slots[slot.index()] = None;
    }

    pub fn clear_all(&mut self) {
        self.slots = [None, None];
    }

    /// Flip the active pointer. The previous active slot's content stays in
    /// place until cleared.
    pub fn swap_active(&mut self) {
        self.active = self.active.other();
    }

    /// The track currently in the active slot.
    pub fn active_track(&self) -> Option<&Track> {
        self.loaded(self.active).map(|l| &l.track)
    }
}

impl Default for PlayerPool {
    fn default() -> Self {
        Self::new()
    }
}
