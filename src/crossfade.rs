//! Hand-off state machine between the two playout slots.
//!
//! Two distinct paths: the soft crossfade near a natural track end (second
//! player preloaded and faded in), and the hard-marker fade-jump (active
//! player faded out alone over a fixed short window). At most one fade is in
//! flight; a trigger during an active fade is dropped, not queued. A preload
//! failure aborts before any gain is touched, so there is nothing to roll
//! back.

use crate::graph::AudioGraph;
use crate::players::{PlayerPool, SlotId};
use crate::resolver::SourceResolver;
use crate::track::Track;

/// Fixed fade-out window for hard-marker jumps. Not policy-configurable.
pub const HARD_FADE_SECS: f64 = 0.8;

/// Extra time after the crossfade window before the swap commits.
pub const SWAP_SAFETY_MARGIN_SECS: f64 = 0.25;

/// Re-entrance guard: only one fade may exist at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeState {
    Idle,
    Fading { target_item_id: u64 },
}

/// Which hand-off path produced a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeKind {
    Crossfade,
    HardJump,
}

/// Emitted once per completed fade; the caller commits the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeCompletion {
    pub kind: FadeKind,
    pub target_item_id: u64,
    /// Slot that was on air before the hand-off.
    pub from_slot: SlotId,
}

struct PendingFade {
    kind: FadeKind,
    target_item_id: u64,
    from_slot: SlotId,
    deadline_clock: f64,
}

pub struct CrossfadeController {
    state: FadeState,
    pending: Option<PendingFade>,
}

impl CrossfadeController {
    pub fn new() -> Self {
        CrossfadeController {
            state: FadeState::Idle,
            pending: None,
        }
    }

    pub fn state(&self) -> FadeState {
        self.state
    }

    pub fn is_fading(&self) -> bool {
        matches!(self.state, FadeState::Fading { .. })
    }

    /// Begin a soft crossfade into `next_track`. Resolves and preloads the
    /// track on the inactive slot, then schedules the opposing gain ramps.
    /// Returns the slot the caller should start playback on.
    ///
    /// A second trigger while fading is rejected. A resolution failure
    /// leaves all state untouched.
    pub fn begin_crossfade(
        &mut self,
        graph: &AudioGraph,
        pool: &mut PlayerPool,
        resolver: &dyn SourceResolver,
        next_track: &Track,
        crossfade_secs: f64,
        clock_now: f64,
    ) -> Result<SlotId, String> {
        if self.is_fading() {
            return Err("A fade is already in progress".to_string());
        }

        // Resolve before touching anything so a failure has no side effects.
        let source = resolver.resolve(next_track)?;

        let from_slot = pool.active();
        let to_slot = pool.inactive();
        pool.load(to_slot, next_track.clone(), source);

        if let (Some(active), Some(inactive)) = (
            graph.source_param(from_slot.source_slot()),
            graph.source_param(to_slot.source_slot()),
        ) {
            let unity = active.target();
            inactive.set_now(0.0);
            active.ramp_to(0.0, crossfade_secs, clock_now);
            inactive.ramp_to(unity, crossfade_secs, clock_now);
        }

        self.state = FadeState::Fading {
            target_item_id: next_track.id,
        };
        self.pending = Some(PendingFade {
            kind: FadeKind::Crossfade,
            target_item_id: next_track.id,
            from_slot,
            deadline_clock: clock_now + crossfade_secs + SWAP_SAFETY_MARGIN_SECS,
        });
        Ok(to_slot)
    }

    /// Begin a hard-marker fade-jump toward `target_item_id`: only the
    /// active slot is faded, over a fixed short window. No second player is
    /// preloaded; the caller starts the target after the commit.
    pub fn begin_hard_jump(
        &mut self,
        graph: &AudioGraph,
        pool: &PlayerPool,
        target_item_id: u64,
        clock_now: f64,
    ) -> Result<(), String> {
        if self.is_fading() {
            return Err("A fade is already in progress".to_string());
        }

        let from_slot = pool.active();
        if let Some(active) = graph.source_param(from_slot.source_slot()) {
            active.ramp_to(0.0, HARD_FADE_SECS, clock_now);
        }

        self.state = FadeState::Fading { target_item_id };
        self.pending = Some(PendingFade {
            kind: FadeKind::HardJump,
            target_item_id,
            from_slot,
            deadline_clock: clock_now + HARD_FADE_SECS,
        });
        Ok(())
    }

    /// Advance the fade timer. Emits the completion exactly once, after the
    /// deadline passes, and releases the guard.
    pub fn tick(&mut self, clock_now: f64) -> Option<FadeCompletion> {
        let due = self
            .pending
            .as_ref()
            .map(|p| clock_now >= p.deadline_clock)
            .unwrap_or(false);
        if !due {
            return None;
        }
        let pending = self.pending.take()?;
        self.state = FadeState::Idle;
        Some(FadeCompletion {
            kind: pending.kind,
            target_item_id: pending.target_item_id,
            from_slot: pending.from_slot,
        })
    }

    /// Drop any fade in flight (used when playback stops outright).
    pub fn reset(&mut self) {
        self.state = FadeState::Idle;
        self.pending = None;
    }
}

impl Default for CrossfadeController {
    fn default() -> Self {
        Self::new()
    }
}
