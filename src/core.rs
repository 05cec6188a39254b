//! PlayoutCore — central command dispatcher for aircast.
//!
//! Unified interface for all engine operations: transport commands, sequence
//! edits, routing and policy changes, and the periodic tick that arms hard
//! markers, drives fades, and tops the playlist up via auto-fill. The host
//! (CLI, GUI, tests) interacts with the engine only through this object.
//!
//! The core is single-threaded: the audio runtime posts events back through
//! a channel the host pumps into `handle_audio_event`. Wall-clock time is
//! always passed in, so every code path is testable without waiting.

use crate::audio_runtime::{AudioEvent, AudioHandle};
use crate::autofill;
use crate::crossfade::{CrossfadeController, FadeCompletion, FadeKind, SWAP_SAFETY_MARGIN_SECS};
use crate::engine::Engine;
use crate::graph::{AudioBus, AudioGraph, MixerConfig, SourceSlot};
use crate::history::{PlayoutHistory, PlayoutHistoryEntry};
use crate::levels::LevelSnapshot;
use crate::player::Lane;
use crate::players::PlayerPool;
use crate::policy::PlayoutPolicy;
use crate::resolver::SourceResolver;
use crate::sequence::{MarkerKind, PickSource, SequenceItem};
use crate::timeline::{self, TimelineEntry};
use crate::track::Track;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Cadence of the hard-marker arming check.
pub const MARKER_POLL_SECS: f64 = 1.0;
/// Cadence of the auto-fill threshold check.
pub const AUTOFILL_POLL_SECS: f64 = 15.0;

// ── Log buffer ──────────────────────────────────────────────────────────────

const LOG_BUFFER_MAX: usize = 500;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        LogBuffer {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, level: &str, message: String) {
        self.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            message,
        });
        while self.entries.len() > LOG_BUFFER_MAX {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, since_index: usize) -> Vec<LogEntry> {
        self.entries.iter().skip(since_index).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Playback elapsed tracking ───────────────────────────────────────────────

struct PlaybackState {
    is_paused: bool,
    duration_secs: f64,
    start_time: Option<Instant>,
    start_offset: Duration,
    total_paused: Duration,
    pause_start: Option<Instant>,
}

impl PlaybackState {
    fn new() -> Self {
        PlaybackState {
            is_paused: false,
            duration_secs: 0.0,
            start_time: None,
            start_offset: Duration::ZERO,
            total_paused: Duration::ZERO,
            pause_start: None,
        }
    }

    fn start(&mut self, duration_secs: f64, offset_secs: f64) {
        self.is_paused = false;
        self.duration_secs = duration_secs;
        self.start_time = Some(Instant::now());
        self.start_offset = Duration::from_secs_f64(offset_secs.max(0.0));
        self.total_paused = Duration::ZERO;
        self.pause_start = None;
    }

    fn pause(&mut self) {
        if !self.is_paused {
            self.is_paused = true;
            self.pause_start = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if self.is_paused {
            if let Some(ps) = self.pause_start.take() {
                self.total_paused += ps.elapsed();
            }
            self.is_paused = false;
        }
    }

    fn elapsed(&self) -> Duration {
        match self.start_time {
            Some(start) => {
                let raw = start.elapsed() + self.start_offset;
                let paused = if let Some(ps) = self.pause_start {
                    self.total_paused + ps.elapsed()
                } else {
                    self.total_paused
                };
                raw.saturating_sub(paused)
            }
            None => Duration::ZERO,
        }
    }

    fn reset(&mut self) {
        *self = PlaybackState::new();
    }
}

// ── Events ──────────────────────────────────────────────────────────────────

/// Engine events, drained by the host after each command or tick.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TrackEnded { item_id: u64 },
    ProgressTick { secs: f64 },
    AudioLevels(LevelSnapshot),
    TimelineChanged(HashMap<u64, TimelineEntry>),
    PlaybackStarted { item_id: u64 },
    PlaybackStopped,
    PlaybackPaused,
    PlaybackResumed,
}

// ── Core ────────────────────────────────────────────────────────────────────

pub struct PlayoutCore {
    pub engine: Engine,
    graph: AudioGraph,
    pool: PlayerPool,
    fades: CrossfadeController,
    history: PlayoutHistory,
    resolver: Box<dyn SourceResolver>,
    audio: Option<AudioHandle>,
    pub log: LogBuffer,
    playback: PlaybackState,
    timeline: HashMap<u64, TimelineEntry>,
    events: VecDeque<EngineEvent>,
    presenter_live: bool,
    cartwall_active: bool,
    last_marker_check: Option<DateTime<Utc>>,
    last_autofill_check: Option<DateTime<Utc>>,
}

impl PlayoutCore {
    pub fn new(engine: Engine, resolver: Box<dyn SourceResolver>) -> Self {
        PlayoutCore {
            engine,
            graph: AudioGraph::new(48000.0),
            pool: PlayerPool::new(),
            fades: CrossfadeController::new(),
            history: PlayoutHistory::new(),
            resolver,
            audio: None,
            log: LogBuffer::new(),
            playback: PlaybackState::new(),
            timeline: HashMap::new(),
            events: VecDeque::new(),
            presenter_live: false,
            cartwall_active: false,
            last_marker_check: None,
            last_autofill_check: None,
        }
    }

    /// Headless core with a fresh engine and a trusting resolver; used by
    /// tests and URL-driven hosts.
    pub fn new_test() -> Self {
        Self::new(
            Engine::new(),
            Box::new(crate::resolver::PassthroughResolver),
        )
    }

    /// Wire a spawned audio runtime into the core.
    pub fn attach_audio(&mut self, handle: AudioHandle) {
        self.audio = Some(handle);
    }

    pub fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    pub fn history(&self) -> &PlayoutHistory {
        &self.history
    }

    pub fn timeline(&self) -> &HashMap<u64, TimelineEntry> {
        &self.timeline
    }

    pub fn is_playing(&self) -> bool {
        self.engine.is_playing
    }

    pub fn is_paused(&self) -> bool {
        self.playback.is_paused
    }

    pub fn current_item_id(&self) -> Option<u64> {
        self.engine.current_item_id
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    fn emit(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }

    fn clock_now(&self) -> f64 {
        self.graph.clock().now_secs()
    }

    /// The graph is (re)built lazily on user-initiated playback, so a
    /// platform refusal earlier in the session is retried here.
    fn ensure_graph(&mut self) {
        if !self.graph.is_initialized() {
            self.graph
                .initialize(self.engine.buses.clone(), &self.engine.mixer);
            self.graph.set_mastering(&self.engine.policy.mastering);
            self.apply_ducking();
        }
    }

    fn recompute_timeline(&mut self, now: DateTime<Utc>) {
        let progress = self.playback.elapsed().as_secs_f64();
        self.timeline = timeline::compute_timeline(
            &self.engine.sequence,
            self.engine.current_item_id,
            progress,
            now,
        );
        self.emit(EngineEvent::TimelineChanged(self.timeline.clone()));
    }

    // ── Transport commands ──────────────────────────────────────────────

    /// Play a specific sequence item, resolving picks on the way.
    pub fn play_item(&mut self, id: u64, now: DateTime<Utc>) -> Result<(), String> {
        let index = self
            .engine
            .sequence
            .index_of(id)
            .ok_or_else(|| format!("Sequence item {} not found", id))?;
        self.fades.reset();
        self.start_at_index(index, now)
    }

    /// Toggle between playing and paused; starts from the current or first
    /// playable item when stopped.
    pub fn toggle_play(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        if self.engine.is_playing && !self.playback.is_paused {
            self.playback.pause();
            if let Some(audio) = &self.audio {
                audio.pause();
            }
            self.emit(EngineEvent::PlaybackPaused);
            return Ok(());
        }
        if self.playback.is_paused {
            self.playback.resume();
            if let Some(audio) = &self.audio {
                audio.resume();
            }
            self.emit(EngineEvent::PlaybackResumed);
            return Ok(());
        }
        // Stopped: start from the current item or the first playable one.
        let start = match self.engine.current_item_id {
            Some(id) => self.engine.sequence.index_of(id),
            None => {
                let tl = timeline::compute_timeline(&self.engine.sequence, None, 0.0, now);
                timeline::next_playable_index(&self.engine.sequence, &tl, None)
            }
        };
        match start {
            Some(index) => self.start_at_index(index, now),
            None => Err("Nothing playable in the sequence".to_string()),
        }
    }

    /// Stop playback outright.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        self.fades.reset();
        if let Some(audio) = &self.audio {
            audio.stop_all();
        }
        self.pool.clear_all();
        self.engine.is_playing = false;
        self.playback.reset();
        self.emit(EngineEvent::PlaybackStopped);
        self.recompute_timeline(now);
    }

    /// Manual jump to the next playable item.
    pub fn next(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.fades.reset();
        let current = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id));
        let tl = self.fresh_timeline(now);
        match timeline::next_playable_index(&self.engine.sequence, &tl, current) {
            Some(index) => {
                if let Some(audio) = &self.audio {
                    audio.stop(Lane::for_slot(self.pool.active()));
                }
                let index = self.cleanup_after_move(current, index);
                self.start_at_index(index, now)
            }
            None => {
                self.stop(now);
                Ok(())
            }
        }
    }

    /// Manual jump to the previous playable item (no wrap).
    pub fn previous(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.fades.reset();
        let current = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id))
            .unwrap_or(0);
        let tl = self.fresh_timeline(now);

        let mut candidate = None;
        for idx in (0..current).rev() {
            match self.engine.sequence.get(idx) {
                Some(SequenceItem::Track(t)) => {
                    let skipped = tl.get(&t.id).map(|e| e.is_skipped).unwrap_or(false);
                    if !skipped {
                        candidate = Some(idx);
                        break;
                    }
                }
                Some(SequenceItem::Pick { .. }) => {
                    candidate = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        match candidate {
            Some(index) => {
                if let Some(audio) = &self.audio {
                    audio.stop(Lane::for_slot(self.pool.active()));
                }
                self.start_at_index(index, now)
            }
            None => Err("No previous playable item".to_string()),
        }
    }

    // ── Sequence edits ──────────────────────────────────────────────────

    /// Insert a track. A manual insertion purges any untouched auto-fill
    /// tail behind it.
    pub fn insert_track(
        &mut self,
        track: Track,
        at: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<u64, String> {
        let manual = track.added_by == crate::track::AddedBy::User;
        let id = self.engine.sequence.insert_track(track, at)?;
        if manual {
            if let Some(pos) = self.engine.sequence.index_of(id) {
                let purged = self.engine.sequence.purge_autofill_tail(pos);
                if !purged.is_empty() {
                    self.log
                        .push("info", format!("Purged {} auto-fill tracks", purged.len()));
                }
            }
        }
        self.recompute_timeline(now);
        Ok(id)
    }

    pub fn remove_item(&mut self, id: u64, now: DateTime<Utc>) -> Result<(), String> {
        if self.engine.current_item_id == Some(id) {
            return Err("Cannot remove the item that is on air".to_string());
        }
        self.engine.sequence.remove(id)?;
        self.recompute_timeline(now);
        Ok(())
    }

    pub fn reorder(&mut self, from: usize, to: usize, now: DateTime<Utc>) -> Result<(), String> {
        self.engine.sequence.reorder(from, to)?;
        self.recompute_timeline(now);
        Ok(())
    }

    pub fn insert_marker(
        &mut self,
        time: DateTime<Utc>,
        kind: MarkerKind,
        label: Option<String>,
        at: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<u64, String> {
        let id = self.engine.sequence.insert_marker(time, kind, label, at)?;
        self.recompute_timeline(now);
        Ok(id)
    }

    pub fn update_marker(
        &mut self,
        id: u64,
        time: Option<DateTime<Utc>>,
        kind: Option<MarkerKind>,
        label: Option<Option<String>>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.engine.sequence.update_marker(id, time, kind, label)?;
        self.recompute_timeline(now);
        Ok(())
    }

    // ── Routing & policy ────────────────────────────────────────────────

    pub fn set_mixer_config(&mut self, mixer: MixerConfig) {
        self.engine.mixer = mixer;
        self.graph.set_mixer_config(&self.engine.mixer);
    }

    pub fn set_buses(&mut self, buses: Vec<AudioBus>) {
        self.graph.set_buses(&buses);
        self.engine.buses = buses;
    }

    pub fn set_policy(&mut self, policy: PlayoutPolicy) {
        self.engine.policy = policy;
        self.graph.set_mastering(&self.engine.policy.mastering);
        self.apply_ducking();
    }

    pub fn set_presenter_live(&mut self, live: bool) {
        self.presenter_live = live;
        self.apply_ducking();
    }

    pub fn set_cartwall_active(&mut self, active: bool) {
        self.cartwall_active = active;
        self.apply_ducking();
    }

    fn apply_ducking(&mut self) {
        let policy = &self.engine.policy;
        self.graph.set_ducking(
            self.presenter_live,
            self.cartwall_active,
            policy.mic_duck_level,
            policy.cart_duck_level,
            policy.duck_fade_secs,
        );
    }

    /// Fire a cart: plays on the cartwall lane and engages ducking.
    pub fn play_cart(&mut self, path: PathBuf) {
        self.ensure_graph();
        self.set_cartwall_active(true);
        if let Some(audio) = &self.audio {
            audio.play(
                Lane::Cartwall,
                path,
                self.graph.source_param(SourceSlot::Cartwall),
                self.graph.source_monitor(SourceSlot::Cartwall),
                self.clock_now(),
            );
        }
    }

    /// Audition a file privately on the PFL path (monitor bus only).
    pub fn audition_pfl(&mut self, path: PathBuf) {
        self.ensure_graph();
        if let Some(audio) = &self.audio {
            audio.play(
                Lane::Pfl,
                path,
                self.graph.source_param(SourceSlot::Pfl),
                self.graph.source_monitor(SourceSlot::Pfl),
                self.clock_now(),
            );
        }
    }

    // ── Periodic tick ───────────────────────────────────────────────────

    /// Heartbeat from the host, expected around once per second. Drives
    /// fade deadlines, hard-marker arming, auto-fill, and progress events.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if let Some(done) = self.fades.tick(self.clock_now()) {
            self.commit_fade(done, now);
        }

        let marker_due = self
            .last_marker_check
            .map(|t| (now - t).num_milliseconds() as f64 / 1000.0 >= MARKER_POLL_SECS)
            .unwrap_or(true);
        if marker_due {
            self.last_marker_check = Some(now);
            self.check_hard_markers(now);
            self.check_crossfade_point(now);
        }

        let autofill_due = self
            .last_autofill_check
            .map(|t| (now - t).num_milliseconds() as f64 / 1000.0 >= AUTOFILL_POLL_SECS)
            .unwrap_or(true);
        if autofill_due {
            self.last_autofill_check = Some(now);
            self.run_autofill(now);
        }

        if self.engine.is_playing && !self.playback.is_paused {
            let secs = self.playback.elapsed().as_secs_f64();
            self.emit(EngineEvent::ProgressTick { secs });
            let snapshot = self.graph.level_snapshot();
            self.emit(EngineEvent::AudioLevels(snapshot));
        }
    }

    /// Arm a hard-marker fade-jump once the marker's time has passed and its
    /// target lies strictly ahead of the playing item.
    fn check_hard_markers(&mut self, now: DateTime<Utc>) {
        if !self.engine.is_playing || self.fades.is_fading() {
            return;
        }
        let Some(current) = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id))
        else {
            return;
        };

        let mut due_marker: Option<usize> = None;
        for (idx, item) in self.engine.sequence.items().iter().enumerate() {
            if idx <= current {
                continue;
            }
            if let SequenceItem::Marker(m) = item {
                if m.kind == MarkerKind::Hard && m.time <= now {
                    due_marker = Some(idx);
                }
            }
        }
        let Some(marker_idx) = due_marker else { return };

        let tl = self.fresh_timeline(now);
        let target = timeline::next_playable_index(&self.engine.sequence, &tl, Some(marker_idx));
        if let Some(target_idx) = target {
            if target_idx > current {
                let Some(target_id) = self.engine.sequence.get(target_idx).map(|i| i.id())
                else {
                    return;
                };
                let clock = self.clock_now();
                if self
                    .fades
                    .begin_hard_jump(&self.graph, &self.pool, target_id, clock)
                    .is_ok()
                {
                    self.log
                        .push("info", format!("Hard marker: jumping to item {}", target_id));
                }
            }
        }
    }

    /// Start a soft crossfade when the playing track nears its natural end.
    fn check_crossfade_point(&mut self, now: DateTime<Utc>) {
        let policy = &self.engine.policy;
        if !policy.crossfade_enabled
            || !self.engine.is_playing
            || self.playback.is_paused
            || self.fades.is_fading()
        {
            return;
        }
        let duration = self.playback.duration_secs;
        let elapsed = self.playback.elapsed().as_secs_f64();
        // Too close to the start, or not close enough to the end.
        if duration <= policy.crossfade_secs * 2.0 {
            return;
        }
        if duration - elapsed > policy.crossfade_secs {
            return;
        }

        let current = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id));
        let tl = self.fresh_timeline(now);
        let Some(next_idx) =
            timeline::next_playable_index(&self.engine.sequence, &tl, current)
        else {
            return;
        };
        if current == Some(next_idx) {
            return;
        }
        let Some(next_track) = self.resolve_index_to_track(next_idx, now) else {
            return;
        };

        let crossfade_secs = self.engine.policy.crossfade_secs;
        let clock = self.clock_now();
        match self.fades.begin_crossfade(
            &self.graph,
            &mut self.pool,
            self.resolver.as_ref(),
            &next_track,
            crossfade_secs,
            clock,
        ) {
            Ok(slot) => {
                let preloaded = self.pool.loaded(slot).map(|l| l.source.clone());
                if let Some(crate::resolver::ResolvedSource::File(path)) = preloaded {
                    if let Some(audio) = &self.audio {
                        audio.play(
                            Lane::for_slot(slot),
                            path,
                            self.graph.source_param(slot.source_slot()),
                            self.graph.source_monitor(slot.source_slot()),
                            clock,
                        );
                    }
                }
                self.log
                    .push("info", format!("Crossfading into '{}'", next_track.title));
            }
            Err(e) => {
                self.log.push("warn", format!("Crossfade aborted: {}", e));
            }
        }
    }

    /// Append auto-fill material when the scheduled tail runs short.
    fn run_autofill(&mut self, now: DateTime<Utc>) {
        let policy = self.engine.policy.clone();
        let Some(folder) = self.engine.autofill_folder.clone() else {
            return;
        };
        let from_index = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id))
            .unwrap_or(0);
        let remaining = self.engine.sequence.remaining_duration_secs(from_index)
            - self.playback.elapsed().as_secs_f64();
        if remaining >= policy.autofill_lead_secs {
            return;
        }

        if !crate::resolver::verify_store_access(&folder) {
            self.log.push(
                "warn",
                format!("Auto-fill folder {} is not accessible", folder.display()),
            );
            return;
        }
        let pool = autofill::pool_from_folder(&folder);
        if pool.is_empty() {
            return;
        }
        let fill = autofill::generate_fill(
            pool,
            policy.autofill_target_secs,
            &self.history,
            &policy,
            now,
        );
        if fill.is_empty() {
            return;
        }
        let count = fill.len();
        for track in fill {
            self.engine.sequence.push_track(track);
        }
        self.log
            .push("info", format!("Auto-fill appended {} tracks", count));
        self.recompute_timeline(now);
    }

    // ── Audio events ────────────────────────────────────────────────────

    /// Pump an event from the audio runtime into the core.
    pub fn handle_audio_event(&mut self, event: AudioEvent, now: DateTime<Utc>) {
        match event {
            AudioEvent::LaneFinished(lane) => {
                if lane == Lane::for_slot(self.pool.active()) {
                    let elapsed = self.playback.elapsed().as_secs_f64();
                    self.handle_track_finished(elapsed, now);
                } else if lane == Lane::Cartwall {
                    self.set_cartwall_active(false);
                }
            }
            AudioEvent::PlayError { lane, message } => {
                self.log
                    .push("error", format!("{}: {}", lane.label(), message));
                if lane == Lane::for_slot(self.pool.active()) {
                    self.engine.is_playing = false;
                    self.playback.reset();
                    self.emit(EngineEvent::PlaybackStopped);
                }
            }
            _ => {}
        }
    }

    /// React to the active track reporting its end. A premature signal
    /// (reported duration known, >2s, elapsed more than 2s short) is a
    /// stall: playback resumes and nothing advances.
    pub fn handle_track_finished(&mut self, elapsed_secs: f64, now: DateTime<Utc>) {
        if self.fades.is_fading() {
            // The active lane drained mid-crossfade; the commit path owns
            // the hand-off.
            return;
        }
        let Some(track) = self.pool.active_track().cloned() else {
            return;
        };

        if timeline::is_premature_end(Some(track.duration_secs()), elapsed_secs) {
            self.log.push(
                "warn",
                format!(
                    "Premature end for '{}' at {:.1}s of {:.1}s — resuming",
                    track.title,
                    elapsed_secs,
                    track.duration_secs()
                ),
            );
            self.resume_after_stall(elapsed_secs);
            return;
        }

        self.record_played(&track, now);
        self.emit(EngineEvent::TrackEnded { item_id: track.id });

        if self.engine.stop_after_id == Some(track.id) {
            self.engine.stop_after_id = None;
            self.stop(now);
            return;
        }
        self.advance_from_current(now);
    }

    fn resume_after_stall(&mut self, elapsed_secs: f64) {
        let Some(loaded) = self.pool.loaded(self.pool.active()) else {
            return;
        };
        if let crate::resolver::ResolvedSource::File(path) = &loaded.source {
            let path = path.clone();
            let lane = Lane::for_slot(self.pool.active());
            let slot = self.pool.active().source_slot();
            if let Some(audio) = &self.audio {
                audio.play(
                    lane,
                    path,
                    self.graph.source_param(slot),
                    self.graph.source_monitor(slot),
                    self.clock_now(),
                );
                audio.seek(lane, Duration::from_secs_f64(elapsed_secs.max(0.0)));
            }
        }
    }

    fn record_played(&mut self, track: &Track, now: DateTime<Utc>) {
        self.history.push(PlayoutHistoryEntry {
            track_id: track.id,
            title: track.title.clone(),
            artist: track.artist.clone(),
            played_at: now,
        });
    }

    /// Natural-end advance: the freshest timeline is authoritative for the
    /// skip state, closing the race with the cached view.
    fn advance_from_current(&mut self, now: DateTime<Utc>) {
        let current = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id));
        let tl = self.fresh_timeline(now);
        match timeline::next_playable_index(&self.engine.sequence, &tl, current) {
            Some(next_idx) if current != Some(next_idx) => {
                let next_idx = self.cleanup_after_move(current, next_idx);
                if let Err(e) = self.start_at_index(next_idx, now) {
                    self.log.push("error", format!("Advance failed: {}", e));
                    self.stop(now);
                }
            }
            _ => {
                if self.engine.policy.remove_played_tracks {
                    let len = self.engine.sequence.len();
                    self.engine.sequence.truncate_before(len);
                }
                self.engine.current_item_id = None;
                self.engine.current_index = None;
                self.stop(now);
            }
        }
    }

    fn commit_fade(&mut self, done: FadeCompletion, now: DateTime<Utc>) {
        let old_index = self
            .engine
            .current_item_id
            .and_then(|id| self.engine.sequence.index_of(id));

        // History for the item that just left the air.
        if let Some(ended) = self.pool.loaded(done.from_slot).map(|l| l.track.clone()) {
            self.record_played(&ended, now);
            self.emit(EngineEvent::TrackEnded { item_id: ended.id });
            if self.engine.stop_after_id == Some(ended.id) {
                self.engine.stop_after_id = None;
                self.stop(now);
                return;
            }
        }

        match done.kind {
            FadeKind::Crossfade => {
                // The incoming slot has been playing since the fade began.
                if let Some(audio) = &self.audio {
                    audio.stop(Lane::for_slot(done.from_slot));
                }
                self.pool.swap_active();
                self.pool.clear(done.from_slot);

                if let Some(index) = self.engine.sequence.index_of(done.target_item_id) {
                    let index = self.cleanup_after_move(old_index, index);
                    let item_id = self.engine.sequence.get(index).map(|i| i.id());
                    self.engine.current_item_id = item_id;
                    self.engine.current_index = Some(index);
                    let duration = self
                        .pool
                        .active_track()
                        .map(|t| t.duration_secs())
                        .unwrap_or(0.0);
                    self.playback.start(
                        duration,
                        self.engine.policy.crossfade_secs + SWAP_SAFETY_MARGIN_SECS,
                    );
                    if let Some(id) = item_id {
                        self.emit(EngineEvent::PlaybackStarted { item_id: id });
                    }
                    self.recompute_timeline(now);
                }
            }
            FadeKind::HardJump => {
                if let Some(audio) = &self.audio {
                    audio.stop(Lane::for_slot(done.from_slot));
                }
                self.pool.swap_active();
                self.pool.clear(done.from_slot);

                if let Some(index) = self.engine.sequence.index_of(done.target_item_id) {
                    let index = self.cleanup_after_move(old_index, index);
                    if let Err(e) = self.start_at_index(index, now) {
                        self.log.push("error", format!("Hard jump failed: {}", e));
                        self.stop(now);
                    }
                }
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Recompute without mutating the cache — used where the freshest view
    /// must win over the memoized one.
    fn fresh_timeline(&self, now: DateTime<Utc>) -> HashMap<u64, TimelineEntry> {
        timeline::compute_timeline(
            &self.engine.sequence,
            self.engine.current_item_id,
            self.playback.elapsed().as_secs_f64(),
            now,
        )
    }

    /// After a forward move, drop passed content when the move crossed
    /// markers or skipped items (or always, under remove_played_tracks).
    /// Returns the target's index after any truncation.
    fn cleanup_after_move(&mut self, old_index: Option<usize>, new_index: usize) -> usize {
        let crossed = {
            let from = old_index.map(|i| i + 1).unwrap_or(0);
            self.engine.sequence.items()[from.min(new_index)..new_index]
                .iter()
                .any(|item| match item {
                    SequenceItem::Marker(_) => true,
                    SequenceItem::Track(t) => self
                        .timeline
                        .get(&t.id)
                        .map(|e| e.is_skipped)
                        .unwrap_or(false),
                    SequenceItem::Pick { .. } => false,
                })
        };
        if self.engine.policy.remove_played_tracks || crossed {
            let removed = self.engine.sequence.truncate_before(new_index);
            new_index - removed
        } else {
            new_index
        }
    }

    /// Resolve the item at an index into a concrete track, replacing pick
    /// placeholders in place.
    fn resolve_index_to_track(&mut self, index: usize, now: DateTime<Utc>) -> Option<Track> {
        let item = self.engine.sequence.get(index)?.clone();
        match item {
            SequenceItem::Track(t) => Some(t),
            SequenceItem::Pick { id, source } => {
                let pool = match &source {
                    PickSource::Folder(folder) => autofill::pool_from_folder(folder),
                    PickSource::Tag(tag) => {
                        let folder = self.engine.autofill_folder.clone()?;
                        autofill::pool_from_tag(&autofill::pool_from_folder(&folder), tag)
                    }
                };
                let picked =
                    autofill::pick_one(pool, &self.history, &self.engine.policy, now)?;
                self.engine
                    .sequence
                    .replace_with_track(id, picked)
                    .ok()?;
                self.engine
                    .sequence
                    .get(index)
                    .and_then(|i| i.as_track())
                    .cloned()
            }
            SequenceItem::Marker(_) => None,
        }
    }

    /// Start playback at a sequence index, skipping forward past items whose
    /// source cannot be resolved.
    fn start_at_index(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), String> {
        self.ensure_graph();

        let len = self.engine.sequence.len();
        if len == 0 {
            return Err("Sequence is empty".to_string());
        }

        let mut candidate = index;
        for _ in 0..len {
            match self.try_start(candidate, now) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.log.push("warn", format!("Skipping item: {}", e));
                    let tl = self.fresh_timeline(now);
                    match timeline::next_playable_index(
                        &self.engine.sequence,
                        &tl,
                        Some(candidate),
                    ) {
                        Some(next) if next != candidate => candidate = next,
                        _ => break,
                    }
                }
            }
        }
        self.engine.is_playing = false;
        Err("No playable item could be started".to_string())
    }

    fn try_start(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), String> {
        let track = self
            .resolve_index_to_track(index, now)
            .ok_or_else(|| format!("Item at {} is not playable", index))?;
        let resolved = self.resolver.resolve(&track)?;

        let slot = self.pool.active();
        self.pool.load(slot, track.clone(), resolved.clone());

        // The active slot plays at the channel gain; the inactive one stays
        // where the last fade left it.
        if let Some(param) = self.graph.source_param(slot.source_slot()) {
            let unity = if self.engine.mixer.main_player.muted {
                0.0
            } else {
                self.engine.mixer.main_player.gain
            };
            param.set_now(unity);
        }

        if let crate::resolver::ResolvedSource::File(path) = &resolved {
            if let Some(audio) = &self.audio {
                audio.play(
                    Lane::for_slot(slot),
                    path.clone(),
                    self.graph.source_param(slot.source_slot()),
                    self.graph.source_monitor(slot.source_slot()),
                    self.clock_now(),
                );
            }
        }

        self.engine.current_item_id = Some(track.id);
        self.engine.current_index = self.engine.sequence.index_of(track.id);
        self.engine.is_playing = true;
        self.playback.start(track.duration_secs(), 0.0);
        self.emit(EngineEvent::PlaybackStarted { item_id: track.id });
        self.recompute_timeline(now);
        Ok(())
    }
}
