//! Signal-routing graph.
//!
//! Owns the processing topology: sources → per-source gain → routing sends
//! → per-bus mix → bus gain → bus output, with ducking gains inserted on the
//! (main player → main) and (cartwall → main) paths and a mastering chain on
//! the main bus. No knowledge of playlists.
//!
//! All control operations ramp gain parameters over a short fixed window
//! instead of stepping them. Before `initialize()` succeeds (or after a
//! failed construction), every control operation is a silent no-op.

use crate::automation::{AudioClock, GainParam};
use crate::levels::{LevelMonitor, LevelSnapshot};
use crate::mastering::{MasteringChain, MasteringConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Bus id of the on-air mix.
pub const MAIN_BUS: &str = "main";
/// Bus id of the monitor / pre-fade-listen mix.
pub const MONITOR_BUS: &str = "monitor";

/// Window over which control-plane gain changes are ramped.
pub const CONTROL_RAMP_SECS: f64 = 0.04;

/// Physical source nodes feeding the graph. The two player slots belong to
/// the same logical main-player channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSlot {
    PlayerA,
    PlayerB,
    Cartwall,
    Microphone,
    Pfl,
}

impl SourceSlot {
    pub const ALL: [SourceSlot; 5] = [
        SourceSlot::PlayerA,
        SourceSlot::PlayerB,
        SourceSlot::Cartwall,
        SourceSlot::Microphone,
        SourceSlot::Pfl,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SourceSlot::PlayerA => "player-a",
            SourceSlot::PlayerB => "player-b",
            SourceSlot::Cartwall => "cartwall",
            SourceSlot::Microphone => "microphone",
            SourceSlot::Pfl => "pfl",
        }
    }
}

/// One mix destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBus {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    pub gain: f32,
    #[serde(default)]
    pub muted: bool,
}

impl AudioBus {
    pub fn main() -> Self {
        AudioBus {
            id: MAIN_BUS.to_string(),
            output_device: None,
            gain: 1.0,
            muted: false,
        }
    }

    pub fn monitor() -> Self {
        AudioBus {
            id: MONITOR_BUS.to_string(),
            output_device: None,
            gain: 1.0,
            muted: false,
        }
    }
}

/// Default bus layout: on-air main plus a monitor bus.
pub fn default_buses() -> Vec<AudioBus> {
    vec![AudioBus::main(), AudioBus::monitor()]
}

/// A routed connection from a source into a bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusSend {
    pub enabled: bool,
    pub gain: f32,
}

impl BusSend {
    pub fn on(gain: f32) -> Self {
        BusSend {
            enabled: true,
            gain,
        }
    }

    pub fn off() -> Self {
        BusSend {
            enabled: false,
            gain: 0.0,
        }
    }

    fn effective_gain(&self) -> f32 {
        if self.enabled { self.gain } else { 0.0 }
    }
}

impl Default for BusSend {
    fn default() -> Self {
        BusSend::off()
    }
}

/// Channel settings for one logical source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMix {
    pub gain: f32,
    #[serde(default)]
    pub muted: bool,
    /// Bus id → send. Missing entries mean "not routed".
    #[serde(default)]
    pub sends: HashMap<String, BusSend>,
}

impl SourceMix {
    fn new(gain: f32, sends: &[(&str, BusSend)]) -> Self {
        SourceMix {
            gain,
            muted: false,
            sends: sends
                .iter()
                .map(|(id, s)| (id.to_string(), *s))
                .collect(),
        }
    }

    fn channel_gain(&self) -> f32 {
        if self.muted { 0.0 } else { self.gain }
    }

    fn send(&self, bus_id: &str) -> BusSend {
        self.sends.get(bus_id).copied().unwrap_or_default()
    }
}

/// Per-logical-source mixer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerConfig {
    pub main_player: SourceMix,
    pub cartwall: SourceMix,
    pub microphone: SourceMix,
    pub pfl: SourceMix,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            main_player: SourceMix::new(
                1.0,
                &[(MAIN_BUS, BusSend::on(1.0)), (MONITOR_BUS, BusSend::off())],
            ),
            cartwall: SourceMix::new(1.0, &[(MAIN_BUS, BusSend::on(1.0))]),
            microphone: SourceMix::new(1.0, &[(MAIN_BUS, BusSend::on(1.0))]),
            // PFL auditions privately on the monitor bus, never on air.
            pfl: SourceMix::new(
                1.0,
                &[(MAIN_BUS, BusSend::off()), (MONITOR_BUS, BusSend::on(1.0))],
            ),
        }
    }
}

impl MixerConfig {
    fn for_slot(&self, slot: SourceSlot) -> &SourceMix {
        match slot {
            SourceSlot::PlayerA | SourceSlot::PlayerB => &self.main_player,
            SourceSlot::Cartwall => &self.cartwall,
            SourceSlot::Microphone => &self.microphone,
            SourceSlot::Pfl => &self.pfl,
        }
    }
}

struct GraphNodes {
    source_gain: HashMap<SourceSlot, Arc<GainParam>>,
    source_meter: HashMap<SourceSlot, LevelMonitor>,
    /// Routing gain per (source slot, bus id). Zero unless the send is on.
    sends: HashMap<(SourceSlot, String), Arc<GainParam>>,
    /// Ducking on the main-player → main path.
    duck_player: Arc<GainParam>,
    /// Ducking on the cartwall → main path.
    duck_cartwall: Arc<GainParam>,
    bus_gain: HashMap<String, Arc<GainParam>>,
    bus_meter: HashMap<String, LevelMonitor>,
    mastering: MasteringChain,
    bus_order: Vec<String>,
}

/// The routing graph. Mutated exclusively by the control plane.
pub struct AudioGraph {
    clock: AudioClock,
    sample_rate: f32,
    buses: Vec<AudioBus>,
    nodes: Option<GraphNodes>,
}

impl AudioGraph {
    pub fn new(sample_rate: f32) -> Self {
        AudioGraph {
            clock: AudioClock::new(),
            sample_rate,
            buses: default_buses(),
            nodes: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.nodes.is_some()
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    /// Build the full node topology exactly once. Re-invocation on an
    /// already-initialized graph is a no-op.
    pub fn initialize(&mut self, buses: Vec<AudioBus>, mixer: &MixerConfig) {
        if self.nodes.is_some() {
            return;
        }
        if !buses.is_empty() {
            self.buses = buses;
        }

        let mut source_gain = HashMap::new();
        let mut source_meter = HashMap::new();
        let mut sends = HashMap::new();
        let mut bus_gain = HashMap::new();
        let mut bus_meter = HashMap::new();
        let mut bus_order = Vec::new();

        for slot in SourceSlot::ALL {
            let mix = mixer.for_slot(slot);
            source_gain.insert(slot, GainParam::new(mix.channel_gain()));
            source_meter.insert(slot, LevelMonitor::new());
            for bus in &self.buses {
                let send = mix.send(&bus.id);
                sends.insert(
                    (slot, bus.id.clone()),
                    GainParam::new(send.effective_gain()),
                );
            }
        }

        for bus in &self.buses {
            let gain = if bus.muted { 0.0 } else { bus.gain };
            bus_gain.insert(bus.id.clone(), GainParam::new(gain));
            bus_meter.insert(bus.id.clone(), LevelMonitor::new());
            bus_order.push(bus.id.clone());
        }

        self.nodes = Some(GraphNodes {
            source_gain,
            source_meter,
            sends,
            duck_player: GainParam::new(1.0),
            duck_cartwall: GainParam::new(1.0),
            bus_gain,
            bus_meter,
            mastering: MasteringChain::with_defaults(self.sample_rate),
            bus_order,
        });
    }

    /// Number of processing nodes in the topology. Stable across repeated
    /// `initialize()` calls.
    pub fn node_count(&self) -> usize {
        match &self.nodes {
            Some(n) => {
                n.source_gain.len()
                    + n.source_meter.len()
                    + n.sends.len()
                    + 2 // ducking gains
                    + n.bus_gain.len()
                    + n.bus_meter.len()
                    + 1 // mastering chain
                    + n.bus_order.len() // output sinks
            }
            None => 0,
        }
    }

    /// Number of edges in the topology. Stable across repeated
    /// `initialize()` calls.
    pub fn connection_count(&self) -> usize {
        match &self.nodes {
            Some(n) => {
                // source → gain → meter, meter fan-out into each send,
                // send → bus mix, duck insertions, bus gain → meter → sink,
                // mastering inserted on the main bus.
                n.source_gain.len() * 2 + n.sends.len() * 2 + 2 + n.bus_order.len() * 2 + 1
            }
            None => 0,
        }
    }

    /// Ramp source and send gains toward a new mixer config.
    /// Topology is untouched. No-op while uninitialized.
    pub fn set_mixer_config(&mut self, mixer: &MixerConfig) {
        let now = self.clock.now_secs();
        let Some(nodes) = &self.nodes else { return };

        for slot in SourceSlot::ALL {
            let mix = mixer.for_slot(slot);
            nodes.source_gain[&slot].ramp_to(mix.channel_gain(), CONTROL_RAMP_SECS, now);
            for bus_id in &nodes.bus_order {
                let send = mix.send(bus_id);
                if let Some(param) = nodes.sends.get(&(slot, bus_id.clone())) {
                    param.ramp_to(send.effective_gain(), CONTROL_RAMP_SECS, now);
                }
            }
        }
    }

    /// Ramp bus gains toward new settings and remember output-device
    /// assignments. Buses not present at initialize time are ignored.
    pub fn set_buses(&mut self, buses: &[AudioBus]) {
        let now = self.clock.now_secs();
        let Some(nodes) = &self.nodes else { return };

        for bus in buses {
            if let Some(param) = nodes.bus_gain.get(&bus.id) {
                let target = if bus.muted { 0.0 } else { bus.gain };
                param.ramp_to(target, CONTROL_RAMP_SECS, now);
            }
            if let Some(stored) = self.buses.iter_mut().find(|b| b.id == bus.id) {
                *stored = bus.clone();
            }
        }
    }

    /// Ramp the dedicated ducking gains. Simultaneous duckers compose
    /// multiplicatively on the main-player path.
    pub fn set_ducking(
        &mut self,
        presenter_live: bool,
        cart_playing: bool,
        mic_level: f32,
        cart_level: f32,
        fade_secs: f64,
    ) {
        let now = self.clock.now_secs();
        let Some(nodes) = &self.nodes else { return };

        let mic_factor = if presenter_live { mic_level } else { 1.0 };
        let cart_factor = if cart_playing { cart_level } else { 1.0 };
        nodes
            .duck_player
            .ramp_to(mic_factor * cart_factor, fade_secs, now);
        nodes.duck_cartwall.ramp_to(mic_factor, fade_secs, now);
    }

    /// Update the main-bus mastering chain toward policy targets.
    pub fn set_mastering(&mut self, config: &MasteringConfig) {
        let Some(nodes) = &mut self.nodes else { return };
        nodes.mastering.set_config(config.clone());
    }

    /// Gain param for a source slot, for audio-path wiring.
    pub fn source_param(&self, slot: SourceSlot) -> Option<Arc<GainParam>> {
        self.nodes.as_ref().map(|n| n.source_gain[&slot].clone())
    }

    /// Routing gain param for a (source, bus) pair.
    pub fn send_param(&self, slot: SourceSlot, bus_id: &str) -> Option<Arc<GainParam>> {
        self.nodes
            .as_ref()
            .and_then(|n| n.sends.get(&(slot, bus_id.to_string())).cloned())
    }

    /// Ducking gain param applied to a slot's main-bus path, if any.
    pub fn duck_param(&self, slot: SourceSlot) -> Option<Arc<GainParam>> {
        let nodes = self.nodes.as_ref()?;
        match slot {
            SourceSlot::PlayerA | SourceSlot::PlayerB => Some(nodes.duck_player.clone()),
            SourceSlot::Cartwall => Some(nodes.duck_cartwall.clone()),
            _ => None,
        }
    }

    /// Level monitor for a source slot.
    pub fn source_monitor(&self, slot: SourceSlot) -> Option<LevelMonitor> {
        self.nodes.as_ref().map(|n| n.source_meter[&slot].clone())
    }

    /// Effective gain on the (slot → bus) path at an audio-clock time:
    /// source gain × ducking × send gain.
    pub fn path_gain(&self, slot: SourceSlot, bus_id: &str, clock: f64) -> f32 {
        let Some(nodes) = &self.nodes else { return 0.0 };
        let Some(send) = nodes.sends.get(&(slot, bus_id.to_string())) else {
            return 0.0;
        };
        let duck = if bus_id == MAIN_BUS {
            match slot {
                SourceSlot::PlayerA | SourceSlot::PlayerB => nodes.duck_player.value_at(clock),
                SourceSlot::Cartwall => nodes.duck_cartwall.value_at(clock),
                _ => 1.0,
            }
        } else {
            1.0
        };
        nodes.source_gain[&slot].value_at(clock) * duck * send.value_at(clock)
    }

    /// Mix one block of per-source samples into per-bus output blocks.
    /// Gains are evaluated sample-accurately from `clock_now`; the main bus
    /// runs through the mastering chain. Returns (bus id, samples) pairs in
    /// bus order. Empty while uninitialized.
    pub fn mix_block(
        &mut self,
        inputs: &[(SourceSlot, &[f32])],
        clock_now: f64,
    ) -> Vec<(String, Vec<f32>)> {
        let sample_rate = self.sample_rate as f64;
        let Some(nodes) = &mut self.nodes else {
            return Vec::new();
        };

        let block_len = inputs.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        let mut out = Vec::with_capacity(nodes.bus_order.len());

        for bus_id in nodes.bus_order.clone() {
            let mut mixed = vec![0.0f32; block_len];
            for (slot, samples) in inputs {
                let Some(send) = nodes.sends.get(&(*slot, bus_id.clone())) else {
                    continue;
                };
                let duck = if bus_id == MAIN_BUS {
                    match slot {
                        SourceSlot::PlayerA | SourceSlot::PlayerB => Some(&nodes.duck_player),
                        SourceSlot::Cartwall => Some(&nodes.duck_cartwall),
                        _ => None,
                    }
                } else {
                    None
                };
                let source_gain = &nodes.source_gain[slot];
                for (i, sample) in samples.iter().enumerate() {
                    let t = clock_now + i as f64 / sample_rate;
                    let mut g = source_gain.value_at(t) * send.value_at(t);
                    if let Some(d) = duck {
                        g *= d.value_at(t);
                    }
                    mixed[i] += sample * g;
                }
            }

            let bus_gain = &nodes.bus_gain[&bus_id];
            for (i, s) in mixed.iter_mut().enumerate() {
                let t = clock_now + i as f64 / sample_rate;
                *s *= bus_gain.value_at(t);
            }
            if bus_id == MAIN_BUS {
                nodes.mastering.process_buffer(&mut mixed);
            }
            store_meter(&nodes.bus_meter[&bus_id], &mixed);
            out.push((bus_id, mixed));
        }

        for (slot, samples) in inputs {
            store_meter(&nodes.source_meter[slot], samples);
        }
        out
    }

    /// Meter readings across all analyzers.
    pub fn level_snapshot(&self) -> LevelSnapshot {
        let mut snapshot = LevelSnapshot::default();
        let Some(nodes) = &self.nodes else {
            return snapshot;
        };
        for slot in SourceSlot::ALL {
            let m = &nodes.source_meter[&slot];
            snapshot
                .points
                .push((slot.label().to_string(), m.rms(), m.peak()));
        }
        for bus_id in &nodes.bus_order {
            let m = &nodes.bus_meter[bus_id];
            snapshot
                .points
                .push((format!("bus:{}", bus_id), m.rms(), m.peak()));
        }
        snapshot
    }
}

fn store_meter(monitor: &LevelMonitor, samples: &[f32]) {
    if samples.is_empty() {
        return;
    }
    let sum_sq: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    monitor.set(rms, peak);
}
