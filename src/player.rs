use crate::automation::{GainParam, GainSource};
use crate::levels::{LevelMonitor, LevelSource};
use crate::players::SlotId;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Output lanes: one sink each. The microphone is live input, not a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    SlotA,
    SlotB,
    Cartwall,
    Pfl,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::SlotA, Lane::SlotB, Lane::Cartwall, Lane::Pfl];

    pub fn for_slot(slot: SlotId) -> Lane {
        match slot {
            SlotId::A => Lane::SlotA,
            SlotId::B => Lane::SlotB,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Lane::SlotA => "slot-a",
            Lane::SlotB => "slot-b",
            Lane::Cartwall => "cartwall",
            Lane::Pfl => "pfl",
        }
    }
}

/// Runtime audio output wrapping rodio. Not serializable — created fresh per
/// session, one sink per lane on a single output stream.
pub struct Player {
    _stream: OutputStream,
    sinks: HashMap<Lane, Sink>,
}

impl Player {
    /// Initialize audio output on the default device.
    pub fn new() -> Result<Self, String> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to open audio output: {}", e))?;
        Self::with_stream(stream, handle)
    }

    /// Initialize audio output on a named device.
    pub fn new_with_device(device_name: &str) -> Result<Self, String> {
        let host = rodio::cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate output devices: {}", e))?
            .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
            .ok_or_else(|| format!("Output device '{}' not found", device_name))?;
        let (stream, handle) = OutputStream::try_from_device(&device)
            .map_err(|e| format!("Failed to open device '{}': {}", device_name, e))?;
        Self::with_stream(stream, handle)
    }

    fn with_stream(stream: OutputStream, handle: OutputStreamHandle) -> Result<Self, String> {
        let mut sinks = HashMap::new();
        for lane in Lane::ALL {
            let sink = Sink::try_new(&handle)
                .map_err(|e| format!("Failed to create {} sink: {}", lane.label(), e))?;
            sinks.insert(lane, sink);
        }
        Ok(Player {
            _stream: stream,
            sinks,
        })
    }

    fn sink(&self, lane: Lane) -> &Sink {
        &self.sinks[&lane]
    }

    /// Decode a file into a lane, replacing whatever the lane was playing.
    /// The decoded stream is wrapped with the lane's gain automation and
    /// level metering taps before it reaches the sink.
    pub fn play_file(
        &self,
        lane: Lane,
        path: &Path,
        gain: Option<Arc<GainParam>>,
        monitor: Option<LevelMonitor>,
        start_clock: f64,
    ) -> Result<(), String> {
        let file = File::open(path)
            .map_err(|e| format!("Cannot open '{}': {}", path.display(), e))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| format!("Cannot decode '{}': {}", path.display(), e))?
            .convert_samples::<f32>();

        let sink = self.sink(lane);
        sink.stop();
        match (gain, monitor) {
            (Some(g), Some(m)) => {
                sink.append(LevelSource::new(GainSource::new(source, g, start_clock), m))
            }
            (Some(g), None) => sink.append(GainSource::new(source, g, start_clock)),
            (None, Some(m)) => sink.append(LevelSource::new(source, m)),
            (None, None) => sink.append(source),
        }
        sink.play();
        Ok(())
    }

    /// Stop one lane, clearing its queue.
    pub fn stop(&self, lane: Lane) {
        self.sink(lane).stop();
    }

    /// Stop every lane.
    pub fn stop_all(&self) {
        for lane in Lane::ALL {
            self.sink(lane).stop();
        }
    }

    /// Pause every lane (can be resumed).
    pub fn pause_all(&self) {
        for lane in Lane::ALL {
            self.sink(lane).pause();
        }
    }

    /// Resume every paused lane.
    pub fn resume_all(&self) {
        for lane in Lane::ALL {
            self.sink(lane).play();
        }
    }

    /// True when the lane has finished all queued audio.
    pub fn lane_empty(&self, lane: Lane) -> bool {
        self.sink(lane).empty()
    }

    /// True if the lane is paused.
    pub fn is_paused(&self, lane: Lane) -> bool {
        self.sink(lane).is_paused()
    }

    /// Attempt to seek within the lane's current source.
    pub fn try_seek(&self, lane: Lane, position: Duration) -> Result<(), String> {
        self.sink(lane)
            .try_seek(position)
            .map_err(|e| format!("Seek failed: {}", e))
    }

    /// Names of the available output devices.
    pub fn output_device_names() -> Vec<String> {
        let host = rodio::cpal::default_host();
        match host.output_devices() {
            Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
            Err(_) => Vec::new(),
        }
    }

}
