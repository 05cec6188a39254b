//! AudioRuntime — dedicated audio thread with channel-based command dispatch.
//!
//! Owns the `Player` on a single thread (no Send/Sync needed). External code
//! communicates via `AudioHandle` (wraps `mpsc::Sender<AudioCmd>`), which is
//! naturally Send+Sync. Lane-end detection happens inside the thread loop
//! via `recv_timeout` + `player.lane_empty()`. The thread does no
//! control-plane work; it only starts, stops, and observes lanes.

use crate::automation::GainParam;
use crate::levels::LevelMonitor;
use crate::player::{Lane, Player};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

// ── Commands & Events ────────────────────────────────────────────────────────

/// Commands sent to the audio thread.
pub enum AudioCmd {
    Play {
        lane: Lane,
        path: PathBuf,
        gain: Option<Arc<GainParam>>,
        monitor: Option<LevelMonitor>,
        start_clock: f64,
    },
    Stop(Lane),
    StopAll,
    Pause,
    Resume,
    Seek {
        lane: Lane,
        position: Duration,
    },
    /// Recreate the player on a different output device.
    /// None = use default device.
    SetDevice(Option<String>),
    Shutdown,
}

/// Events emitted by the audio thread back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Playing(Lane),
    PlayError { lane: Lane, message: String },
    LaneFinished(Lane),
    Stopped,
    Paused,
    Resumed,
    Seeked { lane: Lane, secs: f64 },
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe handle for sending commands to the audio runtime.
#[derive(Clone)]
pub struct AudioHandle {
    tx: mpsc::Sender<AudioCmd>,
}

impl AudioHandle {
    pub fn play(
        &self,
        lane: Lane,
        path: PathBuf,
        gain: Option<Arc<GainParam>>,
        monitor: Option<LevelMonitor>,
        start_clock: f64,
    ) {
        let _ = self.tx.send(AudioCmd::Play {
            lane,
            path,
            gain,
            monitor,
            start_clock,
        });
    }

    pub fn stop(&self, lane: Lane) {
        let _ = self.tx.send(AudioCmd::Stop(lane));
    }

    pub fn stop_all(&self) {
        let _ = self.tx.send(AudioCmd::StopAll);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(AudioCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(AudioCmd::Resume);
    }

    pub fn seek(&self, lane: Lane, position: Duration) {
        let _ = self.tx.send(AudioCmd::Seek { lane, position });
    }

    pub fn set_device(&self, device_name: Option<String>) {
        let _ = self.tx.send(AudioCmd::SetDevice(device_name));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Spawn the audio runtime on a dedicated thread.
///
/// `on_event` is called from the audio thread whenever a state change occurs.
/// `device_name` selects the initial output device (None = system default).
///
/// Returns an `AudioHandle` for sending commands.
pub fn spawn_audio_runtime<F>(device_name: Option<String>, on_event: F) -> AudioHandle
where
    F: Fn(AudioEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<AudioCmd>();

    std::thread::Builder::new()
        .name("audio-runtime".into())
        .spawn(move || {
            audio_thread_loop(rx, device_name, on_event);
        })
        .expect("failed to spawn audio-runtime thread");

    AudioHandle { tx }
}

/// Main loop for the audio thread. Owns the Player.
fn audio_thread_loop<F>(rx: mpsc::Receiver<AudioCmd>, initial_device: Option<String>, on_event: F)
where
    F: Fn(AudioEvent),
{
    let mut player: Option<Player> = None;
    let mut device_name: Option<String> = initial_device;
    let mut lane_playing: HashMap<Lane, bool> = HashMap::new();
    let mut last_seek: HashMap<Lane, Instant> = HashMap::new();

    loop {
        // Poll for commands with a short timeout to detect lane ends.
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(cmd) => match cmd {
                AudioCmd::Play {
                    lane,
                    path,
                    gain,
                    monitor,
                    start_clock,
                } => {
                    // Lazy-init player on first use.
                    if player.is_none() {
                        let result = match &device_name {
                            Some(name) => Player::new_with_device(name),
                            None => Player::new(),
                        };
                        match result {
                            Ok(p) => player = Some(p),
                            Err(e) => {
                                on_event(AudioEvent::PlayError {
                                    lane,
                                    message: e,
                                });
                                continue;
                            }
                        }
                    }

                    let p = player.as_ref().unwrap();
                    match p.play_file(lane, &path, gain, monitor, start_clock) {
                        Ok(()) => {
                            lane_playing.insert(lane, true);
                            on_event(AudioEvent::Playing(lane));
                        }
                        Err(e) => {
                            on_event(AudioEvent::PlayError {
                                lane,
                                message: e,
                            });
                        }
                    }
                }

                AudioCmd::Stop(lane) => {
                    if let Some(p) = &player {
                        p.stop(lane);
                    }
                    lane_playing.insert(lane, false);
                }

                AudioCmd::StopAll => {
                    if let Some(p) = &player {
                        p.stop_all();
                    }
                    lane_playing.clear();
                    on_event(AudioEvent::Stopped);
                }

                AudioCmd::Pause => {
                    if let Some(p) = &player {
                        p.pause_all();
                    }
                    on_event(AudioEvent::Paused);
                }

                AudioCmd::Resume => {
                    if let Some(p) = &player {
                        p.resume_all();
                    }
                    on_event(AudioEvent::Resumed);
                }

                AudioCmd::Seek { lane, position } => {
                    if let Some(p) = &player {
                        match p.try_seek(lane, position) {
                            Ok(()) => {
                                last_seek.insert(lane, Instant::now());
                                on_event(AudioEvent::Seeked {
                                    lane,
                                    secs: position.as_secs_f64(),
                                });
                            }
                            Err(e) => {
                                on_event(AudioEvent::PlayError {
                                    lane,
                                    message: e,
                                });
                            }
                        }
                    }
                }

                AudioCmd::SetDevice(new_device) => {
                    // Stop current playback before switching device.
                    if let Some(p) = player.take() {
                        p.stop_all();
                    }
                    lane_playing.clear();
                    device_name = new_device;
                    let result = match &device_name {
                        Some(name) => Player::new_with_device(name),
                        None => Player::new(),
                    };
                    match result {
                        Ok(p) => player = Some(p),
                        Err(e) => {
                            on_event(AudioEvent::PlayError {
                                lane: Lane::SlotA,
                                message: format!("Device switch failed: {}", e),
                            });
                        }
                    }
                }

                AudioCmd::Shutdown => {
                    if let Some(p) = &player {
                        p.stop_all();
                    }
                    break;
                }
            },

            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Check for natural lane ends, skipping lanes briefly after a
                // seek because rodio's try_seek flushes the buffer, making
                // lane_empty() transiently true.
                if let Some(p) = &player {
                    for lane in Lane::ALL {
                        if !lane_playing.get(&lane).copied().unwrap_or(false) {
                            continue;
                        }
                        let seek_cooldown = last_seek
                            .get(&lane)
                            .map(|t| t.elapsed() < Duration::from_millis(500))
                            .unwrap_or(false);
                        if !seek_cooldown && p.lane_empty(lane) {
                            lane_playing.insert(lane, false);
                            on_event(AudioEvent::LaneFinished(lane));
                        }
                    }
                }
            }

            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // All senders dropped — shut down.
                break;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioHandle>();
    }

    #[test]
    fn shutdown_stops_thread() {
        let handle = spawn_audio_runtime(None, |_| {});
        handle.shutdown();
        // Give the thread time to exit; reaching here without hanging is the
        // assertion.
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn play_nonexistent_emits_error() {
        let events: Arc<Mutex<Vec<AudioEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let handle = spawn_audio_runtime(None, move |evt| {
            events_clone.lock().unwrap().push(evt);
        });

        handle.play(
            Lane::SlotA,
            PathBuf::from("__nonexistent_file__.mp3"),
            None,
            None,
            0.0,
        );

        std::thread::sleep(Duration::from_millis(500));

        let evts = events.lock().unwrap();
        // Either the file is unreadable or there is no audio device; both
        // surface as PlayError.
        assert!(
            evts.iter()
                .any(|e| matches!(e, AudioEvent::PlayError { .. })),
            "Expected PlayError event, got: {:?}",
            *evts
        );

        handle.shutdown();
    }

    #[test]
    fn stop_all_emits_stopped() {
        let events: Arc<Mutex<Vec<AudioEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let handle = spawn_audio_runtime(None, move |evt| {
            events_clone.lock().unwrap().push(evt);
        });

        handle.stop_all();
        std::thread::sleep(Duration::from_millis(200));

        let evts = events.lock().unwrap();
        assert!(
            evts.iter().any(|e| matches!(e, AudioEvent::Stopped)),
            "Expected Stopped event, got: {:?}",
            *evts
        );

        handle.shutdown();
    }
}
