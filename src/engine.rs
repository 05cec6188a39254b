use crate::graph::{AudioBus, MixerConfig, default_buses};
use crate::policy::PlayoutPolicy;
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "aircast_state.json";

/// Persisted engine state: the raw sequence, transport position, routing
/// and policy configuration. Everything derived (timeline, fades, meters)
/// is rebuilt at runtime and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    #[serde(default)]
    pub sequence: Sequence,
    #[serde(default)]
    pub current_item_id: Option<u64>,
    #[serde(default)]
    pub current_index: Option<usize>,
    #[serde(default)]
    pub is_playing: bool,
    /// Stop playback once this item finishes.
    #[serde(default)]
    pub stop_after_id: Option<u64>,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default = "default_buses")]
    pub buses: Vec<AudioBus>,
    #[serde(default)]
    pub policy: PlayoutPolicy,
    #[serde(default)]
    pub output_device: Option<String>,
    /// Folder scanned for auto-fill candidates.
    #[serde(default)]
    pub autofill_folder: Option<PathBuf>,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            sequence: Sequence::new(),
            current_item_id: None,
            current_index: None,
            is_playing: false,
            stop_after_id: None,
            mixer: MixerConfig::default(),
            buses: default_buses(),
            policy: PlayoutPolicy::default(),
            output_device: None,
            autofill_folder: None,
        }
    }

    /// Default state-file location under the user config directory.
    pub fn default_state_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aircast")
            .join(STATE_FILE)
    }

    /// Load engine state from a JSON file, or create a new instance if the
    /// file is missing or unreadable.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(engine) => return engine,
                    Err(e) => eprintln!("Warning: corrupt state file, starting fresh: {}", e),
                },
                Err(e) => eprintln!("Warning: could not read state file: {}", e),
            }
        }
        Engine::new()
    }

    /// Load from the default location.
    pub fn load() -> Self {
        Self::load_from(&Self::default_state_path())
    }

    /// Persist current state as JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Cannot create {}: {}", parent.display(), e))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| format!("Serialize error: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Write error: {}", e))?;
        Ok(())
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::default_state_path())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{AddedBy, SourceRef, Track, TrackKind};
    use std::time::Duration;

    fn make_track(title: &str) -> Track {
        Track {
            id: 0,
            title: title.to_string(),
            artist: "X".to_string(),
            duration: Duration::new(60, 0),
            kind: TrackKind::Song,
            source: SourceRef::Local(format!("{}.mp3", title).into()),
            tags: Vec::new(),
            added_by: AddedBy::User,
        }
    }

    #[test]
    fn new_engine_is_idle_with_default_buses() {
        let engine = Engine::new();
        assert!(!engine.is_playing);
        assert!(engine.current_item_id.is_none());
        assert_eq!(engine.buses.len(), 2);
        assert!(engine.sequence.is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut engine = Engine::new();
        let id = engine.sequence.push_track(make_track("A"));
        engine.current_item_id = Some(id);
        engine.current_index = Some(0);
        engine.is_playing = true;
        engine.policy.crossfade_enabled = true;
        engine.save_to(&path).unwrap();

        let loaded = Engine::load_from(&path);
        assert_eq!(loaded.sequence.len(), 1);
        assert_eq!(loaded.current_item_id, Some(id));
        assert!(loaded.is_playing);
        assert!(loaded.policy.crossfade_enabled);
    }

    #[test]
    fn load_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::load_from(&dir.path().join("absent.json"));
        assert!(engine.sequence.is_empty());
    }

    #[test]
    fn load_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        let engine = Engine::load_from(&path);
        assert!(engine.sequence.is_empty());
    }

    #[test]
    fn old_state_files_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"is_playing":false}"#).unwrap();
        let engine = Engine::load_from(&path);
        assert_eq!(engine.buses.len(), 2);
        assert_eq!(engine.policy.crossfade_secs, 3.0);
    }
}
