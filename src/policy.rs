use crate::mastering::MasteringConfig;
use serde::{Deserialize, Serialize};

/// Everything the operator can tune about automatic playout behavior.
/// All fields default individually so old state files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayoutPolicy {
    /// Minimum minutes before the same artist may recur.
    #[serde(default = "default_artist_separation")]
    pub artist_separation_mins: f64,
    /// Minimum minutes before the same title may recur.
    #[serde(default = "default_title_separation")]
    pub title_separation_mins: f64,

    #[serde(default)]
    pub crossfade_enabled: bool,
    /// Crossfade window in seconds.
    #[serde(default = "default_crossfade_secs")]
    pub crossfade_secs: f64,

    /// Music gain while the presenter microphone is live (0.0–1.0).
    #[serde(default = "default_mic_duck_level")]
    pub mic_duck_level: f32,
    /// Music gain while the cartwall is firing (0.0–1.0).
    #[serde(default = "default_cart_duck_level")]
    pub cart_duck_level: f32,
    /// Seconds over which ducking gain changes are ramped.
    #[serde(default = "default_duck_fade_secs")]
    pub duck_fade_secs: f64,

    #[serde(default)]
    pub mastering: MasteringConfig,

    /// Auto-fill kicks in when remaining scheduled audio drops below this.
    #[serde(default = "default_autofill_lead_secs")]
    pub autofill_lead_secs: f64,
    /// Duration of material each auto-fill pass tries to append.
    #[serde(default = "default_autofill_target_secs")]
    pub autofill_target_secs: f64,

    /// Drop already-played items from the sequence as playback advances.
    #[serde(default)]
    pub remove_played_tracks: bool,
}

fn default_artist_separation() -> f64 {
    60.0
}

fn default_title_separation() -> f64 {
    120.0
}

fn default_crossfade_secs() -> f64 {
    3.0
}

fn default_mic_duck_level() -> f32 {
    0.2
}

fn default_cart_duck_level() -> f32 {
    0.4
}

fn default_duck_fade_secs() -> f64 {
    0.5
}

fn default_autofill_lead_secs() -> f64 {
    300.0
}

fn default_autofill_target_secs() -> f64 {
    900.0
}

impl Default for PlayoutPolicy {
    fn default() -> Self {
        PlayoutPolicy {
            artist_separation_mins: default_artist_separation(),
            title_separation_mins: default_title_separation(),
            crossfade_enabled: false,
            crossfade_secs: default_crossfade_secs(),
            mic_duck_level: default_mic_duck_level(),
            cart_duck_level: default_cart_duck_level(),
            duck_fade_secs: default_duck_fade_secs(),
            mastering: MasteringConfig::default(),
            autofill_lead_secs: default_autofill_lead_secs(),
            autofill_target_secs: default_autofill_target_secs(),
            remove_played_tracks: false,
        }
    }
}
