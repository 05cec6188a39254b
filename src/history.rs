use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HISTORY_MAX: usize = 100;

/// One completed playout, as consumed by separation checks and auto-fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayoutHistoryEntry {
    pub track_id: u64,
    pub title: String,
    pub artist: String,
    pub played_at: DateTime<Utc>,
}

/// Bounded ring of the most recent playouts (last 100).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayoutHistory {
    entries: VecDeque<PlayoutHistoryEntry>,
}

impl PlayoutHistory {
    pub fn new() -> Self {
        PlayoutHistory {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: PlayoutHistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > HISTORY_MAX {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlayoutHistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent play time for an artist (case-insensitive), if any.
    pub fn last_played_for_artist(&self, artist: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.artist.eq_ignore_ascii_case(artist))
            .map(|e| e.played_at)
    }

    /// True if the title appears anywhere in the retained window.
    pub fn contains_title(&self, title: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.title.eq_ignore_ascii_case(title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(artist: &str, title: &str, minute: u32) -> PlayoutHistoryEntry {
        PlayoutHistoryEntry {
            track_id: 1,
            title: title.to_string(),
            artist: artist.to_string(),
            played_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn ring_caps_at_one_hundred() {
        let mut history = PlayoutHistory::new();
        for i in 0..150 {
            history.push(entry("A", &format!("T{}", i), 0));
        }
        assert_eq!(history.len(), 100);
        // Oldest entries were dropped.
        assert!(!history.contains_title("T0"));
        assert!(history.contains_title("T149"));
    }

    #[test]
    fn last_played_for_artist_returns_newest() {
        let mut history = PlayoutHistory::new();
        history.push(entry("Adele", "One", 0));
        history.push(entry("Muse", "Two", 5));
        history.push(entry("adele", "Three", 10));

        let when = history.last_played_for_artist("ADELE").unwrap();
        assert_eq!(when, Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 0).unwrap());
        assert!(history.last_played_for_artist("Nobody").is_none());
    }

    #[test]
    fn contains_title_is_case_insensitive() {
        let mut history = PlayoutHistory::new();
        history.push(entry("A", "Hello", 0));
        assert!(history.contains_title("hello"));
        assert!(!history.contains_title("Goodbye"));
    }
}
