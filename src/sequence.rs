use crate::track::{AddedBy, Track};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a time-fix marker interacts with playback when its time arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    /// Force an immediate fade-out and jump once the time is reached.
    Hard,
    /// Let the current track finish; unplayed items before the marker are
    /// skipped once its time has elapsed.
    Soft,
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerKind::Hard => write!(f, "hard"),
            MarkerKind::Soft => write!(f, "soft"),
        }
    }
}

/// A wall-clock time-fix point in the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub kind: MarkerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Pool scope for a dynamic-selection item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickSource {
    Folder(PathBuf),
    Tag(String),
}

/// One entry of the raw playlist. Order is significant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceItem {
    Track(Track),
    Marker(Marker),
    /// Placeholder resolved into a concrete track when the playhead reaches it.
    Pick { id: u64, source: PickSource },
}

impl SequenceItem {
    pub fn id(&self) -> u64 {
        match self {
            SequenceItem::Track(t) => t.id,
            SequenceItem::Marker(m) => m.id,
            SequenceItem::Pick { id, .. } => *id,
        }
    }

    pub fn as_track(&self) -> Option<&Track> {
        match self {
            SequenceItem::Track(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_marker(&self) -> Option<&Marker> {
        match self {
            SequenceItem::Marker(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_track(&self) -> bool {
        matches!(self, SequenceItem::Track(_))
    }
}

/// The raw playlist — an ordered list of tracks, markers, and picks.
/// Assigns item ids; all mutation goes through here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    items: Vec<SequenceItem>,
    #[serde(default = "first_id")]
    next_id: u64,
}

fn first_id() -> u64 {
    1
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence {
    pub fn new() -> Self {
        Sequence {
            items: Vec::new(),
            next_id: 1,
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn items(&self) -> &[SequenceItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&SequenceItem> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, id: u64) -> Option<&SequenceItem> {
        self.items.iter().find(|i| i.id() == id)
    }

    pub fn index_of(&self, id: u64) -> Option<usize> {
        self.items.iter().position(|i| i.id() == id)
    }

    /// Append a track, assigning it a fresh id. Returns the id.
    pub fn push_track(&mut self, mut track: Track) -> u64 {
        let id = self.take_id();
        track.id = id;
        self.items.push(SequenceItem::Track(track));
        id
    }

    /// Insert a track at a position, or append if `at` is None. Returns the id.
    pub fn insert_track(&mut self, track: Track, at: Option<usize>) -> Result<u64, String> {
        match at {
            Some(pos) => {
                if pos > self.items.len() {
                    return Err(format!(
                        "Insert position {} out of range (sequence has {} items)",
                        pos,
                        self.items.len()
                    ));
                }
                let id = self.take_id();
                let mut track = track;
                track.id = id;
                self.items.insert(pos, SequenceItem::Track(track));
                Ok(id)
            }
            None => Ok(self.push_track(track)),
        }
    }

    /// Insert a time-fix marker. Returns the assigned id.
    pub fn insert_marker(
        &mut self,
        time: DateTime<Utc>,
        kind: MarkerKind,
        label: Option<String>,
        at: Option<usize>,
    ) -> Result<u64, String> {
        let pos = at.unwrap_or(self.items.len());
        if pos > self.items.len() {
            return Err(format!(
                "Insert position {} out of range (sequence has {} items)",
                pos,
                self.items.len()
            ));
        }
        let id = self.take_id();
        self.items.insert(
            pos,
            SequenceItem::Marker(Marker {
                id,
                time,
                kind,
                label,
            }),
        );
        Ok(id)
    }

    /// Update an existing marker's time, kind, or label.
    pub fn update_marker(
        &mut self,
        id: u64,
        time: Option<DateTime<Utc>>,
        kind: Option<MarkerKind>,
        label: Option<Option<String>>,
    ) -> Result<(), String> {
        let marker = self
            .items
            .iter_mut()
            .find_map(|i| match i {
                SequenceItem::Marker(m) if m.id == id => Some(m),
                _ => None,
            })
            .ok_or_else(|| format!("Marker {} not found", id))?;
        if let Some(t) = time {
            marker.time = t;
        }
        if let Some(k) = kind {
            marker.kind = k;
        }
        if let Some(l) = label {
            marker.label = l;
        }
        Ok(())
    }

    /// Insert a dynamic-selection placeholder. Returns the assigned id.
    pub fn insert_pick(&mut self, source: PickSource, at: Option<usize>) -> Result<u64, String> {
        let pos = at.unwrap_or(self.items.len());
        if pos > self.items.len() {
            return Err(format!(
                "Insert position {} out of range (sequence has {} items)",
                pos,
                self.items.len()
            ));
        }
        let id = self.take_id();
        self.items.insert(pos, SequenceItem::Pick { id, source });
        Ok(id)
    }

    /// Remove an item by id. Returns the removed item.
    pub fn remove(&mut self, id: u64) -> Result<SequenceItem, String> {
        let pos = self
            .index_of(id)
            .ok_or_else(|| format!("Sequence item {} not found", id))?;
        Ok(self.items.remove(pos))
    }

    /// Move an item from one position to another.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<(), String> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(format!(
                "Index out of range (sequence has {} items)",
                self.items.len()
            ));
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        Ok(())
    }

    /// Replace an item in place, keeping its id. Used when a pick resolves
    /// into a concrete track.
    pub fn replace_with_track(&mut self, id: u64, mut track: Track) -> Result<(), String> {
        let pos = self
            .index_of(id)
            .ok_or_else(|| format!("Sequence item {} not found", id))?;
        track.id = id;
        self.items[pos] = SequenceItem::Track(track);
        Ok(())
    }

    /// Drop all items before `index`, re-zeroing indexing for passed content.
    /// Returns the number of removed items.
    pub fn truncate_before(&mut self, index: usize) -> usize {
        let n = index.min(self.items.len());
        self.items.drain(..n);
        n
    }

    /// Remove unplayed auto-fill tracks positioned after `after_index`.
    /// Called when a manual edit lands in the middle of generated content.
    /// Returns the removed ids.
    pub fn purge_autofill_tail(&mut self, after_index: usize) -> Vec<u64> {
        let mut removed = Vec::new();
        let mut i = self.items.len();
        while i > after_index + 1 {
            i -= 1;
            if let SequenceItem::Track(t) = &self.items[i] {
                if t.added_by == AddedBy::AutoFill {
                    removed.push(t.id);
                    self.items.remove(i);
                }
            }
        }
        removed.reverse();
        removed
    }

    /// Total duration in seconds of tracks from `from_index` to the end.
    pub fn remaining_duration_secs(&self, from_index: usize) -> f64 {
        self.items
            .iter()
            .skip(from_index)
            .filter_map(|i| i.as_track())
            .map(|t| t.duration_secs())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{SourceRef, TrackKind};
    use chrono::TimeZone;
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

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn push_assigns_unique_ids() {
        let mut seq = Sequence::new();
        let a = seq.push_track(make_track("A"));
        let b = seq.push_track(make_track("B"));
        assert_ne!(a, b);
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn insert_track_at_position() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        seq.push_track(make_track("C"));
        seq.insert_track(make_track("B"), Some(1)).unwrap();
        let titles: Vec<&str> = seq
            .items()
            .iter()
            .filter_map(|i| i.as_track())
            .map(|t| t.title.as_str())
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[test]
    fn insert_track_out_of_range_errors() {
        let mut seq = Sequence::new();
        assert!(seq.insert_track(make_track("A"), Some(5)).is_err());
    }

    #[test]
    fn marker_insert_and_update() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        let id = seq
            .insert_marker(t0(), MarkerKind::Soft, Some("News".to_string()), None)
            .unwrap();

        seq.update_marker(id, None, Some(MarkerKind::Hard), None)
            .unwrap();
        let marker = seq.find(id).unwrap().as_marker().unwrap();
        assert_eq!(marker.kind, MarkerKind::Hard);
        assert_eq!(marker.label.as_deref(), Some("News"));
        assert_eq!(marker.time, t0());
    }

    #[test]
    fn update_missing_marker_errors() {
        let mut seq = Sequence::new();
        assert!(seq.update_marker(99, None, None, None).is_err());
    }

    #[test]
    fn remove_by_id() {
        let mut seq = Sequence::new();
        let a = seq.push_track(make_track("A"));
        seq.push_track(make_track("B"));
        let removed = seq.remove(a).unwrap();
        assert_eq!(removed.id(), a);
        assert_eq!(seq.len(), 1);
        assert!(seq.remove(a).is_err());
    }

    #[test]
    fn reorder_moves_items() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        seq.push_track(make_track("B"));
        seq.push_track(make_track("C"));
        seq.reorder(0, 2).unwrap();
        let titles: Vec<&str> = seq
            .items()
            .iter()
            .filter_map(|i| i.as_track())
            .map(|t| t.title.as_str())
            .collect();
        assert_eq!(titles, vec!["B", "C", "A"]);
    }

    #[test]
    fn truncate_before_drops_passed_items() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        seq.push_track(make_track("B"));
        let c = seq.push_track(make_track("C"));
        let removed = seq.truncate_before(2);
        assert_eq!(removed, 2);
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.items()[0].id(), c);
        assert_eq!(seq.index_of(c), Some(0));
    }

    #[test]
    fn replace_pick_with_track_keeps_id() {
        let mut seq = Sequence::new();
        let id = seq
            .insert_pick(PickSource::Tag("jazz".to_string()), None)
            .unwrap();
        seq.replace_with_track(id, make_track("Resolved")).unwrap();
        let track = seq.find(id).unwrap().as_track().unwrap();
        assert_eq!(track.id, id);
        assert_eq!(track.title, "Resolved");
    }

    #[test]
    fn purge_autofill_tail_removes_only_generated_tracks() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        let mut fill1 = make_track("F1");
        fill1.added_by = AddedBy::AutoFill;
        seq.push_track(fill1);
        seq.push_track(make_track("B"));
        let mut fill2 = make_track("F2");
        fill2.added_by = AddedBy::AutoFill;
        let f2 = seq.push_track(fill2);

        let removed = seq.purge_autofill_tail(1);
        assert_eq!(removed, vec![f2]);
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn remaining_duration_sums_tracks_only() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        seq.insert_marker(t0(), MarkerKind::Soft, None, None).unwrap();
        seq.push_track(make_track("B"));
        assert_eq!(seq.remaining_duration_secs(0), 120.0);
        assert_eq!(seq.remaining_duration_secs(2), 60.0);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut seq = Sequence::new();
        seq.push_track(make_track("A"));
        seq.insert_marker(t0(), MarkerKind::Hard, Some("Top".to_string()), None)
            .unwrap();
        let json = serde_json::to_string(&seq).unwrap();
        let loaded: Sequence = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.items()[1].as_marker().is_some());
    }
}
