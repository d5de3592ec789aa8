//! The Chunk data model.
//!
//! A [`Chunk`] is the single payload unit carried on every edge of a graph.
//! See `spec.md` §3 for the authoritative description of fields and
//! invariants.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as MetaValue;

/// Whether a chunk is a provisional guess that may be superseded, or a
/// settled result over its interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Intermediate,
    Final,
}

/// The payload carried by a chunk: audio bytes or a text string.
///
/// `audio` bytes are interpreted per the environment's PCM convention
/// (spec §6 "Audio format baseline" unless a stage documents otherwise).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Audio(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Audio(_) => PayloadKind::Audio,
            Payload::Text(_) => PayloadKind::Text,
        }
    }

    pub fn as_audio(&self) -> Option<&[u8]> {
        match self {
            Payload::Audio(b) => Some(b),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Audio(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Audio(b) => b.len(),
            Payload::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The declared IO kind of a stage side, or `None` for a side the stage
/// does not expose (spec §3 Stage, §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Audio,
    Text,
    None,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Audio => write!(f, "audio"),
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::None => write!(f, "none"),
        }
    }
}

/// Offset from the graph's time-zero, in milliseconds.
pub type TimeOffsetMs = i64;

/// A mapping from string key to arbitrary JSON-ish value, preserved and
/// merged across stages with last-writer-wins semantics (spec §3).
pub type Meta = HashMap<String, MetaValue>;

/// The unit of data flowing on every edge of a graph (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub timestamp_start: TimeOffsetMs,
    pub timestamp_end: TimeOffsetMs,
    pub kind: ChunkKind,
    pub payload: Payload,
    #[serde(default)]
    pub meta: Meta,
}

impl Chunk {
    /// Builds a chunk, enforcing the `start <= end` invariant.
    pub fn new(start: TimeOffsetMs, end: TimeOffsetMs, kind: ChunkKind, payload: Payload) -> Self {
        debug_assert!(start <= end, "chunk interval must be non-decreasing");
        Self {
            timestamp_start: start.min(end),
            timestamp_end: start.max(end),
            kind,
            payload,
            meta: Meta::new(),
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn duration_ms(&self) -> TimeOffsetMs {
        self.timestamp_end - self.timestamp_start
    }

    /// Whether this chunk's interval intersects `[start, end]`.
    pub fn intersects(&self, start: TimeOffsetMs, end: TimeOffsetMs) -> bool {
        self.timestamp_start <= end && start <= self.timestamp_end
    }

    /// Clone-on-modify helper: produce a new chunk with the same metadata
    /// but a different payload and interval, as required of every
    /// Transform stage (spec §4.1 contract 5) — never mutate the source
    /// chunk's buffers in place.
    pub fn derive(
        &self,
        start: TimeOffsetMs,
        end: TimeOffsetMs,
        kind: ChunkKind,
        payload: Payload,
    ) -> Chunk {
        Chunk {
            timestamp_start: start,
            timestamp_end: end,
            kind,
            payload,
            meta: self.meta.clone(),
        }
    }

    /// Merge `other`'s meta into this chunk's meta, later values winning
    /// per key (last-writer-wins fold, spec §3).
    pub fn merge_meta_from(&mut self, other: &Meta) {
        for (k, v) in other {
            self.meta.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalizes_inverted_interval() {
        let c = Chunk::new(100, 50, ChunkKind::Final, Payload::Text("x".into()));
        assert_eq!(c.timestamp_start, 50);
        assert_eq!(c.timestamp_end, 100);
    }

    #[test]
    fn intersects_is_inclusive_on_touching_boundaries() {
        let c = Chunk::new(0, 10, ChunkKind::Final, Payload::Text("x".into()));
        assert!(c.intersects(10, 20));
        assert!(c.intersects(-5, 0));
        assert!(!c.intersects(11, 20));
    }

    #[test]
    fn derive_clones_meta_without_aliasing() {
        let mut meta = Meta::new();
        meta.insert("k".into(), serde_json::json!(1));
        let a = Chunk::new(0, 10, ChunkKind::Final, Payload::Text("a".into())).with_meta(meta);
        let mut b = a.derive(0, 10, ChunkKind::Final, Payload::Text("b".into()));
        b.meta.insert("k".into(), serde_json::json!(2));
        assert_eq!(a.meta["k"], serde_json::json!(1));
        assert_eq!(b.meta["k"], serde_json::json!(2));
    }

    #[test]
    fn merge_meta_last_writer_wins() {
        let mut a = Meta::new();
        a.insert("x".into(), serde_json::json!("old"));
        a.insert("y".into(), serde_json::json!("keep"));
        let mut chunk = Chunk::new(0, 1, ChunkKind::Final, Payload::Text("t".into())).with_meta(a);

        let mut newer = Meta::new();
        newer.insert("x".into(), serde_json::json!("new"));
        chunk.merge_meta_from(&newer);

        assert_eq!(chunk.meta["x"], serde_json::json!("new"));
        assert_eq!(chunk.meta["y"], serde_json::json!("keep"));
    }
}
