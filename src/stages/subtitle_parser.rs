//! Subtitle parsing (spec §4.6): the inverse of
//! [`crate::stages::subtitle_writer`] — accumulates incoming text
//! fragments until a complete cue block is available, splitting on
//! blank-line boundaries, and emits one text chunk per cue.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::core::chunk::{Chunk, ChunkKind, Payload, PayloadKind, TimeOffsetMs};
use crate::core::params::ParamSchema;
use crate::core::stage::{Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

fn inline_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)</?(?:b|i|u|v)(?:\s[^>]*)?>").expect("valid regex"))
}

fn strip_inline_tags(text: &str) -> String {
    inline_tag_pattern().replace_all(text, "").to_string()
}

/// Parses a `HH:MM:SS,mmm` or `HH:MM:SS.mmm` timestamp into milliseconds,
/// rejecting minute/second components greater than 59.
fn parse_timestamp(raw: &str) -> Option<TimeOffsetMs> {
    let raw = raw.trim();
    let (clock, millis) = if let Some(idx) = raw.rfind([',', '.']) {
        (&raw[..idx], &raw[idx + 1..])
    } else {
        return None;
    };
    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    let millis: i64 = millis.parse().ok()?;
    Some(hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + millis)
}

struct Cue {
    start: TimeOffsetMs,
    end: TimeOffsetMs,
    text: String,
}

/// Parses every complete cue out of `block` (one blank-line-separated
/// chunk of a subtitle document). A cue is: an optional numeric sequence
/// line (SRT), a `start --> end` timing line, then one or more text lines.
fn parse_cue(block: &str) -> Option<Cue> {
    let mut lines = block.lines().filter(|l| !l.trim().is_empty());
    let mut first = lines.next()?.trim().to_string();
    if first.chars().all(|c| c.is_ascii_digit()) {
        first = lines.next()?.trim().to_string();
    }
    let (start_raw, end_raw) = first.split_once("-->")?;
    let start = parse_timestamp(start_raw)?;
    let end = parse_timestamp(end_raw)?;
    let text: Vec<&str> = lines.collect();
    let text = strip_inline_tags(&text.join("\n"));
    let text = text.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(Cue { start, end, text })
}

fn drain_complete_cues(buffer: &mut String) -> Vec<Cue> {
    let mut cues = Vec::new();
    while let Some(idx) = buffer.find("\n\n") {
        let block: String = buffer.drain(..idx + 2).collect();
        if let Some(cue) = parse_cue(&block) {
            cues.push(cue);
        }
    }
    cues
}

pub struct SubtitleParser {
    id: String,
    reader: Option<ChunkReader>,
    writer: Option<ChunkWriter>,
}

#[async_trait]
impl Stage for SubtitleParser {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    async fn open(&mut self, _ctx: StageContext) -> Result<StageStream> {
        let (stream, reader, writer) = open_pair(PayloadKind::Text, PayloadKind::Text);
        self.reader = reader;
        self.writer = writer;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut reader = self.reader.take().expect("opened");
        let mut writer = self.writer.take().expect("opened");

        let mut buffer = String::new();

        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if let Some(text) = chunk.payload.as_text() {
                        buffer.push_str(text);
                    }
                    for cue in drain_complete_cues(&mut buffer) {
                        let out = Chunk::new(cue.start, cue.end, ChunkKind::Final, Payload::Text(cue.text));
                        if writer.write(out).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(None) => break,
                Err(fault) => return Err(SpeechFlowError::stream(&self.id, fault.to_string())),
            }
        }

        if !buffer.trim().is_empty() {
            buffer.push_str("\n\n");
            for cue in drain_complete_cues(&mut buffer) {
                let out = Chunk::new(cue.start, cue.end, ChunkKind::Final, Payload::Text(cue.text));
                let _ = writer.write(out).await;
            }
        }

        writer.finish();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SubtitleParserFactory;

impl StageFactory for SubtitleParserFactory {
    fn type_name(&self) -> &'static str {
        "t2t-subtitle-parse"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::default()
    }
    fn create(
        &self,
        id: String,
        _named: &HashMap<String, Value>,
        _positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        Ok(Box::new(SubtitleParser {
            id,
            reader: None,
            writer: None,
        }))
    }
}
