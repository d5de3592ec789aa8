//! Subtitle serialization (spec §4.6): renders text chunks as SRT or VTT
//! blocks. When a chunk carries a `words` meta array (as attached by
//! [`crate::stages::asr`]), the cue's interval is narrowed to the first
//! word's start through the last word's end, trimming leading/trailing
//! silence the chunk's own timestamps would otherwise include.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::core::chunk::{Chunk, ChunkKind, Payload, PayloadKind, TimeOffsetMs};
use crate::core::params::{ParamSchema, ParamSpec, ParamType};
use crate::core::stage::{bind_params, Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SubtitleFormat {
    Srt,
    Vtt,
}

impl SubtitleFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "srt" => Ok(SubtitleFormat::Srt),
            "vtt" => Ok(SubtitleFormat::Vtt),
            other => Err(SpeechFlowError::Configuration(format!(
                "subtitle format must be 'srt' or 'vtt', got '{other}'"
            ))),
        }
    }

    fn separator(self) -> char {
        match self {
            SubtitleFormat::Srt => ',',
            SubtitleFormat::Vtt => '.',
        }
    }
}

fn format_timestamp(ms: TimeOffsetMs, sep: char) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}{sep}{millis:03}")
}

/// Wraps the N-th (0-based) whole-word occurrence of `word` in `text` with
/// `<b>` tags. Occurrences are matched case-sensitively on word boundaries;
/// the needle is regex-escaped so punctuation in a transcribed word can't be
/// interpreted as a pattern.
fn highlight_nth_occurrence(text: &str, word: &str, occurrence: usize) -> String {
    let escaped = regex::escape(word);
    let pattern = format!(r"\b{escaped}\b");
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return text.to_string(),
    };
    let mut count = 0;
    let mut out = String::with_capacity(text.len() + 7);
    let mut last = 0;
    for m in re.find_iter(text) {
        if count == occurrence {
            out.push_str(&text[last..m.start()]);
            out.push_str("<b>");
            out.push_str(m.as_str());
            out.push_str("</b>");
            last = m.end();
            count += 1;
            continue;
        }
        count += 1;
    }
    out.push_str(&text[last..]);
    out
}

fn words_interval(meta_words: &[Value]) -> Option<(TimeOffsetMs, TimeOffsetMs)> {
    let first = meta_words.first()?.get("start")?.as_i64()?;
    let last = meta_words.last()?.get("end")?.as_i64()?;
    Some((first, last))
}

pub struct SubtitleWriter {
    id: String,
    format: SubtitleFormat,
    highlight: bool,
    reader: Option<ChunkReader>,
    writer: Option<ChunkWriter>,
}

impl SubtitleWriter {
    fn render_cue(&self, seq: usize, start: TimeOffsetMs, end: TimeOffsetMs, text: &str) -> String {
        let sep = self.format.separator();
        let timing = format!(
            "{} --> {}",
            format_timestamp(start, sep),
            format_timestamp(end, sep)
        );
        match self.format {
            SubtitleFormat::Srt => format!("{seq}\n{timing}\n{text}\n\n"),
            SubtitleFormat::Vtt => format!("{timing}\n{text}\n\n"),
        }
    }
}

#[async_trait]
impl Stage for SubtitleWriter {
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

        let mut seq = 1usize;
        let mut header_emitted = false;

        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if self.format == SubtitleFormat::Vtt && !header_emitted {
                        let header = Chunk::new(
                            chunk.timestamp_start,
                            chunk.timestamp_start,
                            ChunkKind::Final,
                            Payload::Text("WEBVTT\n\n".to_string()),
                        );
                        if writer.write(header).await.is_err() {
                            break;
                        }
                        header_emitted = true;
                    }

                    let text = chunk.payload.as_text().unwrap_or("").to_string();
                    let words = chunk
                        .meta
                        .get("words")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let (start, end) = words_interval(&words)
                        .unwrap_or((chunk.timestamp_start, chunk.timestamp_end));

                    if self.highlight && !words.is_empty() {
                        let mut seen: HashMap<String, usize> = HashMap::new();
                        for entry in &words {
                            let word = entry.get("word").and_then(Value::as_str).unwrap_or("");
                            let w_start = entry.get("start").and_then(Value::as_i64).unwrap_or(start);
                            let w_end = entry.get("end").and_then(Value::as_i64).unwrap_or(end);
                            let occurrence = *seen.entry(word.to_string()).or_insert(0);
                            seen.insert(word.to_string(), occurrence + 1);
                            let rendered = highlight_nth_occurrence(&text, word, occurrence);
                            let cue = self.render_cue(seq, w_start, w_end, &rendered);
                            seq += 1;
                            let out = Chunk::new(w_start, w_end, ChunkKind::Final, Payload::Text(cue));
                            if writer.write(out).await.is_err() {
                                return Ok(());
                            }
                        }
                    } else {
                        let cue = self.render_cue(seq, start, end, &text);
                        seq += 1;
                        let out = Chunk::new(start, end, ChunkKind::Final, Payload::Text(cue));
                        if writer.write(out).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(fault) => return Err(SpeechFlowError::stream(&self.id, fault.to_string())),
            }
        }

        writer.finish();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SubtitleWriterFactory;

impl StageFactory for SubtitleWriterFactory {
    fn type_name(&self) -> &'static str {
        "t2t-subtitle"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::new("format", ParamType::String).default(serde_json::json!("srt")),
            ParamSpec::new("highlight", ParamType::Boolean).default(serde_json::json!(false)),
        ])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        let format = SubtitleFormat::parse(bound["format"].as_str().expect("validated"))?;
        let highlight = bound["highlight"].as_bool().expect("validated");
        Ok(Box::new(SubtitleWriter {
            id,
            format,
            highlight,
            reader: None,
            writer: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shutdown::ShutdownHandle;

    #[test]
    fn formats_timestamp_with_given_separator() {
        assert_eq!(format_timestamp(3_723_456, ','), "01:02:03,456");
        assert_eq!(format_timestamp(1_000, '.'), "00:00:01.000");
    }

    #[test]
    fn highlights_second_occurrence_only() {
        let out = highlight_nth_occurrence("the cat sat on the mat", "the", 1);
        assert_eq!(out, "the cat sat on <b>the</b> mat");
    }

    #[tokio::test]
    async fn vtt_emission_matches_expected_blocks() {
        let mut named = HashMap::new();
        named.insert("format".to_string(), serde_json::json!("vtt"));
        let mut stage = SubtitleWriterFactory.create("w".into(), &named, &[]).unwrap();
        let (ctx, _commands) = StageContext::new("w".into(), ShutdownHandle::new());
        let stream = stage.open(ctx).await.unwrap();
        let mut input = stream.input.unwrap();
        let mut output = stream.output.unwrap();

        input.write(Chunk::new(1_000, 2_000, ChunkKind::Final, Payload::Text("A".into()))).await.unwrap();
        input.write(Chunk::new(3_000, 4_000, ChunkKind::Final, Payload::Text("B".into()))).await.unwrap();
        input.finish();

        let run = tokio::spawn(async move { stage.run().await });

        let header = output.read().await.unwrap().unwrap();
        assert_eq!(header.payload.as_text(), Some("WEBVTT\n\n"));

        let first = output.read().await.unwrap().unwrap();
        assert_eq!(
            first.payload.as_text(),
            Some("00:00:01.000 --> 00:00:02.000\nA\n\n")
        );

        let second = output.read().await.unwrap().unwrap();
        assert_eq!(
            second.payload.as_text(),
            Some("00:00:03.000 --> 00:00:04.000\nB\n\n")
        );

        assert!(output.read().await.unwrap().is_none());
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn srt_sequence_numbers_start_at_one_and_increment() {
        let mut stage = SubtitleWriterFactory.create("w".into(), &HashMap::new(), &[]).unwrap();
        let (ctx, _commands) = StageContext::new("w".into(), ShutdownHandle::new());
        let stream = stage.open(ctx).await.unwrap();
        let mut input = stream.input.unwrap();
        let mut output = stream.output.unwrap();

        input.write(Chunk::new(1_000, 2_000, ChunkKind::Final, Payload::Text("Hello".into()))).await.unwrap();
        input.write(Chunk::new(3_000, 4_000, ChunkKind::Final, Payload::Text("World".into()))).await.unwrap();
        input.finish();

        let run = tokio::spawn(async move { stage.run().await });
        let first = output.read().await.unwrap().unwrap();
        assert!(first.payload.as_text().unwrap().starts_with("1\n"));
        let second = output.read().await.unwrap().unwrap();
        assert!(second.payload.as_text().unwrap().starts_with("2\n"));
        run.await.unwrap().unwrap();
    }
}
