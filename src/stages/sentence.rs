//! Sentence splitting (spec §4.6): merges/splits incoming text fragments
//! into sentence-sized chunks on a terminal-punctuation rule (`.`, `;`,
//! `?`, `!`). A chunk whose payload ends mid-sentence is merged with the
//! next arrival (adopting the earlier start time); a chunk containing a
//! full sentence plus a remainder is split into two, with the boundary
//! timestamp interpolated proportionally to character length. A 100ms
//! retry timer flushes whatever is pending when no new input has arrived,
//! so a trailing fragment isn't held forever.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::chunk::{Chunk, ChunkKind, Payload, PayloadKind, TimeOffsetMs};
use crate::core::params::ParamSchema;
use crate::core::stage::{Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

const RETRY_TIMER: Duration = Duration::from_millis(100);
const TERMINAL_PUNCTUATION: [char; 4] = ['.', ';', '?', '!'];

/// Splits `text` (covering `[start, end]`) at every terminal-punctuation
/// boundary, interpolating each split point proportionally to how much of
/// the remaining character count the completed sentence consumed. Returns
/// the completed sentences (each with its own sub-interval), the start
/// timestamp of whatever remains unterminated, and that remainder's text.
fn split_sentences(
    mut text: String,
    mut start: TimeOffsetMs,
    end: TimeOffsetMs,
) -> (Vec<(TimeOffsetMs, TimeOffsetMs, String)>, TimeOffsetMs, String) {
    let mut sentences = Vec::new();
    loop {
        match text.find(TERMINAL_PUNCTUATION) {
            Some(idx) => {
                let sentence: String = text.drain(..=idx).collect();
                let sentence_chars = sentence.chars().count() as f64;
                let rest_chars = text.chars().count() as f64;
                let total_chars = sentence_chars + rest_chars;
                let frac = if total_chars > 0.0 { sentence_chars / total_chars } else { 1.0 };
                let span = (end - start) as f64;
                let split_point = start + (span * frac).round() as TimeOffsetMs;
                sentences.push((start, split_point, sentence.trim().to_string()));
                start = split_point;
            }
            None => break,
        }
    }
    (sentences, start, text)
}

pub struct SentenceSplitter {
    id: String,
    reader: Option<ChunkReader>,
    writer: Option<ChunkWriter>,
}

#[async_trait]
impl Stage for SentenceSplitter {
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
        let mut buffer_start: Option<TimeOffsetMs> = None;
        let mut last_end: TimeOffsetMs = 0;

        loop {
            let timer = tokio::time::sleep(RETRY_TIMER);
            tokio::select! {
                read = reader.read() => {
                    match read {
                        Ok(Some(chunk)) => {
                            if buffer_start.is_none() {
                                buffer_start = Some(chunk.timestamp_start);
                            }
                            if let Some(text) = chunk.payload.as_text() {
                                if !buffer.is_empty() && !text.starts_with(char::is_whitespace) {
                                    buffer.push(' ');
                                }
                                buffer.push_str(text);
                            }
                            last_end = chunk.timestamp_end;
                            let start = buffer_start.take().expect("set above");

                            let (sentences, remainder_start, remainder) =
                                split_sentences(std::mem::take(&mut buffer), start, last_end);

                            for (s, e, sentence) in sentences {
                                if sentence.is_empty() {
                                    continue;
                                }
                                let out = Chunk::new(s, e, ChunkKind::Final, Payload::Text(sentence));
                                if writer.write(out).await.is_err() {
                                    return Ok(());
                                }
                            }

                            buffer = remainder;
                            buffer_start = if buffer.trim().is_empty() { None } else { Some(remainder_start) };
                        }
                        Ok(None) => {
                            if !buffer.trim().is_empty() {
                                let s = buffer_start.take().unwrap_or(last_end);
                                let out = Chunk::new(s, last_end, ChunkKind::Final, Payload::Text(buffer.trim().to_string()));
                                let _ = writer.write(out).await;
                                buffer.clear();
                            }
                            break;
                        }
                        Err(fault) => return Err(SpeechFlowError::stream(&self.id, fault.to_string())),
                    }
                }
                _ = timer => {
                    if !buffer.trim().is_empty() {
                        let s = buffer_start.take().unwrap_or(last_end);
                        let out = Chunk::new(s, last_end, ChunkKind::Final, Payload::Text(buffer.trim().to_string()));
                        if writer.write(out).await.is_err() {
                            return Ok(());
                        }
                        buffer.clear();
                    }
                }
            }
        }

        writer.finish();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct SentenceSplitterFactory;

impl StageFactory for SentenceSplitterFactory {
    fn type_name(&self) -> &'static str {
        "sentence"
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
        Ok(Box::new(SentenceSplitter {
            id,
            reader: None,
            writer: None,
        }))
    }
}
