//! Word-aligned ASR folding (spec §4.6): audio-in, text-in-with-`words`-meta
//! out. An upstream word-aligner and the ASR backend itself are both
//! upstream producers feeding this stage's single audio input — a word
//! timing event carries a `word` key in its chunk meta and no `transcript`
//! key; a transcript event carries a `transcript` string in its meta and
//! covers the interval the transcript applies to. A [`TimeStore`] holds
//! word events until a transcript for their interval arrives, at which
//! point they're folded (last-writer-wins) into a `words` array attached
//! to the emitted text chunk.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::chunk::{Chunk, ChunkKind, Meta, Payload, PayloadKind, TimeOffsetMs};
use crate::core::params::ParamSchema;
use crate::core::queues::TimeStore;
use crate::core::stage::{Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

const TRANSCRIPT_KEY: &str = "transcript";
const WORD_KEY: &str = "word";
const WORDS_KEY: &str = "words";

pub struct Asr {
    id: String,
    reader: Option<ChunkReader>,
    writer: Option<ChunkWriter>,
}

type WordEvent = (TimeOffsetMs, TimeOffsetMs, Meta);

fn fold_words(store: &TimeStore<WordEvent>, start: TimeOffsetMs, end: TimeOffsetMs) -> (Meta, Vec<Value>) {
    let mut merged = Meta::new();
    let mut words = Vec::new();
    for (entry_start, entry_end, meta) in store.fetch(start, end) {
        for (k, v) in &meta {
            merged.insert(k.clone(), v.clone());
        }
        if let Some(word) = meta.get(WORD_KEY) {
            words.push(serde_json::json!({
                "word": word,
                "start": entry_start,
                "end": entry_end,
            }));
        }
    }
    (merged, words)
}

#[async_trait]
impl Stage for Asr {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    async fn open(&mut self, _ctx: StageContext) -> Result<StageStream> {
        let (stream, reader, writer) = open_pair(PayloadKind::Audio, PayloadKind::Text);
        self.reader = reader;
        self.writer = writer;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut reader = self.reader.take().expect("opened");
        let mut writer = self.writer.take().expect("opened");
        let store: TimeStore<WordEvent> = TimeStore::new();

        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    let Chunk {
                        timestamp_start,
                        timestamp_end,
                        kind,
                        meta,
                        ..
                    } = chunk;

                    match meta.get(TRANSCRIPT_KEY).and_then(Value::as_str) {
                        Some(transcript) => {
                            let transcript = transcript.to_string();
                            let (mut merged, words) = fold_words(&store, timestamp_start, timestamp_end);
                            for (k, v) in &meta {
                                if k != TRANSCRIPT_KEY {
                                    merged.insert(k.clone(), v.clone());
                                }
                            }
                            merged.insert(WORDS_KEY.to_string(), Value::Array(words));
                            let out = Chunk::new(timestamp_start, timestamp_end, kind, Payload::Text(transcript))
                                .with_meta(merged);
                            if writer.write(out).await.is_err() {
                                break;
                            }
                            store.prune(timestamp_start);
                        }
                        None => {
                            store.store(timestamp_start, timestamp_end, (timestamp_start, timestamp_end, meta));
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

pub struct AsrFactory;

impl StageFactory for AsrFactory {
    fn type_name(&self) -> &'static str {
        "asr"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
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
        Ok(Box::new(Asr {
            id,
            reader: None,
            writer: None,
        }))
    }
}
