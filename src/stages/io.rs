//! File-backed audio/text IO stages: the connective tissue that lets a
//! pipeline expression actually read and write real files end to end.
//! Not one of the spec's named exemplar stages, but grounded on the same
//! `Stage`/`StageFactory` contract and on the teacher's
//! `processors::input::simulated`/`processors::output::log` source/sink
//! shape (a periodic emission loop on one side, a drain loop on the
//! other). `path = "-"` means stdin for a source and stdout for a sink,
//! matching the pass-through-over-stdio convention.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::core::chunk::{Chunk, ChunkKind, Payload, PayloadKind, TimeOffsetMs};
use crate::core::params::{ParamSchema, ParamSpec, ParamType};
use crate::core::shutdown::ShutdownHandle;
use crate::core::stage::{bind_params, Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

/// The PCM baseline assumed when a stage does not document otherwise
/// (spec §6 "Audio format baseline"): 16kHz mono, 16-bit signed samples.
const BYTES_PER_SAMPLE: usize = 2;
const DEFAULT_SAMPLE_RATE: i64 = 16_000;
const DEFAULT_FRAME_MS: i64 = 20;

fn get_str(params: &HashMap<String, Value>, name: &str) -> String {
    params[name].as_str().expect("validated by schema").to_string()
}

fn get_number(params: &HashMap<String, Value>, name: &str) -> f64 {
    params[name].as_f64().expect("validated by schema")
}

// ---------------------------------------------------------------- source

pub struct TextSource {
    id: String,
    path: String,
    line_ms: i64,
    shutdown: Option<ShutdownHandle>,
    writer: Option<ChunkWriter>,
}

#[async_trait]
impl Stage for TextSource {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    async fn open(&mut self, ctx: StageContext) -> Result<StageStream> {
        self.shutdown = Some(ctx.shutdown.clone());
        let (stream, _reader, writer) = open_pair(PayloadKind::None, PayloadKind::Text);
        self.writer = writer;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut writer = self.writer.take().expect("opened");
        let shutdown = self.shutdown.clone().expect("opened");
        let mut lines: Lines<Box<dyn AsyncBufRead + Unpin + Send>> = if self.path == "-" {
            BufReader::new(Box::new(tokio::io::stdin()) as Box<dyn AsyncBufRead + Unpin + Send>).lines()
        } else {
            let file = tokio::fs::File::open(&self.path)
                .await
                .map_err(|e| SpeechFlowError::open(&self.id, format!("cannot open '{}': {e}", self.path)))?;
            BufReader::new(Box::new(file) as Box<dyn AsyncBufRead + Unpin + Send>).lines()
        };
        let mut index: i64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                line = lines.next_line() => {
                    let Some(text) = line.map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))? else {
                        break;
                    };
                    let start = index * self.line_ms;
                    let end = start + self.line_ms;
                    index += 1;
                    let chunk = Chunk::new(start, end, ChunkKind::Final, Payload::Text(text));
                    if writer.write(chunk).await.is_err() {
                        break;
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

pub struct TextSourceFactory;

impl StageFactory for TextSourceFactory {
    fn type_name(&self) -> &'static str {
        "text_source"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::new("path", ParamType::String).required().positional(0),
            ParamSpec::new("line_ms", ParamType::Number).default(serde_json::json!(1000)),
        ])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        Ok(Box::new(TextSource {
            id,
            path: get_str(&bound, "path"),
            line_ms: get_number(&bound, "line_ms") as i64,
            shutdown: None,
            writer: None,
        }))
    }
}

// ------------------------------------------------------------------ sink

pub struct TextSink {
    id: String,
    path: String,
    reader: Option<ChunkReader>,
}

#[async_trait]
impl Stage for TextSink {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::None
    }

    async fn open(&mut self, _ctx: StageContext) -> Result<StageStream> {
        let (stream, reader, _writer) = open_pair(PayloadKind::Text, PayloadKind::None);
        self.reader = reader;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut reader = self.reader.take().expect("opened");
        let mut sink: Box<dyn AsyncWrite + Unpin + Send> = if self.path == "-" {
            Box::new(tokio::io::stdout())
        } else {
            Box::new(
                tokio::fs::File::create(&self.path)
                    .await
                    .map_err(|e| SpeechFlowError::open(&self.id, format!("cannot create '{}': {e}", self.path)))?,
            )
        };
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if let Some(text) = chunk.payload.as_text() {
                        sink.write_all(text.as_bytes())
                            .await
                            .map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
                        sink.write_all(b"\n")
                            .await
                            .map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
                    }
                }
                Ok(None) => break,
                Err(fault) => return Err(SpeechFlowError::stream(&self.id, fault.to_string())),
            }
        }
        sink.flush().await.map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct TextSinkFactory;

impl StageFactory for TextSinkFactory {
    fn type_name(&self) -> &'static str {
        "text_sink"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![ParamSpec::new("path", ParamType::String).required().positional(0)])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        Ok(Box::new(TextSink {
            id,
            path: get_str(&bound, "path"),
            reader: None,
        }))
    }
}

// --------------------------------------------------------- audio source

pub struct AudioSource {
    id: String,
    path: String,
    sample_rate: i64,
    frame_ms: i64,
    shutdown: Option<ShutdownHandle>,
    writer: Option<ChunkWriter>,
}

#[async_trait]
impl Stage for AudioSource {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }

    async fn open(&mut self, ctx: StageContext) -> Result<StageStream> {
        self.shutdown = Some(ctx.shutdown.clone());
        let (stream, _reader, writer) = open_pair(PayloadKind::None, PayloadKind::Audio);
        self.writer = writer;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut writer = self.writer.take().expect("opened");
        let shutdown = self.shutdown.clone().expect("opened");
        let mut source: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if self.path == "-" {
            Box::new(tokio::io::stdin())
        } else {
            Box::new(
                tokio::fs::File::open(&self.path)
                    .await
                    .map_err(|e| SpeechFlowError::open(&self.id, format!("cannot open '{}': {e}", self.path)))?,
            )
        };

        let frame_bytes = ((self.sample_rate * self.frame_ms / 1000) as usize) * BYTES_PER_SAMPLE;
        let mut index: i64 = 0;

        loop {
            let mut buf = vec![0u8; frame_bytes];
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                read = source.read(&mut buf) => {
                    let n = read.map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    buf.truncate(n);
                    let start = index * self.frame_ms;
                    let end = start + self.frame_ms;
                    index += 1;
                    let chunk = Chunk::new(start, end, ChunkKind::Final, Payload::Audio(buf));
                    if writer.write(chunk).await.is_err() {
                        break;
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

pub struct AudioSourceFactory;

impl StageFactory for AudioSourceFactory {
    fn type_name(&self) -> &'static str {
        "audio_source"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::new("path", ParamType::String).required().positional(0),
            ParamSpec::new("sample_rate", ParamType::Number).default(serde_json::json!(DEFAULT_SAMPLE_RATE)),
            ParamSpec::new("frame_ms", ParamType::Number).default(serde_json::json!(DEFAULT_FRAME_MS)),
        ])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        Ok(Box::new(AudioSource {
            id,
            path: get_str(&bound, "path"),
            sample_rate: get_number(&bound, "sample_rate") as i64,
            frame_ms: get_number(&bound, "frame_ms") as i64,
            shutdown: None,
            writer: None,
        }))
    }
}

// ----------------------------------------------------------- audio sink

pub struct AudioSink {
    id: String,
    path: String,
    reader: Option<ChunkReader>,
}

#[async_trait]
impl Stage for AudioSink {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::None
    }

    async fn open(&mut self, _ctx: StageContext) -> Result<StageStream> {
        let (stream, reader, _writer) = open_pair(PayloadKind::Audio, PayloadKind::None);
        self.reader = reader;
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let mut reader = self.reader.take().expect("opened");
        let mut sink: Box<dyn AsyncWrite + Unpin + Send> = if self.path == "-" {
            Box::new(tokio::io::stdout())
        } else {
            Box::new(
                tokio::fs::File::create(&self.path)
                    .await
                    .map_err(|e| SpeechFlowError::open(&self.id, format!("cannot create '{}': {e}", self.path)))?,
            )
        };
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    if let Some(bytes) = chunk.payload.as_audio() {
                        sink.write_all(bytes)
                            .await
                            .map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
                    }
                }
                Ok(None) => break,
                Err(fault) => return Err(SpeechFlowError::stream(&self.id, fault.to_string())),
            }
        }
        sink.flush().await.map_err(|e| SpeechFlowError::stream(&self.id, e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct AudioSinkFactory;

impl StageFactory for AudioSinkFactory {
    fn type_name(&self) -> &'static str {
        "audio_sink"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::None
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![ParamSpec::new("path", ParamType::String).required().positional(0)])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        Ok(Box::new(AudioSink {
            id,
            path: get_str(&bound, "path"),
            reader: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_source_factory_declares_text_output() {
        assert_eq!(TextSourceFactory.output_kind(), PayloadKind::Text);
        assert_eq!(TextSourceFactory.input_kind(), PayloadKind::None);
    }

    #[test]
    fn audio_sink_requires_path() {
        let err = AudioSinkFactory
            .create("sink".into(), &HashMap::new(), &[])
            .unwrap_err();
        assert!(matches!(err, SpeechFlowError::Configuration(_)));
    }

    #[tokio::test]
    async fn text_source_and_sink_round_trip_a_file() {
        let dir = std::env::temp_dir();
        let in_path = dir.join(format!("speechflow-test-in-{}.txt", uuid::Uuid::new_v4()));
        let out_path = dir.join(format!("speechflow-test-out-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(&in_path, "hello\nworld\n").await.unwrap();

        let factory = TextSourceFactory;
        let mut named = HashMap::new();
        named.insert("path".to_string(), serde_json::json!(in_path.to_str().unwrap()));
        let mut source = factory.create("src".into(), &named, &[]).unwrap();

        let sink_factory = TextSinkFactory;
        let mut sink_named = HashMap::new();
        sink_named.insert("path".to_string(), serde_json::json!(out_path.to_str().unwrap()));
        let mut sink = sink_factory.create("snk".into(), &sink_named, &[]).unwrap();

        let shutdown = ShutdownHandle::new();
        let (source_ctx, _commands) = StageContext::new("src", shutdown.clone());
        let (sink_ctx, _commands) = StageContext::new("snk", shutdown.clone());
        let source_stream = source.open(source_ctx).await.unwrap();
        let sink_stream = sink.open(sink_ctx).await.unwrap();

        let mut out_reader = source_stream.output.unwrap();
        let mut in_writer = sink_stream.input.unwrap();

        let forward = tokio::spawn(async move {
            while let Ok(Some(chunk)) = out_reader.read().await {
                let _ = in_writer.write(chunk).await;
            }
            in_writer.finish();
        });

        source.run().await.unwrap();
        forward.await.unwrap();
        sink.run().await.unwrap();

        let contents = tokio::fs::read_to_string(&out_path).await.unwrap();
        assert_eq!(contents, "hello\nworld\n");

        let _ = tokio::fs::remove_file(&in_path).await;
        let _ = tokio::fs::remove_file(&out_path).await;
    }
}
