//! Voice-activity segmentation (spec §4.6): converts incoming PCM-S16LE
//! audio to float samples, frames it at a fixed sample count with
//! trailing zero-padding, and hands each chunk's frames to an async
//! speech detector. A chunk is annotated speech iff any of its frames is.
//!
//! Three concurrent roles share one [`MultiPointerQueue`]: a receive task
//! appends one entry per incoming chunk, an annotator task walks entries
//! as they arrive and marks each with the detector's verdict, and the
//! send loop (the stage's `run()` body, also where mute/unmute COMMANDs
//! are applied) consumes annotated entries in order and trims them once
//! sent. Mode **silenced** always emits a same-length chunk, zeroing the
//! audio for non-speech; mode **unplugged** emits speech chunks only,
//! plus a configurable tail window of non-speech chunks after a speech
//! run ends. When the send loop catches up to the annotator (or the
//! annotator catches up to the receiver), it re-polls on a short timer
//! rather than waiting indefinitely, so a lagging detector or a stalled
//! producer can never deadlock the stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::chunk::{Chunk, Payload, PayloadKind};
use crate::core::params::{ParamSchema, ParamSpec, ParamType};
use crate::core::queues::MultiPointerQueue;
use crate::core::stage::{bind_params, CommandReceiver, Stage, StageContext, StageFactory};
use crate::core::stream::{ChunkReader, ChunkWriter, StageStream};
use crate::error::{Result, SpeechFlowError};
use crate::stages::open_pair;

/// Fixed VAD frame size (512 samples of a 16 kHz target), spec §4.6.
const FRAME_SIZE: usize = 512;
/// How often an idle producer/consumer re-checks the queue rather than
/// waiting on a single wakeup it might have missed.
const REPOLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, PartialEq, Eq)]
enum VadMode {
    Silenced,
    Unplugged,
}

impl VadMode {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "silenced" => Ok(VadMode::Silenced),
            "unplugged" => Ok(VadMode::Unplugged),
            other => Err(SpeechFlowError::Configuration(format!(
                "vad mode must be 'silenced' or 'unplugged', got '{other}'"
            ))),
        }
    }
}

/// Convert PCM-S16LE bytes to samples in `[-1.0, 1.0]`.
fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Split `samples` into fixed-size `FRAME_SIZE` frames, zero-padding the
/// trailing partial frame.
fn frame_samples(samples: &[f32]) -> Vec<Vec<f32>> {
    if samples.is_empty() {
        return Vec::new();
    }
    samples
        .chunks(FRAME_SIZE)
        .map(|chunk| {
            if chunk.len() == FRAME_SIZE {
                chunk.to_vec()
            } else {
                let mut padded = chunk.to_vec();
                padded.resize(FRAME_SIZE, 0.0);
                padded
            }
        })
        .collect()
}

/// Per-frame speech/non-speech classifier. `detect_frame` is async so a
/// real implementation can call out to a model or external process
/// without blocking the annotator task on every frame.
#[async_trait]
trait SpeechDetector: Send + Sync {
    async fn detect_frame(&self, frame: &[f32]) -> bool;
}

/// RMS-energy-over-threshold detector; the built-in default, grounded on
/// the crate's earlier energy-segmentation approach but now evaluated
/// per fixed-size frame instead of per arbitrary chunk.
struct EnergyDetector {
    threshold: f64,
}

#[async_trait]
impl SpeechDetector for EnergyDetector {
    async fn detect_frame(&self, frame: &[f32]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / frame.len() as f64).sqrt();
        rms >= self.threshold
    }
}

/// One chunk's place in the segmenter queue: the original chunk plus the
/// annotator's verdict, filled in asynchronously.
struct Entry {
    chunk: Chunk,
    is_speech: Mutex<Option<bool>>,
}

impl Entry {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            is_speech: Mutex::new(None),
        }
    }

    fn set_speech(&self, speech: bool) {
        *self.is_speech.lock().expect("entry mutex poisoned") = Some(speech);
    }

    fn speech(&self) -> Option<bool> {
        *self.is_speech.lock().expect("entry mutex poisoned")
    }
}

/// State shared across the receive/annotate/send roles.
struct Segmenter {
    queue: MultiPointerQueue<Arc<Entry>>,
    appended: AtomicUsize,
    receive_done: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl Segmenter {
    fn new() -> Self {
        Self {
            queue: MultiPointerQueue::new(),
            appended: AtomicUsize::new(0),
            receive_done: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }
}

/// Receive-pointer role: appends one entry per incoming chunk.
async fn run_receive(mut reader: ChunkReader, id: String, shared: Arc<Segmenter>) {
    loop {
        match reader.read().await {
            Ok(Some(chunk)) => {
                shared.queue.append(Arc::new(Entry::new(chunk)));
                shared.appended.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None) => break,
            Err(fault) => {
                *shared.fault.lock().expect("fault mutex poisoned") = Some(format!("{id}: {fault}"));
                break;
            }
        }
    }
    shared.receive_done.store(true, Ordering::SeqCst);
}

/// Annotator-pointer role: walks newly appended entries as they arrive
/// and marks each with the detector's per-chunk verdict (speech iff any
/// of its frames is speech).
async fn run_annotate(detector: Arc<dyn SpeechDetector>, shared: Arc<Segmenter>) {
    shared.queue.register_pointer("annotator");
    loop {
        match shared.queue.read_next("annotator") {
            Some(entry) => {
                let samples = pcm16_to_f32(entry.chunk.payload.as_audio().unwrap_or(&[]));
                let mut speech = false;
                for frame in frame_samples(&samples) {
                    if detector.detect_frame(&frame).await {
                        speech = true;
                    }
                }
                entry.set_speech(speech);
                shared.queue.touch();
            }
            None => {
                let caught_up = shared.queue.position("annotator").unwrap_or(0) >= shared.appended.load(Ordering::SeqCst);
                if shared.receive_done.load(Ordering::SeqCst) && caught_up {
                    break;
                }
                tokio::time::sleep(REPOLL_INTERVAL).await;
            }
        }
    }
}

/// Send-pointer role: consumes annotated entries in order, trims them,
/// and emits per spec's two modes. Also the stage's command loop, so
/// mute/unmute COMMANDs (spec §4.7, §6 scenario 5) take effect here.
async fn run_send(
    mode: VadMode,
    tail_ms: i64,
    mut writer: ChunkWriter,
    mut commands: CommandReceiver,
    shared: Arc<Segmenter>,
) {
    shared.queue.register_pointer("send");
    let mut muted = false;
    let mut tail_until: Option<i64> = None;

    loop {
        while let Ok(cmd) = commands.try_recv() {
            muted = apply_mute_command(&cmd.action, muted);
            let _ = cmd.reply.send(serde_json::json!("OK"));
        }

        let send_pos = shared.queue.position("send").unwrap_or(0);
        let annotator_pos = shared.queue.position("annotator").unwrap_or(0);

        if send_pos < annotator_pos {
            if let Some(entry) = shared.queue.read_next("send") {
                shared.queue.trim();
                if !muted {
                    let is_speech = entry.speech().unwrap_or(false);
                    let sent = match mode {
                        VadMode::Silenced => {
                            let payload = if is_speech {
                                entry.chunk.payload.clone()
                            } else {
                                Payload::Audio(vec![0u8; entry.chunk.payload.len()])
                            };
                            let out = entry.chunk.derive(
                                entry.chunk.timestamp_start,
                                entry.chunk.timestamp_end,
                                entry.chunk.kind,
                                payload,
                            );
                            writer.write(out).await
                        }
                        VadMode::Unplugged => {
                            if is_speech {
                                tail_until = Some(entry.chunk.timestamp_end + tail_ms);
                                writer.write(entry.chunk.clone()).await
                            } else if tail_until.is_some_and(|until| entry.chunk.timestamp_start < until) {
                                writer.write(entry.chunk.clone()).await
                            } else {
                                tail_until = None;
                                Ok(())
                            }
                        }
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        if shared.receive_done.load(Ordering::SeqCst) && send_pos >= shared.appended.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            Some(cmd) = commands.recv() => {
                muted = apply_mute_command(&cmd.action, muted);
                let _ = cmd.reply.send(serde_json::json!("OK"));
            }
            _ = tokio::time::sleep(REPOLL_INTERVAL) => {}
        }
    }

    writer.finish();
}

/// Applies a `mute`/`unmute` COMMAND (spec §4.7, §6 scenario 5) to the
/// running mute flag; any other action leaves it unchanged.
fn apply_mute_command(action: &str, muted: bool) -> bool {
    match action {
        "mute" => true,
        "unmute" => false,
        _ => muted,
    }
}

pub struct Vad {
    id: String,
    mode: VadMode,
    tail_ms: i64,
    threshold: f64,
    reader: Option<ChunkReader>,
    writer: Option<ChunkWriter>,
    commands: Option<CommandReceiver>,
}

#[async_trait]
impl Stage for Vad {
    fn id(&self) -> &str {
        &self.id
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }

    async fn open(&mut self, ctx: StageContext) -> Result<StageStream> {
        let (stream, reader, writer) = open_pair(PayloadKind::Audio, PayloadKind::Audio);
        self.reader = reader;
        self.writer = writer;
        self.commands = Some(ctx.commands);
        Ok(stream)
    }

    async fn run(&mut self) -> Result<()> {
        let reader = self.reader.take().expect("opened");
        let writer = self.writer.take().expect("opened");
        let commands = self.commands.take().expect("opened");

        let shared = Arc::new(Segmenter::new());
        let detector: Arc<dyn SpeechDetector> = Arc::new(EnergyDetector { threshold: self.threshold });

        let receive_task = tokio::spawn(run_receive(reader, self.id.clone(), shared.clone()));
        let annotate_task = tokio::spawn(run_annotate(detector, shared.clone()));

        run_send(self.mode, self.tail_ms, writer, commands, shared.clone()).await;

        let _ = receive_task.await;
        let _ = annotate_task.await;

        if let Some(message) = shared.fault.lock().expect("fault mutex poisoned").take() {
            return Err(SpeechFlowError::stream(&self.id, message));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct VadFactory;

impl StageFactory for VadFactory {
    fn type_name(&self) -> &'static str {
        "vad"
    }
    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new(vec![
            ParamSpec::new("mode", ParamType::String).default(serde_json::json!("silenced")),
            ParamSpec::new("tail_ms", ParamType::Number).default(serde_json::json!(300)),
            ParamSpec::new("threshold", ParamType::Number).default(serde_json::json!(0.02)),
        ])
    }
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>> {
        let bound = bind_params(&id, &self.param_schema(), named, positional)?;
        let mode = VadMode::parse(bound["mode"].as_str().expect("validated"))?;
        Ok(Box::new(Vad {
            id,
            mode,
            tail_ms: bound["tail_ms"].as_f64().expect("validated") as i64,
            threshold: bound["threshold"].as_f64().expect("validated"),
            reader: None,
            writer: None,
            commands: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::ChunkKind;

    fn silent_frame(n: usize) -> Vec<u8> {
        vec![0u8; n]
    }

    fn loud_frame(n: usize) -> Vec<u8> {
        (0..n / 2).flat_map(|_| i16::MAX.to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn energy_detector_distinguishes_silence_from_speech() {
        let detector = EnergyDetector { threshold: 0.02 };
        let silence = vec![0.0f32; FRAME_SIZE];
        let speech = vec![0.9f32; FRAME_SIZE];
        assert!(!detector.detect_frame(&silence).await);
        assert!(detector.detect_frame(&speech).await);
    }

    #[test]
    fn frame_samples_zero_pads_the_trailing_partial_frame() {
        let samples = vec![1.0f32; FRAME_SIZE + 10];
        let frames = frame_samples(&samples);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), FRAME_SIZE);
        assert_eq!(frames[1].len(), FRAME_SIZE);
        assert_eq!(frames[1][10], 0.0, "samples past the partial frame's data are zero");
    }

    #[tokio::test]
    async fn silenced_mode_emits_same_length_chunks_zeroing_non_speech() {
        let factory = VadFactory;
        let mut stage = factory.create("v".into(), &HashMap::new(), &[]).unwrap();

        let shutdown = crate::core::shutdown::ShutdownHandle::new();
        let (ctx, _commands) = StageContext::new("v", shutdown);
        let stream = stage.open(ctx).await.unwrap();
        let mut input = stream.input.unwrap();
        let mut output = stream.output.unwrap();

        let run = tokio::spawn(async move { stage.run().await });

        let loud = loud_frame(FRAME_SIZE * 2);
        let quiet = silent_frame(FRAME_SIZE * 2);
        input.write(Chunk::new(0, 20, ChunkKind::Final, Payload::Audio(loud.clone()))).await.unwrap();
        input.write(Chunk::new(20, 40, ChunkKind::Final, Payload::Audio(quiet.clone()))).await.unwrap();
        input.finish();

        let first = output.read().await.unwrap().unwrap();
        assert_eq!(first.payload.as_audio().unwrap().len(), loud.len());
        assert_eq!(first.payload, Payload::Audio(loud));

        let second = output.read().await.unwrap().unwrap();
        assert_eq!(second.payload.as_audio().unwrap().len(), quiet.len());
        assert!(second.payload.as_audio().unwrap().iter().all(|&b| b == 0), "non-speech audio is zeroed");

        assert!(output.read().await.unwrap().is_none());
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unplugged_mode_emits_speech_and_tail_window_only() {
        let factory = VadFactory;
        let mut named = HashMap::new();
        named.insert("mode".to_string(), serde_json::json!("unplugged"));
        named.insert("tail_ms".to_string(), serde_json::json!(5));
        let mut stage = factory.create("v".into(), &named, &[]).unwrap();

        let shutdown = crate::core::shutdown::ShutdownHandle::new();
        let (ctx, _commands) = StageContext::new("v", shutdown);
        let stream = stage.open(ctx).await.unwrap();
        let mut input = stream.input.unwrap();
        let mut output = stream.output.unwrap();

        let run = tokio::spawn(async move { stage.run().await });

        input.write(Chunk::new(0, 10, ChunkKind::Final, Payload::Audio(loud_frame(FRAME_SIZE * 2)))).await.unwrap();
        input.write(Chunk::new(10, 20, ChunkKind::Final, Payload::Audio(silent_frame(FRAME_SIZE * 2)))).await.unwrap();
        input.write(Chunk::new(20, 40, ChunkKind::Final, Payload::Audio(silent_frame(FRAME_SIZE * 2)))).await.unwrap();
        input.finish();

        // Speech ends at t=10, opening a tail window until t=15: the
        // chunk starting at t=10 falls inside it and is emitted; the one
        // starting at t=20 does not and is dropped.
        let first = output.read().await.unwrap().unwrap();
        assert_eq!(first.timestamp_start, 0);
        let second = output.read().await.unwrap().unwrap();
        assert_eq!(second.timestamp_start, 10);
        assert!(output.read().await.unwrap().is_none(), "the third non-speech chunk falls outside the tail window");
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mute_command_suppresses_output_until_unmuted() {
        let factory = VadFactory;
        let mut named = HashMap::new();
        named.insert("mode".to_string(), serde_json::json!("unplugged"));
        let mut stage = factory.create("v".into(), &named, &[]).unwrap();

        let shutdown = crate::core::shutdown::ShutdownHandle::new();
        let (ctx, commands) = StageContext::new("v", shutdown);
        let stream = stage.open(ctx).await.unwrap();
        let mut input = stream.input.unwrap();
        let mut output = stream.output.unwrap();

        let run = tokio::spawn(async move { stage.run().await });

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        commands
            .send(crate::core::stage::ControlCommand {
                action: "mute".to_string(),
                args: serde_json::Value::Null,
                reply: reply_tx,
            })
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), serde_json::json!("OK"));

        let muted_chunk = Chunk::new(0, 20, ChunkKind::Final, Payload::Audio(loud_frame(FRAME_SIZE * 2)));
        input.write(muted_chunk).await.unwrap();

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        commands
            .send(crate::core::stage::ControlCommand {
                action: "unmute".to_string(),
                args: serde_json::Value::Null,
                reply: reply_tx,
            })
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), serde_json::json!("OK"));

        let passthrough_chunk = Chunk::new(20, 40, ChunkKind::Final, Payload::Audio(loud_frame(FRAME_SIZE * 2)));
        input.write(passthrough_chunk.clone()).await.unwrap();
        input.finish();

        let out = output.read().await.unwrap().unwrap();
        assert_eq!(out.payload, passthrough_chunk.payload);
        assert!(output.read().await.unwrap().is_none());
        run.await.unwrap().unwrap();
    }
}
