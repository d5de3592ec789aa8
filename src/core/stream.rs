//! ChunkStream: the bidirectional, object-mode, backpressured dataflow pipe
//! that every stage exposes after `open()` (spec §4.1).
//!
//! The primitive here ([`channel`], producing a [`ChunkWriter`] /
//! [`ChunkReader`] pair) is used twice per stage: once for the stage's
//! *input intake* (external producers hold the `ChunkWriter`, the stage
//! holds the paired `ChunkReader` internally) and once for its *output*
//! (the stage holds the `ChunkWriter` internally, external consumers hold
//! the paired `ChunkReader`). A stage's exposed [`StageStream`] bundles
//! whichever of those two external handles its declared IO calls for —
//! a Source exposes only `output`, a Sink only `input`, a Duplex/Transform
//! both.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::chunk::Chunk;

/// A stream fault (spec §4.1 contract 4): delivered to both sides
/// synchronously, after which subsequent reads/writes fail fast.
#[derive(Debug, Error, Clone)]
pub enum StreamFault {
    #[error("stream closed")]
    Closed,
    #[error("stage '{stage}' faulted: {message}")]
    Stage { stage: String, message: String },
}

struct Shared {
    fault: Mutex<Option<Arc<StreamFault>>>,
    finish_tx: watch::Sender<bool>,
    end_tx: watch::Sender<bool>,
}

impl Shared {
    fn set_fault(&self, fault: StreamFault) {
        let mut guard = self.fault.lock().expect("stream fault mutex poisoned");
        if guard.is_none() {
            *guard = Some(Arc::new(fault));
        }
        // A fault terminates both phases at once (contract 4).
        let _ = self.finish_tx.send(true);
        let _ = self.end_tx.send(true);
    }

    fn get_fault(&self) -> Option<Arc<StreamFault>> {
        self.fault.lock().expect("stream fault mutex poisoned").clone()
    }
}

/// The writable side of a channel: accepts whole Chunks, object-mode,
/// capacity-bounded (spec §4.1 contracts 1-2).
pub struct ChunkWriter {
    tx: Option<mpsc::Sender<Chunk>>,
    shared: Arc<Shared>,
}

impl ChunkWriter {
    /// Write one Chunk, suspending if the downstream buffer is full.
    /// Fails fast if the stream has already faulted or finished.
    pub async fn write(&self, chunk: Chunk) -> Result<(), Arc<StreamFault>> {
        if let Some(fault) = self.shared.get_fault() {
            return Err(fault);
        }
        match &self.tx {
            Some(tx) => tx
                .send(chunk)
                .await
                .map_err(|_| Arc::new(StreamFault::Closed)),
            None => Err(Arc::new(StreamFault::Closed)),
        }
    }

    /// Signal that no further writes will occur. Idempotent. Call this
    /// only after any trailing `final` emissions the caller chooses to
    /// make (spec §4.1 contract 3).
    pub fn finish(&mut self) {
        if self.tx.take().is_some() {
            let _ = self.shared.finish_tx.send(true);
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.finish_tx.borrow()
    }

    pub fn subscribe_finish(&self) -> watch::Receiver<bool> {
        self.shared.finish_tx.subscribe()
    }

    /// Fault the stream; visible to both sides from this call forward.
    pub fn fault(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.tx = None;
        self.shared.set_fault(StreamFault::Stage {
            stage: stage.into(),
            message: message.into(),
        });
    }
}

/// The readable side of a channel: produces whole Chunks, ends exactly
/// once (spec §4.1 contract 3).
pub struct ChunkReader {
    rx: mpsc::Receiver<Chunk>,
    shared: Arc<Shared>,
}

impl ChunkReader {
    /// Read the next Chunk, or `Ok(None)` at end-of-stream (emitted
    /// exactly once — subsequent calls keep returning `Ok(None)`).
    pub async fn read(&mut self) -> Result<Option<Chunk>, Arc<StreamFault>> {
        if let Some(fault) = self.shared.get_fault() {
            return Err(fault);
        }
        match self.rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                let _ = self.shared.end_tx.send(true);
                Ok(None)
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        *self.shared.end_tx.borrow()
    }

    pub fn subscribe_end(&self) -> watch::Receiver<bool> {
        self.shared.end_tx.subscribe()
    }

    pub fn fault(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.shared.set_fault(StreamFault::Stage {
            stage: stage.into(),
            message: message.into(),
        });
    }
}

impl fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkWriter {{ finished: {} }}", self.is_finished())
    }
}

impl fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkReader {{ ended: {} }}", self.is_ended())
    }
}

/// Create a connected object-mode pair. `capacity` is clamped to at least
/// 1 — streams have an effective highwater bound of one Chunk (spec §4.1
/// contract 2, §5 "Backpressure").
pub fn channel(capacity: usize) -> (ChunkWriter, ChunkReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (finish_tx, _) = watch::channel(false);
    let (end_tx, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        fault: Mutex::new(None),
        finish_tx,
        end_tx,
    });
    (
        ChunkWriter {
            tx: Some(tx),
            shared: shared.clone(),
        },
        ChunkReader { rx, shared },
    )
}

/// The stream a stage exposes externally after `open()` (spec §3 Stage,
/// §4.1). `input` is present for stages with `input != none` (others
/// write into it); `output` is present for stages with `output != none`
/// (others read from it).
pub struct StageStream {
    pub input: Option<ChunkWriter>,
    pub output: Option<ChunkReader>,
}

impl StageStream {
    pub fn source(output: ChunkReader) -> Self {
        Self {
            input: None,
            output: Some(output),
        }
    }

    pub fn sink(input: ChunkWriter) -> Self {
        Self {
            input: Some(input),
            output: None,
        }
    }

    pub fn duplex(input: ChunkWriter, output: ChunkReader) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
        }
    }
}
