//! Core dataflow primitives: the Chunk model, the ChunkStream pipe, the
//! utility queues stages build on, the Stage/Registry abstractions, and
//! the GraphRuntime that wires and drives them.

pub mod chunk;
pub mod params;
pub mod queues;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod stage;
pub mod stream;
pub mod wire;

pub use chunk::{Chunk, ChunkKind, Meta, Payload, PayloadKind, TimeOffsetMs};
pub use registry::Registry;
pub use shutdown::{ShutdownHandle, ShutdownReason};
pub use stage::{Stage, StageContext, StageFactory};
pub use stream::{ChunkReader, ChunkWriter, StageStream, StreamFault};
