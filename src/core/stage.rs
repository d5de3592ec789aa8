//! The Stage abstraction (spec §3, §4.4): a named unit of work with a
//! declared IO shape, a parameter schema, and a five-phase lifecycle driven
//! by the [`crate::core::runtime::GraphRuntime`].
//!
//! Grounded on the teacher's `processors::processor::Processor` trait and
//! `config::traits::ProcessorConfig`, generalised from the teacher's single
//! `process(&mut ProcessingContext)` call into the construct/open/run/close
//! lifecycle the runtime's five passes require.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::core::chunk::PayloadKind;
use crate::core::params::ParamSchema;
use crate::core::shutdown::ShutdownHandle;
use crate::core::stream::StageStream;
use crate::error::{Result, SpeechFlowError};

/// A COMMAND routed to a specific stage (spec §4.7, §6): an action name,
/// its JSON arguments, and a one-shot reply slot the control plane awaits
/// (bounded by `CONTROL_REQUEST_TIMEOUT`).
pub struct ControlCommand {
    pub action: String,
    pub args: Value,
    pub reply: oneshot::Sender<Value>,
}

pub type CommandSender = mpsc::UnboundedSender<ControlCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<ControlCommand>;

/// What a stage's `open`/`run` get from the runtime: its own id (for
/// logging and fault attribution), the shared shutdown latch a Source
/// stage's run loop should race against while waiting on its own input
/// (file, microphone, socket) so a signal can cut it short (spec §4.5
/// teardown pass 1 "End-writable"), and the receiving half of its
/// per-stage command channel. A stage that wants to react to external
/// COMMANDs stores `ctx.commands` in `open` and selects on it in `run`,
/// the same way it already selects on `shutdown.triggered()`; a stage
/// that ignores it simply drops the receiver.
pub struct StageContext {
    pub id: String,
    pub shutdown: ShutdownHandle,
    pub commands: CommandReceiver,
}

impl StageContext {
    /// Build a context together with the sender half of its command
    /// channel, which the runtime keeps to route COMMANDs addressed at
    /// this stage id.
    pub fn new(id: impl Into<String>, shutdown: ShutdownHandle) -> (Self, CommandSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                shutdown,
                commands: rx,
            },
            tx,
        )
    }
}

/// A constructed, not-yet-opened stage instance.
#[async_trait]
pub trait Stage: Send {
    fn id(&self) -> &str;

    /// The declared kind of this stage's writable side, or `None` if it
    /// has none (a pure Source).
    fn input_kind(&self) -> PayloadKind;

    /// The declared kind of this stage's readable side, or `None` if it
    /// has none (a pure Sink).
    fn output_kind(&self) -> PayloadKind;

    /// Pass 3 (Open, spec §4.5): acquire resources and hand back the
    /// stream the runtime will pipe to/from this stage's neighbours.
    async fn open(&mut self, ctx: StageContext) -> Result<StageStream>;

    /// The stage's processing loop. Spawned by the runtime once piping
    /// (pass 4) is complete; returns once this stage's own work is done.
    async fn run(&mut self) -> Result<()>;

    /// Pass 5 Close (spec §4.5): release resources acquired in `open`,
    /// within the bounded close timeout.
    async fn close(&mut self) -> Result<()>;
}

/// A registered stage type: knows its IO shape and parameter schema, and
/// can construct instances bound against a parameter map (spec §4.3).
pub trait StageFactory: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn input_kind(&self) -> PayloadKind;
    fn output_kind(&self) -> PayloadKind;
    fn param_schema(&self) -> ParamSchema;

    /// Bind `named`/`positional` against this type's schema and construct
    /// a stage instance (spec §4.5 pass 1 Materialize).
    fn create(
        &self,
        id: String,
        named: &HashMap<String, Value>,
        positional: &[Value],
    ) -> Result<Box<dyn Stage>>;
}

/// Shared helper: bind a factory's schema and surface schema errors as
/// `SpeechFlowError::Configuration`, tagged with the stage id for
/// diagnostics.
pub fn bind_params(
    id: &str,
    schema: &ParamSchema,
    named: &HashMap<String, Value>,
    positional: &[Value],
) -> Result<HashMap<String, Value>> {
    schema
        .bind(named, positional)
        .map_err(|e| SpeechFlowError::Configuration(format!("stage '{id}': {e}")))
}
