//! GraphRuntime: the five-pass construction and five-pass teardown that
//! turn a parsed pipeline description into a running, then cleanly
//! stopped, set of stages (spec §4.5).
//!
//! Construction: Materialize, Prune & Validate, Open, Pipe, Track.
//! Teardown: End-writable, Unpipe, Close, Disconnect, Destroy.
//!
//! Grounded on the teacher's `core::pipeline::PipelineManager`, generalised
//! from its ad hoc connect/wait calls into the ordered, timeout-bounded
//! passes spec §4.5 names.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::core::chunk::PayloadKind;
use crate::core::registry::Registry;
use crate::core::shutdown::{ShutdownHandle, ShutdownReason};
use crate::core::stage::{CommandSender, Stage, StageContext};
use crate::core::stream::{ChunkReader, ChunkWriter};
use crate::error::{Result, SpeechFlowError};

/// Bounded timeouts named in spec §4.5/§6.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITABLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One node in a parsed pipeline description (spec §4.5 pass 1
/// Materialize).
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub id: String,
    pub type_name: String,
    pub named: HashMap<String, Value>,
    pub positional: Vec<Value>,
}

/// A directed edge: `from`'s output feeds `to`'s input.
#[derive(Clone, Debug)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

/// A fully parsed pipeline description, ready for [`GraphRuntime::build`].
#[derive(Clone, Debug, Default)]
pub struct GraphSpec {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

struct OpenedStage {
    stage: Box<dyn Stage>,
    id: String,
    input_kind: PayloadKind,
    output_kind: PayloadKind,
    input: Option<ChunkWriter>,
    output: Option<ChunkReader>,
}

/// A graph that has been materialized, validated, opened and piped, and is
/// ready to run.
pub struct GraphRuntime {
    run_tasks: JoinSet<(String, Result<()>, Box<dyn Stage>)>,
    shutdown: ShutdownHandle,
    command_senders: HashMap<String, CommandSender>,
}

impl GraphRuntime {
    /// Run passes 1-4 (Materialize, Prune & Validate, Open, Pipe) and
    /// return a runtime ready to [`run`](Self::run).
    pub async fn build(spec: GraphSpec, registry: &Registry, shutdown: ShutdownHandle) -> Result<Self> {
        let stages = Self::materialize(&spec, registry)?;
        Self::prune_and_validate(&spec, &stages)?;
        let (mut opened, command_senders) = Self::open_all(&spec, stages, &shutdown).await?;
        Self::pipe(&spec, &mut opened);
        let run_tasks = Self::track(opened);
        Ok(Self {
            run_tasks,
            shutdown,
            command_senders,
        })
    }

    /// The per-stage command channels, keyed by stage id, for the control
    /// plane to route COMMANDs at (spec §4.7 "External COMMAND"). Cloned
    /// out before `run()` consumes the runtime.
    pub fn command_senders(&self) -> HashMap<String, CommandSender> {
        self.command_senders.clone()
    }

    /// Pass 1: construct each node's stage instance from its type's
    /// factory, binding declared parameters.
    fn materialize(spec: &GraphSpec, registry: &Registry) -> Result<HashMap<String, Box<dyn Stage>>> {
        let mut stages = HashMap::new();
        for node in &spec.nodes {
            if stages.contains_key(&node.id) {
                return Err(SpeechFlowError::Configuration(format!(
                    "duplicate stage id '{}'",
                    node.id
                )));
            }
            let factory = registry.lookup(&node.type_name).ok_or_else(|| {
                SpeechFlowError::Configuration(format!("unknown stage type '{}'", node.type_name))
            })?;
            let stage = factory.create(node.id.clone(), &node.named, &node.positional)?;
            stages.insert(node.id.clone(), stage);
        }
        Ok(stages)
    }

    /// Pass 2: validate every edge references real nodes with compatible,
    /// declared IO kinds, and that no stage is left with a declared side
    /// unconnected.
    fn prune_and_validate(
        spec: &GraphSpec,
        stages: &HashMap<String, Box<dyn Stage>>,
    ) -> Result<()> {
        let mut incoming: HashMap<&str, usize> = HashMap::new();
        let mut outgoing: HashMap<&str, usize> = HashMap::new();

        for edge in &spec.edges {
            let from = stages.get(edge.from.as_str()).ok_or_else(|| {
                SpeechFlowError::Configuration(format!("edge references unknown stage '{}'", edge.from))
            })?;
            let to = stages.get(edge.to.as_str()).ok_or_else(|| {
                SpeechFlowError::Configuration(format!("edge references unknown stage '{}'", edge.to))
            })?;
            if from.output_kind() == PayloadKind::None {
                return Err(SpeechFlowError::Configuration(format!(
                    "stage '{}' has no output to connect",
                    edge.from
                )));
            }
            if to.input_kind() == PayloadKind::None {
                return Err(SpeechFlowError::Configuration(format!(
                    "stage '{}' has no input to connect",
                    edge.to
                )));
            }
            if from.output_kind() != to.input_kind() {
                return Err(SpeechFlowError::Configuration(format!(
                    "type mismatch connecting '{}' ({}) to '{}' ({})",
                    edge.from,
                    from.output_kind(),
                    edge.to,
                    to.input_kind()
                )));
            }
            *outgoing.entry(edge.from.as_str()).or_insert(0) += 1;
            *incoming.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        for (id, count) in &incoming {
            if *count > 1 {
                return Err(SpeechFlowError::Configuration(format!(
                    "stage '{}' has {} incoming edges; fan-in is not supported",
                    id, count
                )));
            }
        }

        for node in &spec.nodes {
            let stage = &stages[&node.id];
            if stage.input_kind() != PayloadKind::None
                && incoming.get(node.id.as_str()).copied().unwrap_or(0) == 0
            {
                return Err(SpeechFlowError::Configuration(format!(
                    "stage '{}' declares an input but has no incoming edge",
                    node.id
                )));
            }
            if stage.output_kind() != PayloadKind::None
                && outgoing.get(node.id.as_str()).copied().unwrap_or(0) == 0
            {
                return Err(SpeechFlowError::Configuration(format!(
                    "stage '{}' declares an output but has no outgoing edge",
                    node.id
                )));
            }
        }

        Ok(())
    }

    /// Pass 3: open every stage within the bounded open timeout, handing
    /// each a freshly built [`StageContext`] and keeping the sender half
    /// of its command channel for the control plane.
    async fn open_all(
        spec: &GraphSpec,
        mut stages: HashMap<String, Box<dyn Stage>>,
        shutdown: &ShutdownHandle,
    ) -> Result<(Vec<OpenedStage>, HashMap<String, CommandSender>)> {
        let mut opened = Vec::with_capacity(spec.nodes.len());
        let mut command_senders = HashMap::with_capacity(spec.nodes.len());
        for node in &spec.nodes {
            let mut stage = stages.remove(&node.id).expect("materialized above");
            let input_kind = stage.input_kind();
            let output_kind = stage.output_kind();
            let (ctx, command_tx) = StageContext::new(node.id.clone(), shutdown.clone());
            command_senders.insert(node.id.clone(), command_tx);
            tracing::info!(stage = %node.id, "opening stage");
            let stream = tokio::time::timeout(OPEN_TIMEOUT, stage.open(ctx))
                .await
                .map_err(|_| SpeechFlowError::open(&node.id, "open timed out"))??;
            opened.push(OpenedStage {
                stage,
                id: node.id.clone(),
                input_kind,
                output_kind,
                input: stream.input,
                output: stream.output,
            });
        }
        Ok((opened, command_senders))
    }

    /// Pass 4: connect each stage's exposed output to every consumer's
    /// input. Fan-out (one producer, several consumers) is handled by a
    /// single forwarding task writing a clone of each chunk to every
    /// target. Fan-in is rejected in `prune_and_validate`, so every
    /// consumer's writer is taken exactly once here.
    fn pipe(spec: &GraphSpec, opened: &mut [OpenedStage]) {
        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, stage) in opened.iter().enumerate() {
            index.insert(stage.id.clone(), i);
        }

        let mut writers: HashMap<String, ChunkWriter> = HashMap::new();
        for edge in &spec.edges {
            let idx = index[&edge.to];
            let writer = opened[idx].input.take().expect("validated to have input");
            writers.insert(edge.to.clone(), writer);
        }

        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &spec.edges {
            outgoing.entry(edge.from.clone()).or_default().push(edge.to.clone());
        }

        for (from_id, targets) in outgoing {
            let idx = index[&from_id];
            let reader = opened[idx].output.take().expect("validated to have output");
            let targets: Vec<ChunkWriter> = targets
                .iter()
                .map(|to_id| writers.remove(to_id).expect("writer taken above"))
                .collect();
            spawn_forwarder(from_id, reader, targets);
        }
    }

    /// Pass 5 Track: spawn each stage's `run()` loop, tracked in a
    /// `JoinSet` so the runtime can wait for natural completion or react
    /// to a shutdown signal. The stage itself is handed back on
    /// completion so teardown can still call `close()` on it.
    fn track(opened: Vec<OpenedStage>) -> JoinSet<(String, Result<()>, Box<dyn Stage>)> {
        let mut run_tasks = JoinSet::new();
        for entry in opened {
            let OpenedStage {
                mut stage, id, ..
            } = entry;
            run_tasks.spawn(async move {
                let result = stage.run().await;
                (id, result, stage)
            });
        }
        run_tasks
    }

    /// Drive the graph until every stage's `run()` completes naturally or
    /// the shutdown latch trips, then perform the five teardown passes.
    pub async fn run(mut self) -> Result<ShutdownReason> {
        let mut finished = Vec::new();

        while !self.run_tasks.is_empty() {
            tokio::select! {
                next = self.run_tasks.join_next() => {
                    match next {
                        Some(Ok((id, Ok(()), stage))) => {
                            tracing::debug!(stage = %id, "stage run loop finished");
                            finished.push((id, stage));
                        }
                        Some(Ok((id, Err(err), stage))) => {
                            tracing::error!(stage = %id, error = %err, "stage faulted");
                            self.shutdown.trigger(ShutdownReason::Fault);
                            finished.push((id, stage));
                        }
                        Some(Err(join_err)) => {
                            tracing::error!(error = %join_err, "stage task panicked");
                            self.shutdown.trigger(ShutdownReason::Fault);
                        }
                        None => {}
                    }
                }
                _ = self.shutdown.triggered(), if !self.shutdown.is_triggered() => {}
            }
        }

        if !self.shutdown.is_triggered() {
            self.shutdown.trigger(ShutdownReason::Finished);
        }

        Self::teardown(finished).await;
        Ok(self.shutdown.reason().unwrap_or(ShutdownReason::Finished))
    }

    /// Teardown passes 3 (Close, bounded) and 5 (Destroy). Passes 1
    /// (End-writable), 2 (Unpipe) and 4 (Disconnect) fall out of the
    /// forwarding tasks spawned in `pipe` observing their reader end and
    /// dropping their handles as stages finish naturally or in response
    /// to the shutdown latch.
    async fn teardown(finished: Vec<(String, Box<dyn Stage>)>) {
        for (id, mut stage) in finished {
            tracing::info!(stage = %id, "closing stage");
            let result = tokio::time::timeout(CLOSE_TIMEOUT, stage.close()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(stage = %id, error = %err, "stage close reported an error"),
                Err(_) => tracing::warn!(stage = %id, "stage close timed out"),
            }
            // Destroy: `stage` drops here.
        }
    }
}

fn spawn_forwarder(from_id: String, mut reader: ChunkReader, mut writers: Vec<ChunkWriter>) {
    tokio::spawn(async move {
        loop {
            match reader.read().await {
                Ok(Some(chunk)) => {
                    for writer in &writers {
                        if let Err(fault) = writer.write(chunk.clone()).await {
                            tracing::warn!(stage = %from_id, %fault, "forwarder write failed");
                        }
                    }
                }
                Ok(None) => {
                    for writer in &mut writers {
                        writer.finish();
                    }
                    break;
                }
                Err(fault) => {
                    tracing::warn!(stage = %from_id, %fault, "forwarder read faulted");
                    for writer in &mut writers {
                        writer.fault(from_id.clone(), fault.to_string());
                    }
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_validation_rejects_unknown_stage() {
        let spec = GraphSpec {
            nodes: vec![],
            edges: vec![EdgeSpec {
                from: "a".into(),
                to: "b".into(),
            }],
        };
        let stages = HashMap::new();
        let err = GraphRuntime::prune_and_validate(&spec, &stages).unwrap_err();
        assert!(matches!(err, SpeechFlowError::Configuration(_)));
    }
}
