//! SpeechFlow: a typed dataflow runtime for composing speech-processing
//! pipeline stages from a declarative expression into a running graph.
//!
//! The core (`core`) is the chunk model, the backpressured stream
//! primitive, the stage/registry abstractions, and the five-pass graph
//! runtime. `dsl` parses pipeline expressions into a [`core::runtime::GraphSpec`].
//! `config` and `control` are the ambient CLI/logging/dashboard surface
//! and the external control plane. `stages` holds the built-in stage
//! types.

pub mod config;
pub mod control;
pub mod core;
pub mod dsl;
pub mod error;
pub mod stages;

pub use error::{Result, SpeechFlowError};
