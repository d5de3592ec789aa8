//! Built-in stage types (spec §4.6): file-backed audio/text IO, VAD
//! segmentation, sentence splitting, word-aligned ASR folding, and
//! subtitle serialize/parse.

pub mod asr;
pub mod io;
pub mod sentence;
pub mod subtitle_parser;
pub mod subtitle_writer;
pub mod vad;

use std::sync::Arc;

use crate::core::chunk::PayloadKind;
use crate::core::registry::Registry;
use crate::core::stream::{channel, ChunkReader, ChunkWriter, StageStream};

/// Default object-mode channel capacity used by every built-in stage's
/// internal input/output pair (spec §4.1 contract 2).
pub const DEFAULT_CAPACITY: usize = 4;

/// Construct the externally-exposed [`StageStream`] for a stage with the
/// given IO shape, returning the internal reader/writer halves the
/// stage's own `run()` loop drives.
pub fn open_pair(
    input_kind: PayloadKind,
    output_kind: PayloadKind,
) -> (StageStream, Option<ChunkReader>, Option<ChunkWriter>) {
    let (ext_input, int_reader) = if input_kind != PayloadKind::None {
        let (w, r) = channel(DEFAULT_CAPACITY);
        (Some(w), Some(r))
    } else {
        (None, None)
    };
    let (int_writer, ext_output) = if output_kind != PayloadKind::None {
        let (w, r) = channel(DEFAULT_CAPACITY);
        (Some(w), Some(r))
    } else {
        (None, None)
    };
    (
        StageStream {
            input: ext_input,
            output: ext_output,
        },
        int_reader,
        int_writer,
    )
}

/// Register every built-in stage type with `registry` (first-loaded-wins,
/// spec §4.3) — called once at process start before a graph is built.
pub fn register_builtin_stages(registry: &Registry) {
    registry.register(Arc::new(io::TextSourceFactory));
    registry.register(Arc::new(io::TextSinkFactory));
    registry.register(Arc::new(io::AudioSourceFactory));
    registry.register(Arc::new(io::AudioSinkFactory));
    registry.register(Arc::new(vad::VadFactory));
    registry.register(Arc::new(sentence::SentenceSplitterFactory));
    registry.register(Arc::new(asr::AsrFactory));
    registry.register(Arc::new(subtitle_writer::SubtitleWriterFactory));
    registry.register(Arc::new(subtitle_parser::SubtitleParserFactory));
}
