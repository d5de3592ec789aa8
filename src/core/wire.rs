//! CBOR envelope for a [`Chunk`] crossing a process boundary (control-plane
//! replay buffers, cache persistence). `encode`/`decode` must roundtrip
//! exactly: `decode(encode(c)) == c` for every chunk whose payload is
//! representable, audio bytes preserved bit-exact and text preserved as
//! UTF-8.

use crate::core::chunk::Chunk;
use crate::error::{Result, SpeechFlowError};

pub fn encode(chunk: &Chunk) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(chunk, &mut buf)
        .map_err(|e| SpeechFlowError::External(format!("CBOR encode failed: {e}")))?;
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Chunk> {
    ciborium::from_reader(bytes)
        .map_err(|e| SpeechFlowError::External(format!("CBOR decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::{ChunkKind, Payload};

    #[test]
    fn roundtrips_audio_payload_bit_exact() {
        let chunk = Chunk::new(
            10,
            20,
            ChunkKind::Final,
            Payload::Audio(vec![0, 1, 2, 255, 128]),
        );
        let bytes = encode(&chunk).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(chunk, back);
    }

    #[test]
    fn roundtrips_text_payload_as_utf8() {
        let mut chunk = Chunk::new(0, 5, ChunkKind::Intermediate, Payload::Text("héllo".into()));
        chunk.meta.insert("lang".into(), serde_json::json!("en"));
        let bytes = encode(&chunk).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(chunk, back);
        assert_eq!(back.payload.as_text(), Some("héllo"));
    }

    #[test]
    fn decode_of_garbage_bytes_fails() {
        assert!(decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
