//! Dashboard block registry (SPEC_FULL §3): parses `-d
//! <type:id:name[,...]>` into a lookup the control plane exposes via
//! `GET /status`, so peers can label `DASHBOARD` events by id without
//! re-deriving the mapping client-side.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardBlock {
    pub block_type: String,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default, Clone)]
pub struct DashboardRegistry {
    blocks: HashMap<String, DashboardBlock>,
}

#[derive(Debug, Error)]
pub enum DashboardParseError {
    #[error("malformed dashboard block spec '{0}', expected type:id:name")]
    Malformed(String),
}

impl DashboardRegistry {
    /// Parse a comma-separated list of `type:id:name` entries.
    pub fn parse(spec: &str) -> Result<Self, DashboardParseError> {
        let mut registry = Self::default();
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(block_type), Some(id), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(DashboardParseError::Malformed(entry.to_string()));
            };
            registry.blocks.insert(
                id.to_string(),
                DashboardBlock {
                    block_type: block_type.to_string(),
                    id: id.to_string(),
                    name: name.to_string(),
                },
            );
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&DashboardBlock> {
        self.blocks.get(id)
    }

    /// Every registered block, in no particular order — the control plane
    /// hands this list to peers so they can label DASHBOARD events by id
    /// without maintaining their own `type:id:name` mapping.
    pub fn blocks(&self) -> impl Iterator<Item = &DashboardBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_blocks() {
        let registry = DashboardRegistry::parse("meter:vad1:VAD Level,text:sent1:Sentence").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("vad1"),
            Some(&DashboardBlock {
                block_type: "meter".into(),
                id: "vad1".into(),
                name: "VAD Level".into(),
            })
        );
    }

    #[test]
    fn malformed_entry_errors() {
        let err = DashboardRegistry::parse("meter:vad1").unwrap_err();
        assert!(matches!(err, DashboardParseError::Malformed(_)));
    }

    #[test]
    fn empty_spec_is_empty_registry() {
        let registry = DashboardRegistry::parse("").unwrap();
        assert!(registry.is_empty());
    }
}
