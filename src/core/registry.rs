//! Stage type registry: name to constructor, first-loaded-wins on
//! duplicate registration (spec §4.3).
//!
//! Grounded on the teacher's `processors::factory` `OnceLock`-backed global
//! map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::core::stage::StageFactory;

pub struct Registry {
    factories: Mutex<HashMap<String, Arc<dyn StageFactory>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Register a stage type. If a type of the same name is already
    /// registered, the new one is dropped and a warning logged — the
    /// first loaded wins (spec §4.3).
    pub fn register(&self, factory: Arc<dyn StageFactory>) {
        let name = factory.type_name().to_string();
        let mut map = self.factories.lock().expect("registry mutex poisoned");
        if map.contains_key(&name) {
            tracing::warn!(stage_type = %name, "duplicate stage type registration ignored, keeping first loaded");
            return;
        }
        tracing::debug!(stage_type = %name, "registered stage type");
        map.insert(name, factory);
    }

    pub fn lookup(&self, type_name: &str) -> Option<Arc<dyn StageFactory>> {
        self.factories
            .lock()
            .expect("registry mutex poisoned")
            .get(type_name)
            .cloned()
    }

    /// All registered types, sorted by name (for the `-S` status table).
    pub fn list(&self) -> Vec<Arc<dyn StageFactory>> {
        let map = self.factories.lock().expect("registry mutex poisoned");
        let mut entries: Vec<_> = map.values().cloned().collect();
        entries.sort_by(|a, b| a.type_name().cmp(b.type_name()));
        entries
    }
}

/// The process-wide stage type registry.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::PayloadKind;
    use crate::core::params::ParamSchema;
    use crate::core::stage::Stage;
    use crate::error::Result;
    use serde_json::Value;
    use std::collections::HashMap as Map;

    struct NoopFactory(&'static str);

    struct NoopStage(String);

    #[async_trait::async_trait]
    impl Stage for NoopStage {
        fn id(&self) -> &str {
            &self.0
        }
        fn input_kind(&self) -> PayloadKind {
            PayloadKind::None
        }
        fn output_kind(&self) -> PayloadKind {
            PayloadKind::None
        }
        async fn open(&mut self, _ctx: crate::core::stage::StageContext) -> Result<crate::core::stream::StageStream> {
            Ok(crate::core::stream::StageStream {
                input: None,
                output: None,
            })
        }
        async fn run(&mut self) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl StageFactory for NoopFactory {
        fn type_name(&self) -> &'static str {
            self.0
        }
        fn input_kind(&self) -> PayloadKind {
            PayloadKind::None
        }
        fn output_kind(&self) -> PayloadKind {
            PayloadKind::None
        }
        fn param_schema(&self) -> ParamSchema {
            ParamSchema::default()
        }
        fn create(
            &self,
            id: String,
            _named: &Map<String, Value>,
            _positional: &[Value],
        ) -> Result<Box<dyn Stage>> {
            Ok(Box::new(NoopStage(id)))
        }
    }

    #[test]
    fn first_registration_wins_on_duplicate_name() {
        let registry = Registry::new();
        registry.register(Arc::new(NoopFactory("dup")));
        registry.register(Arc::new(NoopFactory("dup")));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn lookup_finds_registered_type() {
        let registry = Registry::new();
        registry.register(Arc::new(NoopFactory("echo")));
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let registry = Registry::new();
        registry.register(Arc::new(NoopFactory("zeta")));
        registry.register(Arc::new(NoopFactory("alpha")));
        let names: Vec<_> = registry.list().iter().map(|f| f.type_name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
