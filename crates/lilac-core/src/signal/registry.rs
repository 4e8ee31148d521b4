//! Process-global signal registry: name → constructor (§4.5, §5 "Shared resources").

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LilacError, Result};
use crate::schema::SignalDescriptor;
use crate::signal::Signal;

type Constructor = Arc<dyn Fn(&SignalDescriptor) -> Result<Box<dyn Signal>> + Send + Sync>;

/// Maps a signal name to a constructor that builds a concrete [`Signal`]
/// from its parameters. Append-only for the process lifetime (§5).
#[derive(Clone, Default)]
pub struct SignalRegistry {
    constructors: HashMap<String, Constructor>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        SignalRegistry::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&SignalDescriptor) -> Result<Box<dyn Signal>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn construct(&self, descriptor: &SignalDescriptor) -> Result<Box<dyn Signal>> {
        let ctor = self.constructors.get(&descriptor.name).ok_or_else(|| {
            LilacError::invalid_query(format!("no signal registered with name `{}`", descriptor.name))
        })?;
        ctor(descriptor)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// A registry pre-populated with the built-in test fixtures (SPEC_FULL §12).
    pub fn with_builtins() -> Self {
        let mut registry = SignalRegistry::new();
        crate::signal::builtin::register_all(&mut registry);
        registry
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("registered", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field};
    use crate::signal::InputType;

    #[derive(Debug)]
    struct Noop;
    impl Signal for Noop {
        fn descriptor(&self) -> SignalDescriptor {
            SignalDescriptor::new("noop")
        }
        fn input_type(&self) -> InputType {
            InputType::Text
        }
        fn fields(&self) -> Field {
            Field::primitive(DataType::Int32)
        }
    }

    #[test]
    fn construct_invokes_registered_constructor() {
        let mut registry = SignalRegistry::new();
        registry.register("noop", |_| Ok(Box::new(Noop)));
        let signal = registry.construct(&SignalDescriptor::new("noop")).unwrap();
        assert_eq!(signal.descriptor().name, "noop");
    }

    #[test]
    fn construct_unknown_name_is_invalid_query() {
        let registry = SignalRegistry::new();
        let err = registry.construct(&SignalDescriptor::new("missing")).unwrap_err();
        assert!(matches!(err, LilacError::InvalidQuery { .. }));
    }

    #[test]
    fn with_builtins_registers_the_fixture_set() {
        let registry = SignalRegistry::with_builtins();
        for name in [
            "text_statistics",
            "test_sparse",
            "test_splitter",
            "test_embedding",
            "test_embedding_sum",
            "test_semantic",
            "substring_search",
        ] {
            assert!(registry.is_registered(name), "missing builtin: {name}");
        }
    }
}
