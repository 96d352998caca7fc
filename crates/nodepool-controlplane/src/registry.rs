//! Backend registry — maps a configured backend name to a constructor.
//!
//! Built once at startup and handed to whoever needs a control plane; no
//! process-global state.

use std::collections::BTreeMap;
use std::sync::Arc;

use nodepool_core::config::ControlPlaneConfig;
use tracing::info;

use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::{CommandControlPlane, ControlPlane, StaticControlPlane};

/// Builds a control plane from its configuration section.
pub type ControlPlaneFactory =
    Box<dyn Fn(&ControlPlaneConfig) -> ControlPlaneResult<Arc<dyn ControlPlane>> + Send + Sync>;

#[derive(Default)]
pub struct ControlPlaneRegistry {
    factories: BTreeMap<String, ControlPlaneFactory>,
}

impl ControlPlaneRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `static` and `command` backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("static", |config| {
            Ok(Arc::new(StaticControlPlane::from_config(config)?) as Arc<dyn ControlPlane>)
        });
        registry.register("command", |config| {
            Ok(Arc::new(CommandControlPlane::from_config(config)?) as Arc<dyn ControlPlane>)
        });
        registry
    }

    /// Register (or replace) a backend.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ControlPlaneConfig) -> ControlPlaneResult<Arc<dyn ControlPlane>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Construct the backend named by `config.backend`.
    pub fn build(&self, config: &ControlPlaneConfig) -> ControlPlaneResult<Arc<dyn ControlPlane>> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| ControlPlaneError::UnknownBackend(config.backend.clone()))?;
        let cp = factory(config)?;
        info!(backend = cp.name(), "control plane ready");
        Ok(cp)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
