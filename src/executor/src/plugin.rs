// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Explicit executor registration.
//!
//! Executors are wired up by name at flow construction time: the launcher
//! registers every factory it links, and `--uses <name>` resolves against
//! this registry. There is no import-time auto-registration.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flow_repr::{Error, ErrorKind};

use crate::{Executor, ExecutorConfig};

/// A factory producing an executor instance from its construction config.
pub type ExecutorFactory =
    Arc<dyn Fn(ExecutorConfig) -> Result<Arc<dyn Executor>, Error> + Send + Sync>;

/// Name → factory. Populated at process start, then read-only.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: Arc<RwLock<BTreeMap<String, ExecutorFactory>>>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(ExecutorConfig) -> Result<Arc<dyn Executor>, Error> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the executor registered under `name`.
    pub fn build(
        &self,
        name: &str,
        config: ExecutorConfig,
    ) -> Result<Arc<dyn Executor>, Error> {
        let factory = self.factories.read().get(name).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                "launcher",
                format!("no executor registered under {name}"),
            )
        })?;
        factory(config)
    }

    /// The registered executor names, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::IdentityExecutor;

    use super::*;

    #[test]
    fn register_and_build() {
        let registry = PluginRegistry::new();
        registry.register("identity", |_config| Ok(Arc::new(IdentityExecutor)));
        let exec = registry.build("identity", ExecutorConfig::default()).unwrap();
        assert!(!exec.endpoints().is_empty());
        assert!(registry.build("missing", ExecutorConfig::default()).is_err());
    }
}
