//! Oracle plugin registry.
//!
//! One registry value is built at process start and handed by reference to
//! every call site; there is no global state and no import-time side effect.
//! Case configs select a plugin with `{"type"|"plugin": <id>, ...params}`;
//! an unknown id or malformed params is a configuration error at load time,
//! never a silent no-op at evaluation time.

use super::{
    artifact::FileArtifactOracle,
    composite::chooser_from_config,
    foreground::ForegroundAppOracle,
    notification::NotificationOracle,
    snapshot::{PackageSnapshotOracle, SettingsSnapshotOracle},
    Oracle,
};
use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type Factory = Box<dyn Fn(&Value) -> Result<Arc<dyn Oracle>, ConfigError> + Send + Sync>;

pub struct OracleRegistry {
    factories: BTreeMap<String, Factory>,
}

impl OracleRegistry {
    /// Empty registry, for callers that wire plugins themselves.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in oracle registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert_builtin("foreground_app", |params| {
            Ok(Arc::new(ForegroundAppOracle::from_params(params)?))
        });
        registry.insert_builtin("ui_token", |params| {
            Ok(Arc::new(super::ui_token::UiTokenOracle::from_params(
                params,
            )?))
        });
        registry.insert_builtin("chooser", |params| {
            Ok(Arc::new(chooser_from_config(params)?))
        });
        registry.insert_builtin("settings_snapshot", |params| {
            Ok(Arc::new(SettingsSnapshotOracle::from_params(params)?))
        });
        registry.insert_builtin("package_snapshot", |params| {
            Ok(Arc::new(PackageSnapshotOracle::from_params(params)?))
        });
        registry.insert_builtin("file_artifact", |params| {
            Ok(Arc::new(FileArtifactOracle::from_params(params)?))
        });
        registry.insert_builtin("notification", |params| {
            Ok(Arc::new(NotificationOracle::from_params(params)?))
        });
        registry
    }

    fn insert_builtin<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Oracle>, ConfigError> + Send + Sync + 'static,
    {
        let clash = self.factories.insert(id.to_string(), Box::new(factory));
        debug_assert!(clash.is_none(), "duplicate built-in oracle id {id}");
    }

    /// Register an external plugin. Duplicate ids are a wiring bug and fail.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&Value) -> Result<Arc<dyn Oracle>, ConfigError> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.factories.contains_key(&id) {
            return Err(ConfigError::DuplicatePluginId { id });
        }
        debug!(plugin = %id, "registered oracle plugin");
        self.factories.insert(id, Box::new(factory));
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate an oracle from one case-config entry.
    pub fn build(&self, config: &Value) -> Result<Arc<dyn Oracle>, ConfigError> {
        let missing_key = || ConfigError::MissingPluginKey {
            config: config.to_string(),
        };
        let object = config.as_object().ok_or_else(missing_key)?;
        let id = plugin_id(object).ok_or_else(missing_key)?;
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ConfigError::UnknownPluginId { id: id.to_string() })?;

        let mut params = object.clone();
        params.remove("type");
        params.remove("plugin");
        factory(&Value::Object(params))
    }

    /// Instantiate every oracle from a case's oracle list, in order.
    pub fn build_all(&self, configs: &[Value]) -> Result<Vec<Arc<dyn Oracle>>, ConfigError> {
        configs.iter().map(|config| self.build(config)).collect()
    }
}

impl Default for OracleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn plugin_id(object: &Map<String, Value>) -> Option<&str> {
    object
        .get("type")
        .or_else(|| object.get("plugin"))
        .and_then(Value::as_str)
}
