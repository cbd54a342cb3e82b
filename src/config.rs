// ============================================================================
// Persistence Unit Configuration
// ============================================================================

use crate::core::{PersistError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Describes one persistence unit: its name, concurrency mode and the raw
/// connection properties handed to the engine builder.
///
/// Descriptors are read-only to the coordination core. They are assembled once
/// at startup into a [`PersistenceConfig`] and passed by reference into the
/// wiring step.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDescriptor {
    /// Persistence unit name. Must be unique within a configuration.
    pub name: String,

    /// Whether sessions for this unit are reactive (non-blocking).
    #[serde(default)]
    pub reactive: bool,

    /// Marks this unit as the process-wide default. At most one descriptor in
    /// a configuration may carry this flag.
    #[serde(default)]
    pub default_unit: bool,

    /// Maximum number of pooled sessions the engine may open.
    #[serde(default = "defaults::max_pool_size")]
    pub max_pool_size: usize,

    /// Ceiling for establishing the underlying engine handle.
    #[serde(default = "defaults::connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Ceiling for a single reactive session-open await.
    #[serde(default = "defaults::session_open_timeout", with = "duration_millis")]
    pub session_open_timeout: Duration,

    /// Free-form engine properties (dialect, credentials, urls). The core
    /// never interprets these; they are forwarded to the engine builder.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

mod defaults {
    use std::time::Duration;

    pub fn max_pool_size() -> usize {
        10
    }

    pub fn connect_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn session_open_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl ConnectionDescriptor {
    /// Create a descriptor with default pool and timeout settings.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reactive: false,
            default_unit: false,
            max_pool_size: defaults::max_pool_size(),
            connect_timeout: defaults::connect_timeout(),
            session_open_timeout: defaults::session_open_timeout(),
            properties: HashMap::new(),
        }
    }

    /// Mark this unit as reactive.
    pub fn reactive(mut self, reactive: bool) -> Self {
        self.reactive = reactive;
        self
    }

    /// Mark this unit as the process-wide default.
    pub fn default_unit(mut self, default_unit: bool) -> Self {
        self.default_unit = default_unit;
        self
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    /// Set the engine handle construction timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reactive session-open timeout.
    pub fn session_open_timeout(mut self, timeout: Duration) -> Self {
        self.session_open_timeout = timeout;
        self
    }

    /// Add an engine property.
    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// The explicit, startup-assembled registry of persistence units.
///
/// Replaces any global mutable discovery state: build one of these, register
/// every descriptor, then hand it to the wiring step. Registration order is
/// preserved; the first descriptor becomes the default unit unless another one
/// is explicitly flagged.
#[derive(Debug, Default)]
pub struct PersistenceConfig {
    descriptors: Vec<ConnectionDescriptor>,
}

impl PersistenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistence unit descriptor.
    ///
    /// # Errors
    /// Fails with [`PersistError::Config`] when the name is empty, the name is
    /// already registered, or a second descriptor claims the default flag.
    /// These are wiring-time fatal errors, never retried.
    pub fn register(&mut self, descriptor: ConnectionDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(PersistError::Config(
                "Persistence unit name must be a non-empty string".into(),
            ));
        }
        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
            return Err(PersistError::Config(format!(
                "Duplicate persistence unit name '{}'",
                descriptor.name
            )));
        }
        if descriptor.default_unit && self.descriptors.iter().any(|d| d.default_unit) {
            return Err(PersistError::Config(format!(
                "Persistence unit '{}' cannot be marked default: another default unit is already registered",
                descriptor.name
            )));
        }
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Load a configuration from a JSON array of descriptors.
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptors: Vec<ConnectionDescriptor> = serde_json::from_str(json)
            .map_err(|e| PersistError::Config(format!("Invalid configuration JSON: {e}")))?;
        let mut config = Self::new();
        for descriptor in descriptors {
            config.register(descriptor)?;
        }
        Ok(config)
    }

    /// Look up a descriptor by unit name.
    pub fn get(&self, name: &str) -> Option<&ConnectionDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// The default unit: the one flagged as default, or the first registered.
    pub fn default_unit(&self) -> Option<&ConnectionDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.default_unit)
            .or_else(|| self.descriptors.first())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
