// ============================================================================
// Persistence Module Wiring
// ============================================================================

use crate::config::{ConnectionDescriptor, PersistenceConfig};
use crate::core::{PersistError, Result};
use crate::session::{EngineBuilder, SessionFactoryProvider};
use crate::txn::TransactionInterceptor;
use crate::work::UnitOfWork;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One wired persistence unit: its descriptor, factory provider and unit of
/// work.
pub struct PersistenceUnit {
    descriptor: ConnectionDescriptor,
    provider: Arc<SessionFactoryProvider>,
    work: Arc<UnitOfWork>,
}

impl PersistenceUnit {
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn provider(&self) -> &Arc<SessionFactoryProvider> {
        &self.provider
    }

    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.work
    }
}

/// Assembles providers and units of work for every configured persistence
/// unit and manages their overall start/stop lifecycle.
///
/// Built once at startup from an explicit [`PersistenceConfig`]; no global
/// discovery state is consulted.
pub struct PersistenceModule {
    units: HashMap<String, PersistenceUnit>,
    order: Vec<String>,
    default_unit: String,
}

impl PersistenceModule {
    /// Wire every descriptor in `config` against the given engine builder.
    ///
    /// # Errors
    /// Fails with [`PersistError::Config`] when the configuration is empty.
    /// Descriptor-level violations (duplicate names, duplicate default) were
    /// already rejected when the configuration was assembled.
    pub fn build(config: PersistenceConfig, builder: Arc<dyn EngineBuilder>) -> Result<Self> {
        let default_unit = config
            .default_unit()
            .map(|d| d.name.clone())
            .ok_or_else(|| {
                PersistError::Config("At least one persistence unit must be configured".into())
            })?;

        let mut units = HashMap::new();
        let mut order = Vec::new();
        for descriptor in config.iter() {
            let provider = Arc::new(SessionFactoryProvider::new(
                descriptor.clone(),
                Arc::clone(&builder),
            ));
            let work = Arc::new(UnitOfWork::new(Arc::clone(&provider)));
            order.push(descriptor.name.clone());
            units.insert(
                descriptor.name.clone(),
                PersistenceUnit {
                    descriptor: descriptor.clone(),
                    provider,
                    work,
                },
            );
        }

        info!(units = units.len(), default = %default_unit, "persistence module wired");
        Ok(Self {
            units,
            order,
            default_unit,
        })
    }

    /// Start every unit's session factory provider. Idempotent per provider;
    /// the first failure aborts and is surfaced to the caller.
    pub fn start_all(&self) -> Result<()> {
        for name in &self.order {
            self.units[name].provider.start()?;
        }
        info!("persistence services started");
        Ok(())
    }

    /// Stop every unit's provider. Idempotent; teardown failures are logged
    /// by the providers and never interrupt the remaining shutdowns.
    pub fn stop_all(&self) {
        for name in &self.order {
            self.units[name].provider.stop();
        }
        info!("persistence services stopped");
    }

    /// Look up a wired unit by persistence-unit name.
    pub fn unit(&self, name: &str) -> Result<&PersistenceUnit> {
        self.units.get(name).ok_or_else(|| {
            PersistError::Config(format!("Unknown persistence unit '{name}'"))
        })
    }

    /// The default persistence unit.
    pub fn default_unit(&self) -> &PersistenceUnit {
        &self.units[&self.default_unit]
    }

    pub fn default_unit_name(&self) -> &str {
        &self.default_unit
    }

    /// Build a transaction interceptor covering every wired unit.
    pub fn interceptor(&self) -> TransactionInterceptor {
        let mut interceptor = TransactionInterceptor::new(&self.default_unit);
        for unit in self.units.values() {
            interceptor.register(Arc::clone(&unit.work));
        }
        interceptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryEngineBuilder;

    fn two_unit_config() -> PersistenceConfig {
        let mut config = PersistenceConfig::new();
        config
            .register(ConnectionDescriptor::new("primary").default_unit(true))
            .unwrap();
        config
            .register(ConnectionDescriptor::new("events").reactive(true))
            .unwrap();
        config
    }

    #[test]
    fn test_build_wires_every_unit() {
        let module =
            PersistenceModule::build(two_unit_config(), Arc::new(MemoryEngineBuilder)).unwrap();

        assert_eq!(module.default_unit_name(), "primary");
        assert!(module.unit("primary").is_ok());
        assert!(module.unit("events").unwrap().descriptor().reactive);
        assert!(matches!(
            module.unit("missing"),
            Err(PersistError::Config(_))
        ));
    }

    #[test]
    fn test_empty_config_rejected() {
        let result =
            PersistenceModule::build(PersistenceConfig::new(), Arc::new(MemoryEngineBuilder));
        assert!(matches!(result, Err(PersistError::Config(_))));
    }

    #[test]
    fn test_lifecycle_start_stop() {
        let module =
            PersistenceModule::build(two_unit_config(), Arc::new(MemoryEngineBuilder)).unwrap();

        module.start_all().unwrap();
        assert!(module.unit("primary").unwrap().provider().is_started());
        assert!(module.unit("events").unwrap().provider().is_started());

        // Idempotent restart.
        module.start_all().unwrap();

        module.stop_all();
        assert!(!module.unit("primary").unwrap().provider().is_started());
        module.stop_all();
    }
}
