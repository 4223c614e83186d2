//! Region factory: owns the shared clock and the lifecycle of every region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tidemark_core::{
    CacheError, CoherenceResult, RegionConfig, RegionFactoryConfig, StorageError, TimeSource,
};
use tracing::info;

use super::region::InMemoryRegion;

/// Builds and tracks cache regions.
///
/// A region is built once per name; later calls return the same instance.
/// Regions inherit the factory's pending-puts max-idle and time source.
#[derive(Debug)]
pub struct RegionFactory {
    config: RegionFactoryConfig,
    time_source: Arc<dyn TimeSource>,
    regions: RwLock<HashMap<String, Arc<InMemoryRegion>>>,
    stopped: AtomicBool,
}

impl RegionFactory {
    /// Validate `config` and start a factory.
    pub fn start(
        config: RegionFactoryConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> CoherenceResult<Self> {
        config.validate()?;
        info!(
            pending_puts_max_idle_ms = config.pending_puts_max_idle().as_millis() as u64,
            declared_regions = config.regions.len(),
            "Region factory started"
        );
        Ok(Self {
            config,
            time_source,
            regions: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn pending_puts_max_idle(&self) -> Duration {
        self.config.pending_puts_max_idle()
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        self.time_source.clone()
    }

    pub fn config(&self) -> &RegionFactoryConfig {
        &self.config
    }

    /// Build (or return the existing) region named `name`.
    ///
    /// Undeclared names get a default entity region.
    pub fn build_region(&self, name: &str) -> CoherenceResult<Arc<InMemoryRegion>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CacheError::RegionStopped {
                region: name.to_string(),
            }
            .into());
        }

        let mut regions = self
            .regions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if let Some(region) = regions.get(name) {
            return Ok(region.clone());
        }

        let region_config = self
            .config
            .region(name)
            .cloned()
            .unwrap_or_else(|| RegionConfig::new(name));
        region_config.validate()?;

        let region = Arc::new(InMemoryRegion::new(
            &region_config,
            self.pending_puts_max_idle(),
            self.time_source.clone(),
        ));
        regions.insert(name.to_string(), region.clone());
        info!(region = name, kind = ?region_config.kind, "Region built");
        Ok(region)
    }

    /// Already-built region, if any.
    pub fn region(&self, name: &str) -> Option<Arc<InMemoryRegion>> {
        self.regions
            .read()
            .ok()
            .and_then(|regions| regions.get(name).cloned())
    }

    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .regions
            .read()
            .map(|regions| regions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stop every region. Idempotent.
    pub fn stop(&self) -> CoherenceResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let regions: Vec<Arc<InMemoryRegion>> = self
            .regions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .drain()
            .map(|(_, region)| region)
            .collect();
        for region in &regions {
            region.stop()?;
        }
        info!(stopped_regions = regions.len(), "Region factory stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
