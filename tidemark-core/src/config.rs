//! Configuration types
//!
//! Loaded from TOML or built in code with the `with_*` builders. Every
//! config is validated before a region factory or store accepts it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default max-idle for pending puts (one minute).
pub const DEFAULT_PENDING_PUTS_MAX_IDLE_MS: u64 = 60_000;

/// Default row lock wait for the entity store.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;

/// Unit for an expiration magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn to_duration(self, magnitude: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(magnitude),
            TimeUnit::Seconds => Duration::from_secs(magnitude),
            TimeUnit::Minutes => Duration::from_secs(magnitude.saturating_mul(60)),
        }
    }
}

/// Max-idle expiration expressed as magnitude + unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpirationConfig {
    pub max_idle: u64,
    pub unit: TimeUnit,
}

impl ExpirationConfig {
    pub fn new(max_idle: u64, unit: TimeUnit) -> Self {
        Self { max_idle, unit }
    }

    pub fn millis(max_idle: u64) -> Self {
        Self::new(max_idle, TimeUnit::Milliseconds)
    }

    pub fn max_idle_duration(&self) -> Duration {
        self.unit.to_duration(self.max_idle)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_idle == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                value: "0".to_string(),
                reason: "max_idle must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self::millis(DEFAULT_PENDING_PUTS_MAX_IDLE_MS)
    }
}

/// What a region caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    #[default]
    Entity,
    Collection,
}

/// Configuration of one cache region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    pub name: String,
    #[serde(default)]
    pub kind: RegionKind,
    /// Entry max-idle; `None` keeps entries until evicted.
    #[serde(default)]
    pub entry_expiration: Option<ExpirationConfig>,
}

impl RegionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RegionKind::Entity,
            entry_expiration: None,
        }
    }

    /// Set the region kind.
    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the entry max-idle expiration.
    pub fn with_entry_expiration(mut self, expiration: ExpirationConfig) -> Self {
        self.entry_expiration = Some(expiration);
        self
    }

    pub fn entry_max_idle(&self) -> Option<Duration> {
        self.entry_expiration.map(|e| e.max_idle_duration())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "regions.name".to_string(),
                value: self.name.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(expiration) = &self.entry_expiration {
            expiration.validate("regions.entry_expiration.max_idle")?;
        }
        Ok(())
    }
}

/// Settings consumed by the region factory at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionFactoryConfig {
    #[serde(default)]
    pub pending_puts: ExpirationConfig,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

impl RegionFactoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending-puts expiration.
    pub fn with_pending_puts(mut self, expiration: ExpirationConfig) -> Self {
        self.pending_puts = expiration;
        self
    }

    /// Pre-declare a region.
    pub fn with_region(mut self, region: RegionConfig) -> Self {
        self.regions.push(region);
        self
    }

    pub fn pending_puts_max_idle(&self) -> Duration {
        self.pending_puts.max_idle_duration()
    }

    pub fn region(&self, name: &str) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pending_puts.validate("pending_puts.max_idle")?;
        for (i, region) in self.regions.iter().enumerate() {
            region.validate()?;
            if self.regions[..i].iter().any(|r| r.name == region.name) {
                return Err(ConfigError::InvalidValue {
                    field: "regions.name".to_string(),
                    value: region.name.clone(),
                    reason: "duplicate region".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Entity store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Set the row lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.lock_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TidemarkConfig {
    #[serde(default)]
    pub cache: RegionFactoryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl TidemarkConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: TidemarkConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.store.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_conversion() {
        assert_eq!(TimeUnit::Milliseconds.to_duration(250), Duration::from_millis(250));
        assert_eq!(TimeUnit::Seconds.to_duration(3), Duration::from_secs(3));
        assert_eq!(TimeUnit::Minutes.to_duration(2), Duration::from_secs(120));
    }

    #[test]
    fn test_region_factory_config_builder() {
        let config = RegionFactoryConfig::new()
            .with_pending_puts(ExpirationConfig::new(30, TimeUnit::Seconds))
            .with_region(
                RegionConfig::new("Item")
                    .with_kind(RegionKind::Entity)
                    .with_entry_expiration(ExpirationConfig::new(5, TimeUnit::Minutes)),
            );

        assert_eq!(config.pending_puts_max_idle(), Duration::from_secs(30));
        let region = config.region("Item").expect("region should be declared");
        assert_eq!(region.entry_max_idle(), Some(Duration::from_secs(300)));
        assert!(config.region("Other").is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = TidemarkConfig::default();
        assert_eq!(
            config.cache.pending_puts_max_idle(),
            Duration::from_millis(DEFAULT_PENDING_PUTS_MAX_IDLE_MS)
        );
        assert_eq!(config.store.lock_timeout(), Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str() {
        let config = TidemarkConfig::from_toml_str(
            r#"
            [cache.pending_puts]
            max_idle = 10
            unit = "seconds"

            [[cache.regions]]
            name = "Item"
            kind = "entity"

            [cache.regions.entry_expiration]
            max_idle = 500
            unit = "milliseconds"

            [store]
            lock_timeout_ms = 100
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.cache.pending_puts_max_idle(), Duration::from_secs(10));
        assert_eq!(
            config.cache.region("Item").and_then(|r| r.entry_max_idle()),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.store.lock_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_validation_rejects_zero_max_idle() {
        let config = RegionFactoryConfig::new().with_pending_puts(ExpirationConfig::millis(0));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validation_rejects_empty_and_duplicate_regions() {
        let empty = RegionFactoryConfig::new().with_region(RegionConfig::new("  "));
        assert!(empty.validate().is_err());

        let duplicate = RegionFactoryConfig::new()
            .with_region(RegionConfig::new("Item"))
            .with_region(RegionConfig::new("Item"));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_lock_timeout() {
        let err = TidemarkConfig::from_toml_str("[store]\nlock_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = TidemarkConfig::from_toml_str("[store]\nlock_timeout = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
