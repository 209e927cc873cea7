use std::{fs, path::Path};

use serde::Deserialize;

use crate::{ChatflowError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// flow engine config
    pub engine: EngineConfig,
    /// trigger processor config
    pub processor: ProcessorConfig,
    /// trigger scheduler config
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// number of compiled flows kept in memory, defaults to 256
    pub flow_cache_size: usize,
    /// upper bound for a single retry backoff in milliseconds, defaults to 30000
    pub max_retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// number of workers, one queue partition each, defaults to 8
    pub workers: usize,
    /// capacity of each partition, defaults to 1024
    pub queue_capacity: usize,
    /// what to do when a partition is full
    pub overflow: OverflowPolicy,
    /// fire every matching trigger instead of the top-ranked one
    pub fan_out: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    RejectNew,
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// sweep interval in milliseconds, defaults to 1000
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_cache_size: 256,
            max_retry_backoff_ms: 30_000,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            overflow: OverflowPolicy::RejectNew,
            fan_out: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| ChatflowError::Config(format!("failed to load config file {:?}: {}", path.as_ref(), e)))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str).map_err(|e| ChatflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.processor.workers == 0 {
            return Err(ChatflowError::Config("processor.workers must be at least 1".into()));
        }
        if self.processor.queue_capacity == 0 {
            return Err(ChatflowError::Config("processor.queue_capacity must be at least 1".into()));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ChatflowError::Config("scheduler.poll_interval_ms must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{Config, config::OverflowPolicy};

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
        [engine]
        flow_cache_size = 32

        [processor]
        workers = 2
        overflow = "drop_oldest"
        fan_out = true

        [scheduler]
        poll_interval_ms = 50
        "#;
        let config = Config::load_from_str(toml_str).unwrap();
        assert_eq!(config.engine.flow_cache_size, 32);
        assert_eq!(config.engine.max_retry_backoff_ms, 30_000);
        assert_eq!(config.processor.workers, 2);
        assert_eq!(config.processor.queue_capacity, 1024);
        assert_eq!(config.processor.overflow, OverflowPolicy::DropOldest);
        assert!(config.processor.fan_out);
        assert_eq!(config.scheduler.poll_interval_ms, 50);
    }

    #[test]
    fn test_config_defaults_and_rejects() {
        let config = Config::load_from_str("").unwrap();
        assert_eq!(config.processor.workers, 8);
        assert_eq!(config.processor.overflow, OverflowPolicy::RejectNew);

        assert!(Config::load_from_str("[processor]\nworkers = 0").is_err());
        assert!(Config::load_from_str("[processor]\noverflow = \"spill\"").is_err());
    }
}
