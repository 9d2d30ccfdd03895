pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

impl RelayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used so a local setup runs with flags only.
    ///
    /// Validation is left to the caller: CLI overrides are applied after
    /// loading and must be validated together with the file contents.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RelayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            RelayConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment overrides for deployment-specific settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_ENDPOINT_NAME") {
            self.endpoint_name = v;
        }

        // store
        if let Ok(v) = std::env::var("RELAY_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Ok(v) = std::env::var("RELAY_ETCD_ENDPOINTS") {
            self.store.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("RELAY_ETCD_KEY_PREFIX") {
            self.store.etcd.key_prefix = v;
        }
        if let Ok(v) = std::env::var("RELAY_ETCD_USERNAME") {
            self.store.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("RELAY_ETCD_PASSWORD") {
            self.store.etcd.password = Some(v);
        }

        // dedup
        if let Ok(v) = std::env::var("RELAY_DEDUP_BACKEND") {
            self.dedup.backend = v;
        }

        // gateway
        if let Ok(port) = std::env::var("PORT") {
            if !port.is_empty() {
                self.gateway.listen = format!("0.0.0.0:{}", port);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint_name.trim().is_empty() {
            anyhow::bail!("endpoint_name must be specified");
        }
        if self.endpoint_name.contains('/') {
            anyhow::bail!("endpoint_name '{}' must not contain '/'", self.endpoint_name);
        }

        match self.store.backend.as_str() {
            "memory" => {}
            "etcd" => {
                if self.store.etcd.endpoints.is_empty() {
                    anyhow::bail!("store backend 'etcd' requires at least one endpoint");
                }
            }
            other => anyhow::bail!("unknown store backend '{}', use memory or etcd", other),
        }

        match self.dedup.backend.as_str() {
            "memory" => {}
            "etcd" => {
                if self.store.backend != "etcd" {
                    anyhow::bail!("dedup backend 'etcd' requires store backend 'etcd'");
                }
            }
            other => anyhow::bail!("unknown dedup backend '{}', use memory or etcd", other),
        }
        if self.dedup.ttl_secs == 0 {
            anyhow::bail!("dedup ttl_secs must be greater than 0");
        }

        if seconds("gateway timeout_secs", self.gateway.timeout_secs)?.is_zero() {
            anyhow::bail!("gateway timeout_secs must be greater than 0");
        }

        let consumer = &self.consumer;
        if consumer.workers == 0 {
            anyhow::bail!("consumer workers must be greater than 0");
        }
        if seconds("consumer forward_timeout_secs", consumer.forward_timeout_secs)?.is_zero() {
            anyhow::bail!("consumer forward_timeout_secs must be greater than 0");
        }
        seconds("consumer expire_secs", consumer.expire_secs)?;
        if consumer.chunk_bytes == 0 || consumer.inline_body_bytes == 0 {
            anyhow::bail!("consumer chunk_bytes and inline_body_bytes must be greater than 0");
        }
        for t in &consumer.targets {
            if t.pattern.is_empty() {
                anyhow::bail!("target '{}' has an empty pattern", t.target);
            }
            crate::routing::parse_target(&t.target)
                .map_err(|e| anyhow::anyhow!("target for pattern '{}': {}", t.pattern, e))?;
        }
        Ok(())
    }

    /// The gateway and consumer roles run in separate processes, so they
    /// need a store both can reach. The memory store only serves the
    /// standalone role.
    pub fn validate_split_role(&self) -> Result<()> {
        if self.store.backend == "memory" {
            anyhow::bail!(
                "store backend 'memory' is private to one process, \
                 use the standalone role or store backend 'etcd'"
            );
        }
        Ok(())
    }

    /// Targets in declaration order, or the catch-all fallback when none are set.
    pub fn effective_targets(&self) -> Vec<TargetConfig> {
        if self.consumer.targets.is_empty() {
            vec![TargetConfig::fallback()]
        } else {
            self.consumer.targets.clone()
        }
    }

    /// Collection holding this endpoint's request records.
    pub fn requests_collection(&self) -> String {
        crate::record::requests_collection(&self.endpoint_name)
    }
}

/// Seconds from config as a `Duration`. Negative, NaN, infinite and
/// overflowing values are rejected.
fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("{} must be a finite, non-negative number, got {}: {}", name, value, e))
}

// The accessors below rely on `validate` having rejected bad values.
impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or_default()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl ConsumerConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.forward_timeout_secs).unwrap_or_default()
    }

    pub fn expire(&self) -> Duration {
        Duration::try_from_secs_f64(self.expire_secs).unwrap_or_default()
    }
}

/// Build the ordered target list from parallel `--pattern` / `--target` flags.
pub fn zip_targets(patterns: &[String], targets: &[String]) -> Result<Vec<TargetConfig>> {
    if patterns.len() != targets.len() {
        anyhow::bail!(
            "number of patterns and targets must be same, patterns={}, targets={}",
            patterns.len(),
            targets.len()
        );
    }
    Ok(patterns
        .iter()
        .zip(targets)
        .map(|(p, t)| TargetConfig::new(p.clone(), t.clone()))
        .collect())
}
