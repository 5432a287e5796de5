//! Configuration types for MTDS components

use crate::{MtdsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// In-memory host backend, created whenever `local_cpu` is set
pub const LOCAL_CPU_BACKEND: &str = "LocalCPUBackend";
/// Plain host filesystem backend
pub const LOCAL_DISK_BACKEND: &str = "LocalDiskBackend";
/// Direct-storage backend on a local device
pub const GDS_BACKEND: &str = "GdsBackend";
/// Direct-storage backend on a network filesystem mount
pub const WEKA_GDS_BACKEND: &str = "WekaGdsBackend";

/// Every backend name the registry knows how to build
pub const SUPPORTED_BACKENDS: [&str; 4] = [
    LOCAL_CPU_BACKEND,
    LOCAL_DISK_BACKEND,
    GDS_BACKEND,
    WEKA_GDS_BACKEND,
];

const ENV_PREFIX: &str = "MTDS_";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tokens per cache chunk
    pub chunk_size: usize,
    /// Keep a hot copy of chunks in host memory
    pub local_cpu: bool,
    /// Host memory budget in GiB
    pub max_local_cpu_size: f64,
    /// Explicit backend names; inferred from the path fields when empty
    pub storage_backends: Vec<String>,
    /// Root directory of the local disk backend
    pub local_disk: Option<String>,
    /// Local disk budget in GiB
    pub max_local_disk_size: f64,
    /// Root directory of the direct-storage backend
    pub gds_path: Option<String>,
    /// Mount path of the network filesystem backend
    pub weka_path: Option<String>,
    /// Size of pre-registered transfer buffers in MiB
    pub cufile_buffer_size: Option<usize>,
    /// Free-form settings passed through to integrations
    pub extra_config: Option<HashMap<String, String>>,
    /// Start a control-plane worker
    pub enable_controller: bool,
    /// Controller pull endpoint, `host:port`
    pub controller_url: Option<String>,
    pub instance_id: String,
    /// Base port; worker `i` binds `worker_port + i`
    pub worker_port: Option<u16>,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            local_cpu: true,
            max_local_cpu_size: 5.0,
            storage_backends: Vec::new(),
            local_disk: None,
            max_local_disk_size: 0.0,
            gds_path: None,
            weka_path: None,
            cufile_buffer_size: None,
            extra_config: None,
            enable_controller: false,
            controller_url: None,
            instance_id: "mtds_default_instance".to_string(),
            worker_port: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `MTDS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `from_env` delegates here; tests pass a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(v) = var("CHUNK_SIZE") {
            config.chunk_size = parse_env("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("LOCAL_CPU") {
            config.local_cpu = parse_bool("LOCAL_CPU", &v)?;
        }
        if let Some(v) = var("MAX_LOCAL_CPU_SIZE") {
            config.max_local_cpu_size = parse_env("MAX_LOCAL_CPU_SIZE", &v)?;
        }
        if let Some(v) = var("STORAGE_BACKENDS") {
            config.storage_backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("LOCAL_DISK") {
            config.local_disk = Some(v);
        }
        if let Some(v) = var("MAX_LOCAL_DISK_SIZE") {
            config.max_local_disk_size = parse_env("MAX_LOCAL_DISK_SIZE", &v)?;
        }
        if let Some(v) = var("GDS_PATH") {
            config.gds_path = Some(v);
        }
        if let Some(v) = var("WEKA_PATH") {
            config.weka_path = Some(v);
        }
        if let Some(v) = var("CUFILE_BUFFER_SIZE") {
            config.cufile_buffer_size = Some(parse_env("CUFILE_BUFFER_SIZE", &v)?);
        }
        if let Some(v) = var("EXTRA_CONFIG") {
            let extra: HashMap<String, String> = serde_json::from_str(&v)
                .map_err(|e| MtdsError::config(format!("Invalid MTDS_EXTRA_CONFIG: {}", e)))?;
            config.extra_config = Some(extra);
        }
        if let Some(v) = var("ENABLE_CONTROLLER") {
            config.enable_controller = parse_bool("ENABLE_CONTROLLER", &v)?;
        }
        if let Some(v) = var("CONTROLLER_URL") {
            config.controller_url = Some(v);
        }
        if let Some(v) = var("INSTANCE_ID") {
            config.instance_id = v;
        }
        if let Some(v) = var("WORKER_PORT") {
            config.worker_port = Some(parse_env("WORKER_PORT", &v)?);
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.logging.level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML or TOML file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MtdsError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => {
                return Err(MtdsError::config(format!(
                    "Unsupported config file extension: {}",
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Names of the backends to construct, local CPU first
    pub fn backend_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.local_cpu {
            names.push(LOCAL_CPU_BACKEND.to_string());
        }

        if self.storage_backends.is_empty() {
            if self.local_disk.is_some() {
                names.push(LOCAL_DISK_BACKEND.to_string());
            }
            if self.gds_path.is_some() {
                names.push(GDS_BACKEND.to_string());
            }
            if self.weka_path.is_some() {
                names.push(WEKA_GDS_BACKEND.to_string());
            }
        } else {
            for name in &self.storage_backends {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Whether any configured backend moves data through registered buffers
    pub fn uses_cufile(&self) -> bool {
        self.backend_names()
            .iter()
            .any(|n| n == GDS_BACKEND || n == WEKA_GDS_BACKEND)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MtdsError::config("chunk_size must be greater than 0"));
        }
        if self.local_cpu && self.max_local_cpu_size <= 0.0 {
            return Err(MtdsError::config(
                "max_local_cpu_size must be positive when local_cpu is enabled",
            ));
        }

        for name in self.backend_names() {
            match name.as_str() {
                LOCAL_CPU_BACKEND => {}
                LOCAL_DISK_BACKEND => {
                    if self.local_disk.is_none() {
                        return Err(MtdsError::config("LocalDiskBackend requires local_disk"));
                    }
                    if self.max_local_disk_size <= 0.0 {
                        return Err(MtdsError::config(
                            "LocalDiskBackend requires a positive max_local_disk_size",
                        ));
                    }
                }
                GDS_BACKEND => {
                    if self.gds_path.is_none() {
                        return Err(MtdsError::config("GdsBackend requires gds_path"));
                    }
                }
                WEKA_GDS_BACKEND => {
                    if self.weka_path.is_none() {
                        return Err(MtdsError::config("WekaGdsBackend requires weka_path"));
                    }
                }
                other => {
                    return Err(MtdsError::config(format!(
                        "Unsupported storage backend: {} (supported: {})",
                        other,
                        SUPPORTED_BACKENDS.join(", ")
                    )))
                }
            }
        }

        if self.uses_cufile() && self.cufile_buffer_size.unwrap_or(0) == 0 {
            return Err(MtdsError::config(
                "cufile_buffer_size must be set for direct-storage backends",
            ));
        }

        if self.enable_controller {
            if self.controller_url.is_none() {
                return Err(MtdsError::config(
                    "controller_url is required when enable_controller is set",
                ));
            }
            if self.worker_port.is_none() {
                return Err(MtdsError::config(
                    "worker_port is required when enable_controller is set",
                ));
            }
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(MtdsError::config(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MtdsError::config(format!("Invalid value for {}{}: {}", ENV_PREFIX, name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(MtdsError::config(format!(
            "Invalid boolean for {}{}: {}",
            ENV_PREFIX, name, value
        ))),
    }
}
