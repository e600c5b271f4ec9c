use serde::{Deserialize, Serialize};

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/authz/data
/// workers: 4
/// requeue-delay-secs: 10
/// resync-interval-secs: 300
/// log-level: info
/// log-format: json
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    /// Keep state in memory instead of SlateDB.
    #[serde(default, alias = "in-memory")]
    pub in_memory: Option<bool>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, alias = "requeue-delay-secs")]
    pub requeue_delay_secs: Option<u64>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "log-level")]
    pub log_level: Option<String>,
    /// `text` or `json`
    #[serde(default, alias = "log-format")]
    pub log_format: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
