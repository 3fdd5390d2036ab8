use clap::Parser;
use lib_collector::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "server_collector.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "GNSS station collector", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "COLLECTOR_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ORM_SERVICE_HOST", help = "Base URL of the upstream station registry.")]
    pub registry_url: Option<String>,

    #[clap(long, env = "ORM_SERVICE_TOKEN", help = "Bearer token for the upstream registry.")]
    pub registry_token: Option<String>,

    #[clap(long, env = "SERVER_NAME", help = "Name this collector reports itself as.")]
    pub server_name: Option<String>,

    #[clap(long, env = "COLLECTOR_PROCESSES", help = "Number of collection process groups.")]
    pub processes: Option<usize>,

    #[clap(
        long,
        env = "COLLECTOR_EST_BY_PROC",
        help = "Worker slots (stations) per process group."
    )]
    pub slots_per_process: Option<usize>,

    #[clap(
        long,
        env = "COLLECTOR_DB_SLOTS",
        help = "Logical storage slots of the persistence pipeline."
    )]
    pub persistence_slots: Option<usize>,

    #[clap(long, env = "COLLECTOR_STORAGE", help = "Storage backend (memory, postgres).")]
    pub storage_backend: Option<String>,

    #[clap(long, env = "COLLECTOR_READ_TIMEOUT", help = "Seconds to wait for one station record.")]
    pub read_timeout_seconds: Option<u64>,

    #[clap(long, env = "COLLECTOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "COLLECTOR_LOG_LEVEL", help = "Logging level (debug, info, warn, error).")]
    pub log_level: Option<String>,

    /// Full engine tuning, only settable from the config file.
    #[clap(skip)]
    pub engine: Option<EngineConfig>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            registry_url: other.registry_url.or(self.registry_url),
            registry_token: other.registry_token.or(self.registry_token),
            server_name: other.server_name.or(self.server_name),
            processes: other.processes.or(self.processes),
            slots_per_process: other.slots_per_process.or(self.slots_per_process),
            persistence_slots: other.persistence_slots.or(self.persistence_slots),
            storage_backend: other.storage_backend.or(self.storage_backend),
            read_timeout_seconds: other.read_timeout_seconds.or(self.read_timeout_seconds),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            engine: other.engine.or(self.engine),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Engine configuration: the file's `engine` section with the flat options on top.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone().unwrap_or_default();
        if let Some(url) = &self.registry_url {
            engine.registry_url = url.clone();
        }
        if self.registry_token.is_some() {
            engine.registry_token = self.registry_token.clone();
        }
        if let Some(name) = &self.server_name {
            engine.server_name = name.clone();
        }
        if let Some(processes) = self.processes {
            engine.processes = processes;
        }
        if let Some(slots) = self.slots_per_process {
            engine.slots_per_process = slots;
        }
        if let Some(slots) = self.persistence_slots {
            engine.persistence_slots = slots;
        }
        if let Some(backend) = &self.storage_backend {
            engine.storage_backend = backend.to_uppercase();
        }
        if let Some(seconds) = self.read_timeout_seconds {
            engine.read_timeout_seconds = seconds;
        }
        engine
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    }
}

/// Config file to read: the explicit path, else `./server_collector.conf`,
/// else the copy in the user's config directory.
fn config_file(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("collector").join(CONFIG_FILE))
        .filter(|path| path.exists())
        .unwrap_or(local)
}

/// Layers defaults, the config file and `cli` (which already carries env values).
pub fn resolve(cli: Config) -> Config {
    let config_file_path = config_file(cli.config_path.as_deref());
    let mut current_config = defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(err) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    err
                ),
            },
            Err(err) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                err
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn cli_overrides_file_and_file_overrides_defaults() {
        let file = file_with(
            r#"{
                "registryUrl": "http://registry:8000/",
                "processes": 2,
                "logLevel": "debug",
                "engine": { "save_timeout_seconds": 30, "slots_per_process": 8 }
            }"#,
        );
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            processes: Some(3),
            ..Default::default()
        };

        let config = resolve(cli);
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.log_dir(), PathBuf::from("./logs"));

        let engine = config.engine_config();
        assert_eq!(engine.registry_url, "http://registry:8000/");
        assert_eq!(engine.processes, 3);
        assert_eq!(engine.slots_per_process, 8);
        assert_eq!(engine.save_timeout_seconds, 30);
        assert_eq!(engine.connect_timeout_seconds, 30);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let file = file_with("not json");
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            storage_backend: Some("postgres".to_string()),
            ..Default::default()
        };

        let config = resolve(cli);
        assert_eq!(config.log_level(), "info");
        let engine = config.engine_config();
        assert_eq!(engine.storage_backend, "POSTGRES");
        assert_eq!(engine, EngineConfig {
            storage_backend: "POSTGRES".to_string(),
            ..EngineConfig::default()
        });
    }
}
