//! Process settings read from the environment.
//!
//! | Variable             | Default        |
//! |----------------------|----------------|
//! | `PORT`               | 8080           |
//! | `BIND_HOST`          | 0.0.0.0        |
//! | `DB_PATH`            | ./data/tandem  |
//! | `STORAGE`            | rocksdb        |
//! | `AUTO_SAVE_INTERVAL` | 60 (seconds)   |
//! | `AUTO_SAVE_WINDOW`   | 30 (seconds)   |
//! | `OUTBOUND_CAPACITY`  | 256            |
//! | `HEARTBEAT_INTERVAL` | 30 (seconds)   |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tandem_collab::hub::HubConfig;
use tandem_collab::server::ServerConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_DB_PATH: &str = "./data/tandem";

/// Where documents are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    RocksDb(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageBackend,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("BIND_HOST")
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port: u16 = parse_or("PORT", lookup("PORT"), DEFAULT_PORT);

        let defaults = ServerConfig::default();
        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            autosave_interval: Duration::from_secs(parse_or(
                "AUTO_SAVE_INTERVAL",
                lookup("AUTO_SAVE_INTERVAL"),
                hub_defaults.autosave_interval.as_secs(),
            )),
            autosave_window: Duration::from_secs(parse_or(
                "AUTO_SAVE_WINDOW",
                lookup("AUTO_SAVE_WINDOW"),
                hub_defaults.autosave_window.as_secs(),
            )),
            ..hub_defaults
        };

        let server = ServerConfig {
            bind_addr: format!("{host}:{port}"),
            outbound_capacity: parse_or(
                "OUTBOUND_CAPACITY",
                lookup("OUTBOUND_CAPACITY"),
                defaults.outbound_capacity,
            ),
            heartbeat_interval_secs: parse_or(
                "HEARTBEAT_INTERVAL",
                lookup("HEARTBEAT_INTERVAL"),
                defaults.heartbeat_interval_secs,
            ),
            hub,
        };

        let db_path = lookup("DB_PATH")
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let storage = match lookup("STORAGE").as_deref().map(str::to_ascii_lowercase) {
            Some(kind) if kind == "memory" => StorageBackend::Memory,
            Some(kind) if kind != "rocksdb" && !kind.is_empty() => {
                log::warn!("Unknown STORAGE={kind:?}, using rocksdb");
                StorageBackend::RocksDb(PathBuf::from(db_path))
            }
            _ => StorageBackend::RocksDb(PathBuf::from(db_path)),
        };

        Self { server, storage }
    }
}

/// Parse a positive number, falling back to `default` with a warning.
fn parse_or<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    let Some(value) = value else {
        return default;
    };
    match value.trim().parse::<T>() {
        Ok(n) if n > T::default() => n,
        _ => {
            log::warn!("Ignoring {key}={value:?}, using {default}");
            default
        }
    }
}
