use std::env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub paging: PagingConfig,
    pub persistence: PersistenceConfig,
    pub log_level: String,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            paging: PagingConfig::load(),
            persistence: PersistenceConfig::load(),
            log_level: get_env("LOG_LEVEL", "info"),
        }
    }
}

// --- MODULES ---

// PAGING
#[derive(Debug, Clone)]
pub struct PagingConfig {
    /// In-memory reference budget per channel.
    pub full_size: usize,
    /// References reloaded from the store per page.
    pub page_size: usize,
    /// Write-behind buffer capacity before a batched page-out.
    pub down_cache_size: usize,
    pub actor_channel_capacity: usize,
}

impl PagingConfig {
    fn load() -> Self {
        Self {
            full_size:              get_env("PAGING_FULL_SIZE", "75000"),
            page_size:              get_env("PAGING_PAGE_SIZE", "2000"),
            down_cache_size:        get_env("PAGING_DOWN_CACHE_SIZE", "2000"),
            actor_channel_capacity: get_env("CHANNEL_ACTOR_CHAN_CAP", "256"),
        }
    }
}

// PERSISTENCE
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub path: String,
}

impl PersistenceConfig {
    fn load() -> Self {
        Self {
            path: get_env("PERSISTENCE_PATH", "./data/channels"),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
