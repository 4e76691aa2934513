//! Aggregate configuration with environment overrides.
//!
//! | Variable               | Field                         |
//! |------------------------|-------------------------------|
//! | `TESSERA_BIND_ADDR`    | `server.bind_addr`            |
//! | `TESSERA_DATA_DIR`     | `server.store.path`           |
//! | `TESSERA_BATCH_SIZE`   | `server.batch_size`           |
//! | `TESSERA_WORKSPACE_ID` | `server.workspace_id`         |
//! | `TESSERA_MAX_ATTEMPTS` | `outbox.max_attempts`         |

use std::path::PathBuf;
use std::str::FromStr;
use tessera_core::{SyncError, SyncResult};

use crate::outbox::OutboxConfig;
use crate::radar::RadarConfig;
use crate::server::ServerConfig;

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub outbox: OutboxConfig,
    pub radar: RadarConfig,
}

impl SyncConfig {
    /// Defaults overridden by `TESSERA_*` environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(addr) = lookup("TESSERA_BIND_ADDR") {
            config.server.bind_addr = addr;
        }
        if let Some(dir) = lookup("TESSERA_DATA_DIR") {
            config.server.store.path = PathBuf::from(dir);
        }
        if let Some(size) = parse(&lookup, "TESSERA_BATCH_SIZE")? {
            if size == 0 {
                return Err(SyncError::Validation("TESSERA_BATCH_SIZE must be positive".into()));
            }
            config.server.batch_size = size;
        }
        if let Some(workspace_id) = parse(&lookup, "TESSERA_WORKSPACE_ID")? {
            config.server.workspace_id = workspace_id;
        }
        if let Some(attempts) = parse(&lookup, "TESSERA_MAX_ATTEMPTS")? {
            config.outbox.max_attempts = attempts;
        }
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> SyncResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| SyncError::Validation(format!("{key}={raw}: {e}")))
        })
        .transpose()
}
