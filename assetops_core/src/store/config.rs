use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Where runs and records are persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
    Postgres(PostgresConfig),
    /// Single WAL-mode file. Suitable for one worker process.
    Sqlite { path: PathBuf },
}

impl StoreConfig {
    /// Postgres when `ASSETOPS_DATABASE_URL` (or `DATABASE_URL`) is set,
    /// otherwise a SQLite file under `data_dir`.
    #[tracing::instrument(level = "debug")]
    pub fn from_env(data_dir: &Path) -> Result<Self> {
        let url = std::env::var("ASSETOPS_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|u| !u.trim().is_empty());

        let cfg = match url {
            Some(url) => {
                let max_connections = std::env::var("ASSETOPS_DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(10);
                let acquire_timeout_ms = std::env::var("ASSETOPS_DATABASE_ACQUIRE_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(5_000);
                StoreConfig::Postgres(PostgresConfig {
                    url,
                    max_connections,
                    acquire_timeout: Duration::from_millis(acquire_timeout_ms),
                })
            }
            None => StoreConfig::Sqlite {
                path: data_dir.join("assetops.db"),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        match self {
            StoreConfig::Postgres(pg) => {
                if pg.url.trim().is_empty() {
                    return Err(Error::InvalidInput("postgres.url is empty".to_string()));
                }
                if pg.max_connections == 0 {
                    return Err(Error::InvalidInput(
                        "postgres.max_connections must be > 0".to_string(),
                    ));
                }
                if pg.acquire_timeout.is_zero() {
                    return Err(Error::InvalidInput(
                        "postgres.acquire_timeout must be > 0".to_string(),
                    ));
                }
            }
            StoreConfig::Sqlite { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::InvalidInput("sqlite path is empty".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Postgres(_) => "postgres",
            StoreConfig::Sqlite { .. } => "sqlite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_config_requires_connections() {
        let cfg = StoreConfig::Postgres(PostgresConfig {
            url: "postgres://localhost/assetops".to_string(),
            max_connections: 0,
            acquire_timeout: Duration::from_secs(1),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sqlite_config_needs_a_path() {
        let cfg = StoreConfig::Sqlite {
            path: PathBuf::new(),
        };
        assert!(cfg.validate().is_err());
        let cfg = StoreConfig::Sqlite {
            path: PathBuf::from("./data/assetops.db"),
        };
        assert_eq!(cfg.kind(), "sqlite");
        cfg.validate().unwrap();
    }
}
