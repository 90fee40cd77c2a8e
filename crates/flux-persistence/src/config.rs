//! Carga de configuración de conexión desde variables de entorno.
//!
//! - `FLUX_SHARD_URLS`: URLs Postgres separadas por coma, una por shard (el
//!   índice en la lista es el `ShardId`).
//! - `DATABASE_URL`: fallback de un único shard.
//! - `DATABASE_MIN_CONNECTIONS` / `DATABASE_MAX_CONNECTIONS`: tamaño de cada
//!   pool (por shard).

use std::env;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::error::PersistenceError;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub shard_urls: Vec<String>,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        // asegura que .env se haya cargado
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables inyectable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PersistenceError>
        where F: Fn(&str) -> Option<String>
    {
        let shard_urls = match lookup("FLUX_SHARD_URLS") {
            Some(list) => parse_shard_urls(&list),
            None => lookup("DATABASE_URL").into_iter().filter(|u| !u.trim().is_empty()).collect(),
        };
        if shard_urls.is_empty() {
            return Err(PersistenceError::Config("FLUX_SHARD_URLS / DATABASE_URL no definido".into()));
        }
        if shard_urls.len() > usize::from(u16::MAX) {
            return Err(PersistenceError::Config(format!("demasiados shards: {}", shard_urls.len())));
        }
        let min_connections = lookup("DATABASE_MIN_CONNECTIONS").and_then(|v| v.parse().ok()).unwrap_or(2);
        let max_connections = lookup("DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()).unwrap_or(16);
        Ok(Self { shard_urls, min_connections, max_connections })
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_urls.len() as u16
    }
}

fn parse_shard_urls(list: &str) -> Vec<String> {
    list.split(',').map(str::trim).filter(|u| !u.is_empty()).map(String::from).collect()
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

/// `true` si hay alguna URL configurada (para saltar demos/tests sin base).
pub fn database_configured() -> bool {
    init_dotenv();
    env::var("FLUX_SHARD_URLS").is_ok() || env::var("DATABASE_URL").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn shard_list_takes_precedence_over_database_url() {
        let cfg = DbConfig::from_lookup(lookup(&[("FLUX_SHARD_URLS", "postgres://a/db0, postgres://b/db1 ,"),
                                                 ("DATABASE_URL", "postgres://single/db")])).unwrap();
        assert_eq!(cfg.shard_urls, vec!["postgres://a/db0", "postgres://b/db1"]);
        assert_eq!(cfg.shard_count(), 2);
        assert_eq!((cfg.min_connections, cfg.max_connections), (2, 16));
    }

    #[test]
    fn database_url_is_a_single_shard() {
        let cfg = DbConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://single/db"),
                                                 ("DATABASE_MIN_CONNECTIONS", "1"),
                                                 ("DATABASE_MAX_CONNECTIONS", "not-a-number")])).unwrap();
        assert_eq!(cfg.shard_urls, vec!["postgres://single/db"]);
        assert_eq!((cfg.min_connections, cfg.max_connections), (1, 16));
    }

    #[test]
    fn missing_urls_is_a_config_error() {
        let err = DbConfig::from_lookup(lookup(&[("FLUX_SHARD_URLS", " , ")])).unwrap_err();
        assert!(matches!(err, PersistenceError::Config(_)));
        assert!(DbConfig::from_lookup(lookup(&[])).is_err());
    }
}
