//! Implementación Postgres (Diesel + r2d2) del Event Store.
//!
//! Objetivo general del módulo:
//! - Un pool r2d2 por shard (conjunto de particiones read-write).
//! - Cada operación resuelve el shard con el `ShardRouter` antes de tocar una
//!   conexión; las transacciones nunca cruzan shards.
//! - Todas las consultas usan parámetros ligados (`= $n`, `= ANY($n)`) y el
//!   `FOR UPDATE` se elige con un booleano al construir la query.
//! - Sin reintentos implícitos: los fallos transitorios se devuelven como
//!   `EventStoreError::StorageUnavailable` para que decida el llamador.

mod events;

use diesel::pg::PgConnection;
use diesel::r2d2::{self, ConnectionManager};
use flux_core::{HashShardRouter, ShardId};
use log::{debug, warn};

use crate::config::DbConfig;
use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;

pub use events::{EventRow, NewEventRow, PgEventStore, PgEventTx};

/// Alias de tipo para el pool r2d2 de conexiones Postgres de un shard.
///
/// Notas operativas:
/// - Se construye con `min_idle` (mínimo de conexiones inactivas) y
///   `max_size` (límite superior total).
/// - Al construirlo se aplica el DDL embebido pendiente (una sola vez).
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones por shard.
///
/// Este trait permite:
/// - Inyectar pools reales (producción/tests de integración).
/// - Simular fallos en tests unitarios sin acoplar a r2d2.
///
/// Contrato:
/// - Debe devolver una conexión del shard pedido o
///   `PersistenceError::TransientIo` si el pool no puede entregarla.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self, shard: ShardId) -> Result<PgPooledConnection, PersistenceError>;

    /// Cantidad de particiones configuradas; los `ShardId` válidos son `0..n`.
    fn shard_count(&self) -> usize;
}

/// Conjunto de particiones read-write: un `PgPool` por `ShardId`.
#[derive(Clone)]
pub struct ShardedPoolProvider {
    pub pools: Vec<PgPool>,
}

impl ShardedPoolProvider {
    pub fn new(pools: Vec<PgPool>) -> Self {
        Self { pools }
    }

    /// Un único shard (ej. `DATABASE_URL` en desarrollo).
    pub fn single(pool: PgPool) -> Self {
        Self { pools: vec![pool] }
    }
}

impl ConnectionProvider for ShardedPoolProvider {
    fn connection(&self, shard: ShardId) -> Result<PgPooledConnection, PersistenceError> {
        let pool = self.pools
                       .get(shard.index())
                       .ok_or_else(|| PersistenceError::Config(format!("no pool for {shard}")))?;
        pool.get().map_err(|e| PersistenceError::TransientIo(format!("pool error ({shard}): {e}")))
    }

    fn shard_count(&self) -> usize {
        self.pools.len()
    }
}

/// Construye un pool Postgres r2d2 a partir de URL.
///
/// Comportamiento:
/// - Valida y ajusta tamaños (0 -> 1; si `min_size > max_size`, usa
///   `min_size = max_size`).
/// - Aplica el DDL embebido con la primera conexión.
/// - Devuelve `PersistenceError::TransientIo` ante errores del pool/manager.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let final_min = validated_min.min(validated_max);
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(final_min))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Un pool migrado por cada URL de `cfg.shard_urls`, en orden de `ShardId`.
pub fn build_sharded_provider(cfg: &DbConfig) -> Result<ShardedPoolProvider, PersistenceError> {
    let pools = cfg.shard_urls
                   .iter()
                   .enumerate()
                   .map(|(i, url)| {
                       debug!("build_pool:shard-{i}");
                       build_pool(url, cfg.min_connections, cfg.max_connections)
                   })
                   .collect::<Result<Vec<_>, _>>()?;
    Ok(ShardedPoolProvider::new(pools))
}

/// Helper de desarrollo: carga `.env`, lee configuración y construye un
/// `PgEventStore` con un pool migrado por shard y `HashShardRouter`.
pub fn build_dev_store_from_env() -> Result<PgEventStore<ShardedPoolProvider, HashShardRouter>, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = DbConfig::from_env()?;
    let provider = build_sharded_provider(&cfg)?;
    Ok(PgEventStore::new(provider, HashShardRouter::new(cfg.shard_count())))
}
