//! flux-persistence
//!
//! Backend PostgreSQL (Diesel + r2d2) del Event Store definido en `flux-core`.
//!
//! Módulos:
//! - `pg`: pools por shard, `PgEventStore` y el handle transaccional
//!   `PgEventTx`.
//! - `migrations`: runner embebido del DDL de la tabla `events`.
//! - `config`: carga de configuración desde .env / entorno.
//! - `schema`: tabla Diesel declarada para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_store_from_env, build_pool, build_sharded_provider, ConnectionProvider, PgEventStore, PgEventTx,
             PgPool, ShardedPoolProvider};
