use flux_core::HashShardRouter;
use flux_persistence::config::DbConfig;
use flux_persistence::pg::{build_sharded_provider, PgEventStore, ShardedPoolProvider};
use once_cell::sync::Lazy;

pub type TestStore = PgEventStore<ShardedPoolProvider, HashShardRouter>;

pub static TEST_STORE: Lazy<Option<TestStore>> = Lazy::new(|| {
    if std::env::var("DATABASE_URL").is_err() {
        return None;
    }
    let cfg = match DbConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuración de test inválida: {e}");
            return None;
        }
    };
    // pools chicos pero con margen para dos transacciones concurrentes
    let cfg = DbConfig { min_connections: 1, max_connections: 4, ..cfg };
    match build_sharded_provider(&cfg) {
        Ok(provider) => Some(PgEventStore::new(provider, HashShardRouter::new(cfg.shard_count()))),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn with_store<F, R>(f: F) -> Option<R>
    where F: FnOnce(&TestStore) -> R
{
    TEST_STORE.as_ref().map(f)
}
