//! Pruebas básicas de configuración y pool (requiere DATABASE_URL válido en entorno).

use flux_persistence::{config::DbConfig, pg::build_pool};

#[test]
fn create_pool_from_env() {
    if std::env::var("DATABASE_URL").is_err() { eprintln!("DATABASE_URL no definido: omitiendo test"); return; }
    let cfg = DbConfig::from_env().expect("config");
    let pool = build_pool(&cfg.shard_urls[0], cfg.min_connections, cfg.max_connections).expect("pool");
    let mut conn = pool.get().expect("conn");
    // Sonda trivial de validez
    use diesel::connection::SimpleConnection;
    conn.batch_execute("SELECT 1;").expect("select 1");
}

// Construir el pool dos veces no falla: el DDL embebido se aplica una sola vez.
#[test]
fn migrations_are_idempotent() {
    if std::env::var("DATABASE_URL").is_err() { eprintln!("DATABASE_URL no definido: omitiendo test"); return; }
    let cfg = DbConfig::from_env().expect("config");
    build_pool(&cfg.shard_urls[0], 1, 1).expect("first pool");
    build_pool(&cfg.shard_urls[0], 1, 1).expect("second pool");
}
