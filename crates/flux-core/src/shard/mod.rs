//! Shard Router: `instance_id -> ShardId`.
//!
//! Todas las operaciones de un mismo workflow instance deben ser locales a una
//! única partición, por lo que la función debe ser determinista y estable
//! durante toda la vida de la instancia (y entre procesos). Por eso no se usa
//! `DefaultHasher` (su algoritmo no está garantizado entre versiones de Rust)
//! sino BLAKE3.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Índice de partición física (read-write, sharded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u16);

impl ShardId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Función pura inyectable que resuelve la partición de una instancia.
pub trait ShardRouter: Send + Sync {
    fn shard_for(&self, instance_id: &str) -> ShardId;
}

impl<F> ShardRouter for F where F: Fn(&str) -> ShardId + Send + Sync
{
    fn shard_for(&self, instance_id: &str) -> ShardId {
        self(instance_id)
    }
}

/// Router por hash: primeros 8 bytes (LE) del digest BLAKE3 del id, módulo
/// `shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashShardRouter {
    shard_count: u16,
}

impl HashShardRouter {
    /// `shard_count = 0` se ajusta a 1.
    pub fn new(shard_count: u16) -> Self {
        Self { shard_count: shard_count.max(1) }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }
}

impl Default for HashShardRouter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ShardRouter for HashShardRouter {
    fn shard_for(&self, instance_id: &str) -> ShardId {
        let digest = blake3::hash(instance_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let bucket = u64::from_le_bytes(prefix) % u64::from(self.shard_count);
        ShardId(bucket as u16)
    }
}
