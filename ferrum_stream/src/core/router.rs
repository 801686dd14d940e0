use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Canonical partition identity: the exact, ordered key tuple of a datum.
///
/// Keys are never joined, so `["a:b"]` and `["a", "b"]` are different partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(Arc<[String]>);

impl PartitionKey {
    pub fn new(keys: &[String]) -> Self {
        PartitionKey(Arc::from(keys))
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Where the accumulation context of a partition lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub key: PartitionKey,
    /// Worker that owns the partition for the whole invocation.
    pub shard: usize,
    /// Position of the partition in first-seen order.
    pub ordinal: usize,
    pub is_new: bool,
}

/// Routes key tuples to shards for a single invocation.
///
/// There is no cap on the number of partitions; bounding them is the caller's business.
#[derive(Debug)]
pub struct KeyRouter {
    shards: usize,
    routes: HashMap<PartitionKey, (usize, usize)>,
}

impl KeyRouter {
    pub fn new(shards: usize) -> Self {
        KeyRouter {
            shards: shards.max(1),
            routes: HashMap::new(),
        }
    }

    pub fn route(&mut self, keys: &[String]) -> Route {
        let key = PartitionKey::new(keys);
        if let Some((shard, ordinal)) = self.routes.get(&key) {
            return Route {
                key,
                shard: *shard,
                ordinal: *ordinal,
                is_new: false,
            };
        }

        let shard = self.shard_of(&key);
        let ordinal = self.routes.len();
        self.routes.insert(key.clone(), (shard, ordinal));
        Route {
            key,
            shard,
            ordinal,
            is_new: true,
        }
    }

    pub fn live_partitions(&self) -> usize {
        self.routes.len()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    fn shard_of(&self, key: &PartitionKey) -> usize {
        if self.shards == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards as u64) as usize
    }
}
