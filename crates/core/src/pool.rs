use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{CoreError, PoolKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Open,
    /// Closed for loading (a sealed container, a departed dispatch).
    Sealed,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Sealed => "sealed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "open" => Ok(Self::Open),
            "sealed" => Ok(Self::Sealed),
            _ => Err(CoreError::InvalidData(format!("unknown pool status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub key: PoolKey,
    pub declared_count: u64,
    pub status: PoolStatus,
}

impl Pool {
    pub fn open(key: PoolKey) -> Self {
        Self {
            key,
            declared_count: 0,
            status: PoolStatus::Open,
        }
    }

    pub fn accepts_transfers(&self) -> bool {
        self.status == PoolStatus::Open
    }
}

/// Known pools by key. Unknown pools are treated as open.
#[derive(Debug, Clone, Default)]
pub struct PoolDirectory {
    pools: BTreeMap<PoolKey, Pool>,
}

impl PoolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, pool: Pool) {
        self.pools.insert(pool.key.clone(), pool);
    }

    pub fn get(&self, key: &PoolKey) -> Option<&Pool> {
        self.pools.get(key)
    }

    pub fn seal(&mut self, key: &PoolKey) -> bool {
        match self.pools.get_mut(key) {
            Some(pool) => {
                pool.status = PoolStatus::Sealed;
                true
            }
            None => false,
        }
    }

    /// Why `key` refuses new parcels, if it does.
    pub fn refusal(&self, key: &PoolKey) -> Option<String> {
        self.pools
            .get(key)
            .filter(|p| !p.accepts_transfers())
            .map(|p| format!("{} is {}", p.key, p.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_pool_refuses() {
        let mut dir = PoolDirectory::new();
        dir.upsert(Pool::open(PoolKey::Container(4)));
        assert_eq!(dir.refusal(&PoolKey::Container(4)), None);

        assert!(dir.seal(&PoolKey::Container(4)));
        assert_eq!(
            dir.refusal(&PoolKey::Container(4)).as_deref(),
            Some("CONTAINER-4 is sealed")
        );
        // Unknown pools are not refused.
        assert_eq!(dir.refusal(&PoolKey::Container(5)), None);
        assert!(!dir.seal(&PoolKey::Container(5)));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [PoolStatus::Open, PoolStatus::Sealed] {
            assert_eq!(PoolStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PoolStatus::parse("closed").is_err());
    }
}
