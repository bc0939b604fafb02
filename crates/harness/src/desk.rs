use std::sync::{Arc, PoisonError, RwLock};

use tempfile::TempDir;

use custody_core::{Parcel, Pool, PoolDirectory, PoolKey, PoolStatus, TrackingCode, View, ViewKey};
use custody_engine::{EngineConfig, SharedCache, TransferEngine};
use custody_storage::{Ledger, SqliteLedger};

use crate::remote::LedgerRemote;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

pub fn code(raw: &str) -> TrackingCode {
    TrackingCode::parse(raw).unwrap_or_else(|e| panic!("bad tracking code {raw}: {e}"))
}

/// Oldest assignment first, so parcels list in the order they were received.
pub fn by_arrival() -> ViewKey {
    ViewKey::all().with("order", "oldest")
}

/// Yield to other tasks until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> TestResult<()> {
    for _ in 0..1_000 {
        if condition() {
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
    Err("condition not reached".into())
}

/// A dispatch desk: one engine in front of a ledger-backed custody service,
/// with the pool directory doubling as the acceptance policy.
pub struct TestDesk {
    pub remote: Arc<LedgerRemote>,
    pub engine: TransferEngine,
    pub directory: Arc<RwLock<PoolDirectory>>,
    _dir: Option<TempDir>,
}

impl TestDesk {
    pub fn new() -> TestResult<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> TestResult<Self> {
        Self::build(SqliteLedger::open_in_memory()?, config, SharedCache::new(), None)
    }

    /// Ledger in a temporary file instead of memory.
    pub fn on_disk() -> TestResult<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("custody.db");
        let ledger = SqliteLedger::open(&path.to_string_lossy())?;
        Self::build(ledger, EngineConfig::default(), SharedCache::new(), Some(dir))
    }

    /// A second desk over the same cache but its own service.
    pub fn sharing(cache: SharedCache) -> TestResult<Self> {
        Self::build(SqliteLedger::open_in_memory()?, EngineConfig::default(), cache, None)
    }

    fn build(
        ledger: SqliteLedger,
        config: EngineConfig,
        cache: SharedCache,
        dir: Option<TempDir>,
    ) -> TestResult<Self> {
        crate::init_tracing();
        let remote = Arc::new(LedgerRemote::new(ledger));
        let directory = Arc::new(RwLock::new(PoolDirectory::new()));
        let engine = TransferEngine::new(cache, remote.clone())
            .with_policy(directory.clone())
            .with_config(config);
        Ok(Self {
            remote,
            engine,
            directory,
            _dir: dir,
        })
    }

    pub fn open_pool(&self, key: &PoolKey) -> TestResult<()> {
        let pool = Pool::open(key.clone());
        self.remote.ledger().upsert_pool(&pool)?;
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(pool);
        Ok(())
    }

    pub fn seal_pool(&self, key: &PoolKey) -> TestResult<()> {
        self.remote.ledger().set_pool_status(key, PoolStatus::Sealed)?;
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .seal(key);
        Ok(())
    }

    /// Register a parcel with the service and place it in `pool`.
    pub fn receive(&self, raw: &str, pool: &PoolKey) -> TestResult<Parcel> {
        let parcel = Parcel::new(code(raw), format!("parcel {raw}")).with_weight(1_200);
        let mut ledger = self.remote.ledger();
        ledger.insert_parcel(&parcel)?;
        ledger.place(&parcel.tracking_code, pool)?;
        Ok(parcel)
    }

    /// Move a parcel behind the engine's back, as another desk would.
    pub fn relocate_elsewhere(&self, raw: &str, from: &PoolKey, to: &PoolKey) -> TestResult<()> {
        self.remote.ledger().relocate(&code(raw), from, to)?;
        Ok(())
    }

    pub fn custody(&self, raw: &str) -> TestResult<Option<PoolKey>> {
        Ok(self.remote.ledger().custody_of(&code(raw))?.map(|r| r.pool))
    }

    /// Register `view` of `pool` with the service as its loader.
    pub fn track(&self, pool: &PoolKey, view: &ViewKey) {
        self.engine
            .register_view(pool.clone(), view.clone(), self.remote.clone());
    }

    /// Register and load.
    pub async fn load(&self, pool: &PoolKey, view: &ViewKey) -> TestResult<View> {
        self.track(pool, view);
        Ok(self.engine.get_view(pool, view).await?)
    }

    pub fn cached(&self, pool: &PoolKey, view: &ViewKey) -> TestResult<View> {
        self.engine
            .cached_view(pool, view)
            .ok_or_else(|| format!("{pool} [{view}] not cached").into())
    }

    pub fn is_stale(&self, pool: &PoolKey, view: &ViewKey) -> bool {
        self.engine.cache().lock().is_stale(pool, view)
    }
}
