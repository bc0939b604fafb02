use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use custody_core::{Page, PoolKey, TrackingCode, View, ViewKey};
use custody_engine::{
    CustodyRemote, PageChunk, RemoteError, RemoteErrorKind, ServerRecord, ViewLoader,
};
use custody_storage::{Ledger, LedgerError, MemberQuery, SqliteLedger, DEFAULT_PAGE_SIZE};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How ledger refusals look to a client of the custody service.
pub fn classify(err: &LedgerError) -> RemoteErrorKind {
    match err {
        LedgerError::ParcelNotFound(_) => RemoteErrorKind::NotFound,
        LedgerError::AlreadyInPool { .. } => RemoteErrorKind::Duplicate,
        LedgerError::NotInPool { .. }
        | LedgerError::PoolSealed { .. }
        | LedgerError::PoolNotFound(_) => RemoteErrorKind::Conflict,
        _ => RemoteErrorKind::Other,
    }
}

fn remote_error(err: LedgerError) -> RemoteError {
    RemoteError::new(classify(&err), err.to_string())
}

/// Keeps a transfer request waiting until released or dropped.
#[derive(Debug)]
pub struct Gate {
    release: oneshot::Sender<()>,
}

impl Gate {
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// The custody service backed by a SQLite ledger, with hooks to hold,
/// fail or crash individual requests.
pub struct LedgerRemote {
    ledger: Mutex<SqliteLedger>,
    gates: Mutex<HashMap<TrackingCode, oneshot::Receiver<()>>>,
    failures: Mutex<HashMap<TrackingCode, RemoteError>>,
    crashes: Mutex<HashSet<TrackingCode>>,
    transfer_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl LedgerRemote {
    pub fn new(ledger: SqliteLedger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            crashes: Mutex::new(HashSet::new()),
            transfer_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn ledger(&self) -> MutexGuard<'_, SqliteLedger> {
        lock(&self.ledger)
    }

    /// Hold the next transfer request for `code` until the gate goes away.
    pub fn hold(&self, code: &TrackingCode) -> Gate {
        let (release, wait) = oneshot::channel();
        lock(&self.gates).insert(code.clone(), wait);
        Gate { release }
    }

    /// Answer the next transfer request for `code` with an error instead
    /// of touching the ledger.
    pub fn fail_next(&self, code: &TrackingCode, kind: RemoteErrorKind, message: &str) {
        lock(&self.failures).insert(code.clone(), RemoteError::new(kind, message));
    }

    /// Panic inside the next transfer request for `code`.
    pub fn crash_next(&self, code: &TrackingCode) {
        lock(&self.crashes).insert(code.clone());
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    fn query(view: &ViewKey, offset: u64) -> Result<MemberQuery, RemoteError> {
        let newest_first = match view.param("order") {
            None | Some("newest") => true,
            Some("oldest") => false,
            Some(other) => return Err(RemoteError::other(format!("unknown order: {other}"))),
        };
        let limit = match view.param("page_size") {
            None => DEFAULT_PAGE_SIZE,
            Some(raw) => raw
                .parse()
                .map_err(|_| RemoteError::other(format!("bad page size: {raw}")))?,
        };
        Ok(MemberQuery {
            search: view.param("search").map(str::to_owned),
            newest_first,
            offset,
            limit,
        })
    }

    /// One page at `offset`; the cursor is the offset of the next page.
    fn page_at(&self, pool: &PoolKey, view: &ViewKey, offset: u64) -> Result<PageChunk, RemoteError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let query = Self::query(view, offset)?;
        let members = self.ledger().list_members(pool, &query).map_err(remote_error)?;
        let has_more = members.has_more(&query);
        let next = offset + members.rows.len() as u64;
        let mut page = Page::new(members.rows);
        if has_more {
            page = page.with_cursor(next.to_string());
        }
        Ok(PageChunk {
            page,
            total: members.total,
        })
    }
}

#[async_trait]
impl CustodyRemote for LedgerRemote {
    async fn request_transfer(
        &self,
        code: &TrackingCode,
        from: &PoolKey,
        to: &PoolKey,
    ) -> Result<ServerRecord, RemoteError> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.gates).remove(code);
        if let Some(wait) = gate {
            // A dropped gate releases too.
            let _ = wait.await;
        }

        let crash = lock(&self.crashes).remove(code);
        if crash {
            panic!("custody service crashed handling {code}");
        }
        let injected = lock(&self.failures).remove(code);
        if let Some(err) = injected {
            debug!(tracking_code = %code, error = %err, "injected failure");
            return Err(err);
        }

        let record = self.ledger().relocate(code, from, to).map_err(remote_error)?;
        Ok(ServerRecord {
            tracking_code: record.tracking_code.clone(),
            pool: record.pool.clone(),
            assignment: record.assignment(),
        })
    }
}

#[async_trait]
impl ViewLoader for LedgerRemote {
    async fn load(&self, pool: &PoolKey, view: &ViewKey) -> Result<View, RemoteError> {
        let chunk = self.page_at(pool, view, 0)?;
        Ok(View::new(vec![chunk.page], chunk.total))
    }

    async fn load_page(
        &self,
        pool: &PoolKey,
        view: &ViewKey,
        cursor: &str,
    ) -> Result<PageChunk, RemoteError> {
        let offset = cursor
            .parse()
            .map_err(|_| RemoteError::other(format!("bad cursor: {cursor}")))?;
        self.page_at(pool, view, offset)
    }
}

impl std::fmt::Debug for LedgerRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRemote")
            .field("transfer_calls", &self.transfer_calls())
            .field("load_calls", &self.load_calls())
            .finish_non_exhaustive()
    }
}
