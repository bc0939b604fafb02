use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use custody_core::{
    clock::physical_now, CustodyRow, Parcel, Pool, PoolKey, PoolStatus, TrackingCode,
};

use crate::error::LedgerError;
use crate::traits::{CustodyRecord, Ledger, MemberPage, MemberQuery};

fn to_i64(v: u64, label: &str) -> Result<i64, LedgerError> {
    i64::try_from(v).map_err(|_| LedgerError::Serialization(format!("{label} out of range: {v}")))
}

fn to_u64(v: i64, label: &str) -> Result<u64, LedgerError> {
    u64::try_from(v).map_err(|_| LedgerError::Serialization(format!("negative {label}: {v}")))
}

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

type ParcelColumns = (String, String, Option<i64>, Option<String>, Vec<u8>);

fn parcel_from_columns(cols: ParcelColumns) -> Result<Parcel, LedgerError> {
    let (code, description, weight, order_ref, attributes) = cols;
    Ok(Parcel {
        tracking_code: TrackingCode::parse(&code)?,
        description,
        weight_grams: weight.map(|w| to_u64(w, "weight_grams")).transpose()?,
        order_ref,
        attributes: Parcel::attributes_from_msgpack(&attributes)?,
    })
}

fn read_pool(conn: &Connection, key: &PoolKey) -> Result<Option<Pool>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT status, declared_count FROM pools WHERE pool_key = ?1",
            rusqlite::params![key.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    match row {
        Some((status, declared)) => Ok(Some(Pool {
            key: key.clone(),
            declared_count: to_u64(declared, "declared_count")?,
            status: PoolStatus::parse(&status)?,
        })),
        None => Ok(None),
    }
}

fn parcel_exists(conn: &Connection, code: &TrackingCode) -> Result<bool, LedgerError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM parcels WHERE tracking_code = ?1",
            rusqlite::params![code.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn read_custody(
    conn: &Connection,
    code: &TrackingCode,
) -> Result<Option<CustodyRecord>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT record_id, pool_key, assigned_at FROM custody WHERE tracking_code = ?1",
            rusqlite::params![code.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((record_id, pool_key, assigned_at)) => Ok(Some(CustodyRecord {
            record_id,
            tracking_code: code.clone(),
            pool: PoolKey::parse(&pool_key)?,
            assigned_at_ms: to_u64(assigned_at, "assigned_at")?,
        })),
        None => Ok(None),
    }
}

/// Check the destination and write a fresh custody row. Caller owns the
/// transaction and any previous custody row.
fn assign(
    tx: &rusqlite::Transaction,
    code: &TrackingCode,
    to: &PoolKey,
) -> Result<CustodyRecord, LedgerError> {
    let assigned_at_ms = physical_now()?;
    tx.execute(
        "INSERT INTO custody (tracking_code, pool_key, assigned_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![code.as_str(), to.to_string(), to_i64(assigned_at_ms, "assigned_at")?],
    )?;
    let record_id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE pools SET declared_count = declared_count + 1 WHERE pool_key = ?1",
        rusqlite::params![to.to_string()],
    )?;
    Ok(CustodyRecord {
        record_id,
        tracking_code: code.clone(),
        pool: to.clone(),
        assigned_at_ms,
    })
}

fn require_open_pool(conn: &Connection, key: &PoolKey) -> Result<(), LedgerError> {
    match read_pool(conn, key)? {
        None => Err(LedgerError::PoolNotFound(key.to_string())),
        Some(pool) if !pool.accepts_transfers() => Err(LedgerError::PoolSealed {
            pool: key.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

impl Ledger for SqliteLedger {
    fn upsert_pool(&mut self, pool: &Pool) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO pools (pool_key, status, declared_count) VALUES (?1, ?2, ?3)
             ON CONFLICT(pool_key) DO UPDATE SET status = excluded.status",
            rusqlite::params![
                pool.key.to_string(),
                pool.status.as_str(),
                to_i64(pool.declared_count, "declared_count")?,
            ],
        )?;
        Ok(())
    }

    fn get_pool(&self, key: &PoolKey) -> Result<Option<Pool>, LedgerError> {
        read_pool(&self.conn, key)
    }

    fn set_pool_status(&mut self, key: &PoolKey, status: PoolStatus) -> Result<(), LedgerError> {
        let changed = self.conn.execute(
            "UPDATE pools SET status = ?1 WHERE pool_key = ?2",
            rusqlite::params![status.as_str(), key.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::PoolNotFound(key.to_string()));
        }
        Ok(())
    }

    fn insert_parcel(&mut self, parcel: &Parcel) -> Result<(), LedgerError> {
        let result = self.conn.execute(
            "INSERT INTO parcels (tracking_code, description, weight_grams, order_ref, attributes) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                parcel.tracking_code.as_str(),
                parcel.description,
                parcel
                    .weight_grams
                    .map(|w| to_i64(w, "weight_grams"))
                    .transpose()?,
                parcel.order_ref,
                parcel.attributes_to_msgpack()?,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(LedgerError::ParcelExists(parcel.tracking_code.to_string()))
            }
            Err(e) => Err(LedgerError::Sqlite(e)),
        }
    }

    fn get_parcel(&self, code: &TrackingCode) -> Result<Option<Parcel>, LedgerError> {
        let cols = self
            .conn
            .query_row(
                "SELECT tracking_code, description, weight_grams, order_ref, attributes FROM parcels WHERE tracking_code = ?1",
                rusqlite::params![code.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;
        cols.map(parcel_from_columns).transpose()
    }

    fn place(&mut self, code: &TrackingCode, pool: &PoolKey) -> Result<CustodyRecord, LedgerError> {
        let tx = self.conn.transaction()?;
        if !parcel_exists(&tx, code)? {
            return Err(LedgerError::ParcelNotFound(code.to_string()));
        }
        if let Some(current) = read_custody(&tx, code)? {
            return Err(LedgerError::AlreadyInPool {
                tracking_code: code.to_string(),
                pool: current.pool.to_string(),
            });
        }
        require_open_pool(&tx, pool)?;
        let record = assign(&tx, code, pool)?;
        tx.commit()?;
        Ok(record)
    }

    fn relocate(
        &mut self,
        code: &TrackingCode,
        from: &PoolKey,
        to: &PoolKey,
    ) -> Result<CustodyRecord, LedgerError> {
        let tx = self.conn.transaction()?;
        if !parcel_exists(&tx, code)? {
            return Err(LedgerError::ParcelNotFound(code.to_string()));
        }
        let current = read_custody(&tx, code)?;
        match &current {
            Some(c) if c.pool == *to => {
                return Err(LedgerError::AlreadyInPool {
                    tracking_code: code.to_string(),
                    pool: to.to_string(),
                });
            }
            Some(c) if c.pool == *from => {}
            _ => {
                return Err(LedgerError::NotInPool {
                    tracking_code: code.to_string(),
                    pool: from.to_string(),
                });
            }
        }
        require_open_pool(&tx, to)?;

        tx.execute(
            "DELETE FROM custody WHERE tracking_code = ?1",
            rusqlite::params![code.as_str()],
        )?;
        tx.execute(
            "UPDATE pools SET declared_count = declared_count - 1 WHERE pool_key = ?1 AND declared_count > 0",
            rusqlite::params![from.to_string()],
        )?;
        let record = assign(&tx, code, to)?;
        tx.commit()?;
        debug!(tracking_code = %code, %from, %to, record_id = record.record_id, "ledger relocated parcel");
        Ok(record)
    }

    fn custody_of(&self, code: &TrackingCode) -> Result<Option<CustodyRecord>, LedgerError> {
        read_custody(&self.conn, code)
    }

    fn list_members(&self, pool: &PoolKey, query: &MemberQuery) -> Result<MemberPage, LedgerError> {
        const FILTER: &str = "c.pool_key = ?1 AND (?2 IS NULL OR p.tracking_code LIKE '%' || ?2 || '%' OR p.description LIKE '%' || ?2 || '%')";
        let order = if query.newest_first { "DESC" } else { "ASC" };
        let search = query.search.as_deref();

        let total: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM custody c JOIN parcels p ON p.tracking_code = c.tracking_code WHERE {FILTER}"
            ),
            rusqlite::params![pool.to_string(), search],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT p.tracking_code, p.description, p.weight_grams, p.order_ref, p.attributes, c.record_id, c.assigned_at
             FROM custody c JOIN parcels p ON p.tracking_code = c.tracking_code
             WHERE {FILTER}
             ORDER BY c.record_id {order}
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![
                pool.to_string(),
                search,
                to_i64(query.limit, "limit")?,
                to_i64(query.offset, "offset")?,
            ],
            |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ),
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut result = Vec::new();
        for row in rows {
            let (cols, record_id, assigned_at) = row?;
            let parcel = parcel_from_columns(cols)?;
            let record = CustodyRecord {
                record_id,
                tracking_code: parcel.tracking_code.clone(),
                pool: pool.clone(),
                assigned_at_ms: to_u64(assigned_at, "assigned_at")?,
            };
            result.push(CustodyRow::assigned(parcel, record.assignment()));
        }
        Ok(MemberPage {
            rows: result,
            total: to_u64(total, "total")?,
        })
    }
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}
