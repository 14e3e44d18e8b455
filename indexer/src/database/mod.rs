//! The relational store behind the indexer.
//!
//! Exposes typed insert/stream operations plus a small key-value surface for
//! cursors. All finalized writes happen inside `run_db_transaction`, which
//! retries transient failures.

mod error;
pub mod models;
pub mod schema;

pub use error::Error;
pub use models::*;

use crate::config::DatabaseConfig;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as PgError};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
pub type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Batch size used by the unfinalized stream readers.
const STREAM_BATCH_SIZE: i64 = 1000;
/// Transient transaction failures are retried this many times.
const TRANSACTION_RETRIES: usize = 3;

pub fn build_connection_pool(config: &DatabaseConfig) -> Result<PgPool, Error> {
    let database_url = config.build_database_url();
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .connection_timeout(Duration::from_millis(config.connect_timeout_millis))
        .build(manager)
        .map_err(Error::Pool)
}

pub fn get_connection(pool: &PgPool) -> Result<PgConn, Error> {
    pool.get().map_err(Error::Pool)
}

fn is_transient(error: &Error) -> bool {
    match error {
        Error::Database(PgError::DatabaseError(DatabaseErrorKind::SerializationFailure, _)) => true,
        Error::Database(PgError::DatabaseError(_, info)) => {
            let message = info.message().to_lowercase();
            message.contains("deadlock") || message.contains("lock timeout")
        }
        _ => false,
    }
}

/// Run `f` inside a transaction, retrying deadlocks and serialization
/// failures up to 3 times. Partial writes are never visible.
pub fn run_db_transaction<T>(
    pool: &PgPool,
    f: impl Fn(&mut PgConnection) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut conn = get_connection(pool)?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match conn.transaction::<T, Error, _>(|conn| f(conn)) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < TRANSACTION_RETRIES && is_transient(&e) => {
                warn!("Transient database error, retrying transaction: {e}");
            }
            Err(e) => return Err(e),
        }
    }
}

/*
 * Finalized history
 */

pub fn insert_slot(conn: &mut PgConnection, row: &SlotRow) -> Result<(), Error> {
    diesel::insert_into(schema::slots::table)
        .values(row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

/// A slot with a known proposer duty but no observed block.
pub fn insert_missing_slot(conn: &mut PgConnection, row: &SlotRow) -> Result<(), Error> {
    insert_slot(conn, row)
}

pub fn insert_epoch(conn: &mut PgConnection, row: &EpochRow) -> Result<(), Error> {
    diesel::insert_into(schema::epochs::table)
        .values(row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn insert_deposits(conn: &mut PgConnection, rows: &[DepositRow]) -> Result<(), Error> {
    diesel::insert_into(schema::deposits::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn insert_voluntary_exits(
    conn: &mut PgConnection,
    rows: &[VoluntaryExitRow],
) -> Result<(), Error> {
    diesel::insert_into(schema::voluntary_exits::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn insert_slashings(conn: &mut PgConnection, rows: &[SlashingRow]) -> Result<(), Error> {
    diesel::insert_into(schema::slashings::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn insert_sync_assignments(
    conn: &mut PgConnection,
    rows: &[SyncAssignmentRow],
) -> Result<(), Error> {
    diesel::insert_into(schema::sync_assignments::table)
        .values(rows)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn is_sync_committee_synchronized(conn: &mut PgConnection, period: i64) -> Result<bool, Error> {
    use schema::sync_assignments::dsl;
    let count: i64 = dsl::sync_assignments
        .filter(dsl::period.eq(period))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/*
 * Unfinalized recovery log
 */

pub fn upsert_unfinalized_block(
    conn: &mut PgConnection,
    row: &UnfinalizedBlockRow,
) -> Result<(), Error> {
    use schema::unfinalized_blocks::dsl;
    diesel::insert_into(dsl::unfinalized_blocks)
        .values(row)
        .on_conflict(dsl::root)
        .do_update()
        .set((dsl::status.eq(row.status), dsl::fork_id.eq(row.fork_id)))
        .execute(conn)?;
    Ok(())
}

pub fn update_unfinalized_block_status(
    conn: &mut PgConnection,
    root: &[u8],
    status: i16,
    fork_id: i64,
) -> Result<(), Error> {
    use schema::unfinalized_blocks::dsl;
    diesel::update(dsl::unfinalized_blocks.filter(dsl::root.eq(root)))
        .set((dsl::status.eq(status), dsl::fork_id.eq(fork_id)))
        .execute(conn)?;
    Ok(())
}

pub fn stream_unfinalized_blocks(
    conn: &mut PgConnection,
    mut cb: impl FnMut(UnfinalizedBlockRow),
) -> Result<(), Error> {
    use schema::unfinalized_blocks::dsl;
    let mut offset = 0;
    loop {
        let batch: Vec<UnfinalizedBlockRow> = dsl::unfinalized_blocks
            .order((dsl::slot.asc(), dsl::root.asc()))
            .offset(offset)
            .limit(STREAM_BATCH_SIZE)
            .load(conn)?;
        let done = (batch.len() as i64) < STREAM_BATCH_SIZE;
        for row in batch {
            cb(row);
        }
        if done {
            return Ok(());
        }
        offset += STREAM_BATCH_SIZE;
    }
}

pub fn delete_unfinalized_blocks_below(conn: &mut PgConnection, slot: i64) -> Result<usize, Error> {
    use schema::unfinalized_blocks::dsl;
    Ok(diesel::delete(dsl::unfinalized_blocks.filter(dsl::slot.lt(slot))).execute(conn)?)
}

pub fn insert_unfinalized_duty(
    conn: &mut PgConnection,
    row: &UnfinalizedDutyRow,
) -> Result<(), Error> {
    diesel::insert_into(schema::unfinalized_duties::table)
        .values(row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn stream_unfinalized_duties(
    conn: &mut PgConnection,
    mut cb: impl FnMut(UnfinalizedDutyRow),
) -> Result<(), Error> {
    use schema::unfinalized_duties::dsl;
    let mut offset = 0;
    loop {
        let batch: Vec<UnfinalizedDutyRow> = dsl::unfinalized_duties
            .order((dsl::epoch.asc(), dsl::dependent_root.asc()))
            .offset(offset)
            .limit(STREAM_BATCH_SIZE)
            .load(conn)?;
        let done = (batch.len() as i64) < STREAM_BATCH_SIZE;
        for row in batch {
            cb(row);
        }
        if done {
            return Ok(());
        }
        offset += STREAM_BATCH_SIZE;
    }
}

pub fn delete_unfinalized_duties_below(
    conn: &mut PgConnection,
    epoch: i64,
) -> Result<usize, Error> {
    use schema::unfinalized_duties::dsl;
    Ok(diesel::delete(dsl::unfinalized_duties.filter(dsl::epoch.lt(epoch))).execute(conn)?)
}

pub fn insert_unfinalized_epoch(
    conn: &mut PgConnection,
    row: &UnfinalizedEpochRow,
) -> Result<(), Error> {
    diesel::insert_into(schema::unfinalized_epochs::table)
        .values(row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

pub fn stream_unfinalized_epochs(
    conn: &mut PgConnection,
    mut cb: impl FnMut(UnfinalizedEpochRow),
) -> Result<(), Error> {
    use schema::unfinalized_epochs::dsl;
    let mut offset = 0;
    loop {
        let batch: Vec<UnfinalizedEpochRow> = dsl::unfinalized_epochs
            .order((dsl::epoch.asc(), dsl::dependent_root.asc()))
            .offset(offset)
            .limit(STREAM_BATCH_SIZE)
            .load(conn)?;
        let done = (batch.len() as i64) < STREAM_BATCH_SIZE;
        for row in batch {
            cb(row);
        }
        if done {
            return Ok(());
        }
        offset += STREAM_BATCH_SIZE;
    }
}

pub fn delete_unfinalized_epochs_below(
    conn: &mut PgConnection,
    epoch: i64,
) -> Result<usize, Error> {
    use schema::unfinalized_epochs::dsl;
    Ok(diesel::delete(dsl::unfinalized_epochs.filter(dsl::epoch.lt(epoch))).execute(conn)?)
}

pub fn upsert_unfinalized_fork(
    conn: &mut PgConnection,
    row: &UnfinalizedForkRow,
) -> Result<(), Error> {
    use schema::unfinalized_forks::dsl;
    diesel::insert_into(dsl::unfinalized_forks)
        .values(row)
        .on_conflict(dsl::fork_id)
        .do_update()
        .set((dsl::head_slot.eq(row.head_slot), dsl::head_root.eq(&row.head_root)))
        .execute(conn)?;
    Ok(())
}

pub fn get_unfinalized_forks(
    conn: &mut PgConnection,
    since_slot: i64,
) -> Result<Vec<UnfinalizedForkRow>, Error> {
    use schema::unfinalized_forks::dsl;
    Ok(dsl::unfinalized_forks
        .filter(dsl::head_slot.ge(since_slot))
        .order(dsl::fork_id.asc())
        .load(conn)?)
}

pub fn delete_unfinalized_forks_below(
    conn: &mut PgConnection,
    head_slot: i64,
) -> Result<usize, Error> {
    use schema::unfinalized_forks::dsl;
    Ok(diesel::delete(dsl::unfinalized_forks.filter(dsl::head_slot.lt(head_slot))).execute(conn)?)
}

/*
 * Explorer state key-value surface
 */

pub fn get_explorer_state<T: DeserializeOwned>(
    conn: &mut PgConnection,
    state_key: &str,
) -> Result<Option<T>, Error> {
    use schema::explorer_state::dsl;
    let row: Option<ExplorerStateRow> = dsl::explorer_state
        .filter(dsl::key.eq(state_key))
        .first(conn)
        .optional()?;
    match row {
        Some(row) => Ok(Some(serde_json::from_value(row.value)?)),
        None => Ok(None),
    }
}

pub fn set_explorer_state<T: Serialize>(
    conn: &mut PgConnection,
    state_key: &str,
    state: &T,
) -> Result<(), Error> {
    use schema::explorer_state::dsl;
    let row = ExplorerStateRow {
        key: state_key.to_string(),
        value: serde_json::to_value(state)?,
    };
    diesel::insert_into(dsl::explorer_state)
        .values(&row)
        .on_conflict(dsl::key)
        .do_update()
        .set(dsl::value.eq(&row.value))
        .execute(conn)?;
    Ok(())
}
