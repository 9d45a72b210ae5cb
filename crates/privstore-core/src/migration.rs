//! Schema migration
//!
//! Linear upgrade from the stored version to `SCHEMA_VERSION`, one
//! transaction per step. Each step records its resulting version inside its
//! own transaction, so an interrupted migration resumes from the last
//! completed step.
//!
//! | step | changes                                                         |
//! |------|-----------------------------------------------------------------|
//! | 1→2  | drop the obsolete `version` table, create `allowed_contacts`    |
//! | 2→3  | create `map` with default flags, flatten `<app>/<uid>/` mirrors |
//! | 3→4  | rebuild `settings` into the current column layout               |

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::mirror::{MirrorTree, MirrorUndo};
use crate::record::SETTING_DB_VERSION;
use crate::schema::{self, SCHEMA_VERSION, TABLE_MAP, TABLE_SETTINGS};

/// Version of the stored layout. A missing `map` table, a missing entry or
/// an unparsable value all mean version 1.
pub fn stored_version(conn: &Connection) -> StoreResult<u32> {
    if !schema::table_exists(conn, TABLE_MAP)? {
        return Ok(1);
    }
    let version = match schema::get_value(conn, SETTING_DB_VERSION)? {
        Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
            warn!(raw = %raw, "unparsable schema version, assuming 1");
            1
        }),
        None => 1,
    };
    Ok(version.max(1))
}

/// Upgrade to `SCHEMA_VERSION`. Returns the version reached.
pub fn migrate(conn: &mut Connection, mirror: &MirrorTree) -> StoreResult<u32> {
    let mut version = stored_version(conn)?;
    if version > SCHEMA_VERSION {
        warn!(version, supported = SCHEMA_VERSION, "stored schema is newer than this build");
        return Ok(version);
    }

    while version < SCHEMA_VERSION {
        info!(from = version, to = version + 1, "migrating settings schema");
        step(conn, mirror, version).map_err(|e| match e {
            e @ StoreError::Migration { .. } => e,
            other => StoreError::Migration { from: version, reason: other.to_string() },
        })?;
        version += 1;
    }
    Ok(version)
}

fn step(conn: &mut Connection, mirror: &MirrorTree, from: u32) -> StoreResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let undo = match from {
        1 => {
            tx.execute_batch("DROP TABLE IF EXISTS version")?;
            tx.execute_batch(schema::CREATE_ALLOWED_CONTACTS)?;
            MirrorUndo::default()
        }
        2 => {
            tx.execute_batch(schema::CREATE_MAP)?;
            schema::insert_default_flags(&tx)?;
            mirror.flatten_legacy()?
        }
        3 => {
            rebuild_settings(&tx)?;
            MirrorUndo::default()
        }
        other => {
            return Err(StoreError::Migration {
                from: other,
                reason: "no migration step defined".into(),
            })
        }
    };

    let committed = record_version(&tx, from + 1).and_then(|()| Ok(tx.commit()?));
    if let Err(e) = committed {
        undo.restore();
        return Err(e);
    }
    Ok(())
}

/// The version lives in `map`, which only exists from version 3 on; earlier
/// steps create it early to have somewhere to record progress.
fn record_version(tx: &Transaction<'_>, version: u32) -> StoreResult<()> {
    tx.execute_batch(schema::CREATE_MAP)?;
    schema::set_value(tx, SETTING_DB_VERSION, &version.to_string())
}

/// Recreate `settings` with the current columns, keeping every column the
/// old table shares with the new one.
fn rebuild_settings(tx: &Transaction<'_>) -> StoreResult<()> {
    const STAGING: &str = "settings_rebuild";

    if !schema::table_exists(tx, TABLE_SETTINGS)? {
        tx.execute_batch(&schema::settings_ddl(TABLE_SETTINGS))?;
        return Ok(());
    }

    let old = schema::table_columns(tx, TABLE_SETTINGS)?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {STAGING}"))?;
    tx.execute_batch(&schema::settings_ddl(STAGING))?;
    let new = schema::table_columns(tx, STAGING)?;
    let shared: Vec<&str> = new
        .iter()
        .filter(|column| old.contains(column))
        .map(String::as_str)
        .collect();

    if !shared.is_empty() {
        let columns = shared.join(", ");
        tx.execute_batch(&format!(
            "INSERT INTO {STAGING} ({columns}) SELECT {columns} FROM {TABLE_SETTINGS}"
        ))?;
    }
    tx.execute_batch(&format!("DROP TABLE {TABLE_SETTINGS}"))?;
    tx.execute_batch(&format!("ALTER TABLE {STAGING} RENAME TO {TABLE_SETTINGS}"))?;
    info!(kept = shared.len(), "rebuilt settings table");
    Ok(())
}
