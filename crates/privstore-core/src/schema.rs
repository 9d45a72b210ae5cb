//! Relational layout and row-level operations
//!
//! Three tables live in the backing file:
//! - `settings`: one row per application, one INTEGER column per category
//! - `allowed_contacts`: (settings_id, contact_id) pairs
//! - `map`: global name/value flags, including the schema version
//!
//! Functions here take a plain `&Connection`; callers pass a `Transaction`
//! (which derefs to one) whenever several statements must commit together.

use std::collections::{BTreeSet, HashSet};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::record::{
    Category, PolicyValue, SettingRecord, SETTING_DB_VERSION, SETTING_ENABLED,
    SETTING_NOTIFICATIONS_ENABLED, VALUE_TRUE,
};

/// Version written by a fresh initialization and reached by migration.
pub const SCHEMA_VERSION: u32 = 4;

pub const TABLE_SETTINGS: &str = "settings";
pub const TABLE_ALLOWED_CONTACTS: &str = "allowed_contacts";
pub const TABLE_MAP: &str = "map";

/// Written to the retired per-user column.
const LEGACY_UID: i64 = -1;

pub(crate) const CREATE_ALLOWED_CONTACTS: &str = "CREATE TABLE IF NOT EXISTS allowed_contacts (
    settings_id INTEGER,
    contact_id INTEGER,
    PRIMARY KEY(settings_id, contact_id)
)";

pub(crate) const CREATE_MAP: &str = "CREATE TABLE IF NOT EXISTS map (
    name TEXT PRIMARY KEY,
    value TEXT
)";

/// DDL for the settings table under `table`.
pub fn settings_ddl(table: &str) -> String {
    let mut ddl = format!(
        "CREATE TABLE {table} (_id INTEGER PRIMARY KEY AUTOINCREMENT, packageName TEXT, uid INTEGER"
    );
    for category in Category::ALL {
        ddl.push_str(", ");
        ddl.push_str(category.column());
        ddl.push_str(" INTEGER");
    }
    ddl.push_str(", defaultDeny INTEGER)");
    ddl
}

/// Create every table of the current layout with default global flags.
pub fn create_tables(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(&settings_ddl(TABLE_SETTINGS))?;
    conn.execute_batch(CREATE_ALLOWED_CONTACTS)?;
    conn.execute_batch(CREATE_MAP)?;
    insert_default_flags(conn)?;
    set_value(conn, SETTING_DB_VERSION, &SCHEMA_VERSION.to_string())?;
    debug!(version = SCHEMA_VERSION, "created settings tables");
    Ok(())
}

/// Default global flags, leaving existing values alone.
pub(crate) fn insert_default_flags(conn: &Connection) -> StoreResult<()> {
    for name in [SETTING_ENABLED, SETTING_NOTIFICATIONS_ENABLED] {
        conn.execute(
            "INSERT OR IGNORE INTO map (name, value) VALUES (?1, ?2)",
            params![name, VALUE_TRUE],
        )?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Column names of `table`, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub fn get_value(conn: &Connection, name: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM map WHERE name = ?1", params![name], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()?;
    Ok(value.flatten())
}

pub fn set_value(conn: &Connection, name: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO map (name, value) VALUES (?1, ?2)",
        params![name, value],
    )?;
    Ok(())
}

/// Row ids stored for an application, lowest first.
pub fn find_ids(conn: &Connection, app_id: &str) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT _id FROM settings WHERE packageName = ?1 ORDER BY _id")?;
    let ids = stmt
        .query_map(params![app_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn all_app_ids(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT packageName FROM settings WHERE packageName IS NOT NULL ORDER BY packageName",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Row as stored, before tri-state values are resolved.
struct StoredRow {
    id: i64,
    default_deny: bool,
    values: Vec<Option<i64>>,
}

/// Load the record of one application with its allowed contacts.
///
/// Duplicate rows are logged and the lowest row id wins.
pub fn load_record(conn: &Connection, app_id: &str) -> StoreResult<Option<SettingRecord>> {
    let columns: Vec<&str> = Category::ALL.iter().map(|c| c.column()).collect();
    let sql = format!(
        "SELECT _id, defaultDeny, {} FROM settings WHERE packageName = ?1 ORDER BY _id",
        columns.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params![app_id], |row| {
            let mut values = Vec::with_capacity(Category::COUNT);
            for i in 0..Category::COUNT {
                values.push(row.get::<_, Option<i64>>(i + 2)?);
            }
            Ok(StoredRow {
                id: row.get(0)?,
                default_deny: row.get::<_, Option<i64>>(1)?.unwrap_or(0) != 0,
                values,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.len() > 1 {
        warn!(app_id, count = rows.len(), "multiple settings rows for one application, using the first");
    }
    if rows.is_empty() {
        return Ok(None);
    }
    let row = rows.swap_remove(0);

    let mut record = SettingRecord::new(app_id);
    record.id = Some(row.id);
    record.default_deny = row.default_deny;
    for (category, stored) in Category::ALL.iter().zip(&row.values) {
        let value = match stored {
            None => PolicyValue::unresolved(row.default_deny),
            Some(raw) => PolicyValue::from_i64(*raw).ok_or_else(|| {
                StoreError::InvalidRecord(format!(
                    "{app_id}: {} holds unknown value {raw}",
                    category.column()
                ))
            })?,
        };
        record.set(*category, value);
    }
    record.allowed_contacts = load_contacts(conn, row.id)?;
    Ok(Some(record))
}

fn load_contacts(conn: &Connection, settings_id: i64) -> StoreResult<BTreeSet<i64>> {
    let mut stmt = conn.prepare("SELECT contact_id FROM allowed_contacts WHERE settings_id = ?1")?;
    let contacts = stmt
        .query_map(params![settings_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(contacts)
}

fn row_values(record: &SettingRecord) -> Vec<Value> {
    let mut values = Vec::with_capacity(Category::COUNT + 3);
    values.push(Value::Text(record.app_id.clone()));
    values.push(Value::Integer(LEGACY_UID));
    values.push(Value::Integer(i64::from(record.default_deny)));
    values.extend(record.values().map(|(_, v)| Value::Integer(v.as_i64())));
    values
}

fn row_columns() -> Vec<&'static str> {
    let mut columns = vec!["packageName", "uid", "defaultDeny"];
    columns.extend(Category::ALL.iter().map(|c| c.column()));
    columns
}

fn insert_row(conn: &Connection, record: &SettingRecord) -> StoreResult<i64> {
    let columns = row_columns();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO settings ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(row_values(record)))?;
    Ok(conn.last_insert_rowid())
}

fn update_row(conn: &Connection, id: i64, record: &SettingRecord) -> StoreResult<bool> {
    let columns = row_columns();
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE settings SET {} WHERE _id = ?{}",
        assignments.join(", "),
        columns.len() + 1
    );
    let mut values = row_values(record);
    values.push(Value::Integer(id));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

/// Insert or update the record and replace its allowed contacts.
/// Returns the row id.
///
/// A known row id is tried first, then the application id. Several rows for
/// one application id is an integrity violation.
pub fn save_record(conn: &Connection, record: &SettingRecord) -> StoreResult<i64> {
    let id = match record.id {
        Some(id) if update_row(conn, id, record)? => id,
        _ => {
            let ids = find_ids(conn, &record.app_id)?;
            match ids.as_slice() {
                [] => insert_row(conn, record)?,
                [id] => {
                    update_row(conn, *id, record)?;
                    *id
                }
                _ => {
                    return Err(StoreError::DuplicateRecords {
                        app_id: record.app_id.clone(),
                        count: ids.len(),
                    })
                }
            }
        }
    };
    replace_contacts(conn, id, &record.allowed_contacts)?;
    Ok(id)
}

fn replace_contacts(conn: &Connection, settings_id: i64, contacts: &BTreeSet<i64>) -> StoreResult<()> {
    conn.execute("DELETE FROM allowed_contacts WHERE settings_id = ?1", params![settings_id])?;
    let mut stmt =
        conn.prepare("INSERT INTO allowed_contacts (settings_id, contact_id) VALUES (?1, ?2)")?;
    for contact in contacts {
        stmt.execute(params![settings_id, contact])?;
    }
    Ok(())
}

/// Remove every row of an application and its contacts.
/// Returns the number of settings rows removed.
pub fn delete_record(conn: &Connection, app_id: &str) -> StoreResult<usize> {
    for id in find_ids(conn, app_id)? {
        conn.execute("DELETE FROM allowed_contacts WHERE settings_id = ?1", params![id])?;
    }
    let removed = conn.execute("DELETE FROM settings WHERE packageName = ?1", params![app_id])?;
    Ok(removed)
}

/// Remove every application not in `keep`. Returns the removed ids.
pub fn purge_records(conn: &Connection, keep: &HashSet<String>) -> StoreResult<Vec<String>> {
    let mut removed = Vec::new();
    for app_id in all_app_ids(conn)? {
        if !keep.contains(&app_id) {
            delete_record(conn, &app_id)?;
            removed.push(app_id);
        }
    }
    Ok(removed)
}
