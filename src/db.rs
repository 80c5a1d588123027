use crate::TriageError;
use crate::schema::MIGRATIONS;
use crate::similarity::{decode_embedding, l2_distance};
use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use std::path::Path;

#[cfg(unix)]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        // Only set permissions on dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Apply standard PRAGMAs (before migrations).
fn apply_pragmas(conn: &Connection, readonly: bool) -> Result<(), TriageError> {
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    if !readonly {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Register scalar functions used by store queries.
///
/// `l2_distance(a, b)` takes two little-endian f32 blobs and errors when
/// their lengths differ.
pub fn register_udfs(conn: &Connection) -> Result<(), TriageError> {
    conn.create_scalar_function(
        "l2_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Vec<u8> = ctx.get(0)?;
            let b: Vec<u8> = ctx.get(1)?;
            let a = decode_embedding(&a).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            let b = decode_embedding(&b).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            if a.len() != b.len() {
                return Err(rusqlite::Error::UserFunctionError(
                    format!("l2_distance: {} vs {} components", a.len(), b.len()).into(),
                ));
            }
            Ok(l2_distance(&a, &b))
        },
    )?;
    Ok(())
}

// --- Public open functions ---

pub fn open_db_readonly(db_path: &Path) -> Result<Connection, TriageError> {
    if !db_path.exists() {
        return Err(TriageError::Config(format!(
            "database not found: {}",
            db_path.display()
        )));
    }

    let conn = Connection::open_with_flags(
        db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    apply_pragmas(&conn, true)?;
    register_udfs(&conn)?;
    Ok(conn)
}

pub fn open_db(db_path: &Path) -> Result<Connection, TriageError> {
    ensure_parent_dir(db_path)?;

    let mut conn = Connection::open(db_path)?;
    apply_pragmas(&conn, false)?;
    MIGRATIONS.to_latest(&mut conn)?;
    register_udfs(&conn)?;

    #[cfg(unix)]
    {
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    Ok(conn)
}

/// Fresh migrated in-memory database.
pub fn open_memory_db() -> Result<Connection, TriageError> {
    let mut conn = Connection::open_in_memory()?;
    apply_pragmas(&conn, true)?;
    MIGRATIONS.to_latest(&mut conn)?;
    register_udfs(&conn)?;
    Ok(conn)
}
