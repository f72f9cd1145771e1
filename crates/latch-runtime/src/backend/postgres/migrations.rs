//! Schema installation, serialized across nodes by an advisory lock.

use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use latch_core::error::{LatchError, Result};

/// "LATCH" in ASCII.
const MIGRATION_LOCK_ID: i64 = 0x4C41544348;

const LATCH_INTERNAL_SQL: &str = include_str!("../../../migrations/0000_latch_internal.sql");

#[derive(Debug, Clone)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Migrations shipped with the crate, in application order.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_latch_internal", LATCH_INTERNAL_SQL)]
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply every pending builtin migration. Returns the names applied.
    pub async fn run(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await.map_err(super::pool::db_err)?;

        // Session-level advisory locks belong to one connection.
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
            .map_err(|e| LatchError::Database(format!("Failed to acquire migration lock: {}", e)))?;
        debug!("Migration lock acquired");

        let result = apply_pending(&mut conn).await;

        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *conn)
            .await
        {
            warn!("Failed to release migration lock: {}", e);
        }
        result
    }
}

async fn apply_pending(conn: &mut sqlx::PgConnection) -> Result<Vec<String>> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS latch_migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) UNIQUE NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| LatchError::Database(format!("Failed to create migrations table: {}", e)))?;

    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM latch_migrations")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| LatchError::Database(format!("Failed to get applied migrations: {}", e)))?;
    let applied: HashSet<String> = rows.into_iter().map(|(name,)| name).collect();
    debug!("Already applied migrations: {:?}", applied);

    let mut newly_applied = Vec::new();
    for migration in builtin_migrations() {
        if applied.contains(&migration.name) {
            continue;
        }
        info!("Applying migration: {}", migration.name);
        for statement in split_sql_statements(&migration.sql) {
            if is_comment_only(&statement) {
                continue;
            }
            sqlx::query(&statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    LatchError::Database(format!(
                        "Failed to apply migration '{}': {}",
                        migration.name, e
                    ))
                })?;
        }
        sqlx::query("INSERT INTO latch_migrations (name) VALUES ($1)")
            .bind(&migration.name)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                LatchError::Database(format!(
                    "Failed to record migration '{}': {}",
                    migration.name, e
                ))
            })?;
        info!("Migration applied: {}", migration.name);
        newly_applied.push(migration.name);
    }
    Ok(newly_applied)
}

fn is_comment_only(statement: &str) -> bool {
    statement.lines().all(|l| {
        let l = l.trim();
        l.is_empty() || l.starts_with("--")
    })
}

/// Split SQL on top-level semicolons. Bodies inside `$$` or `$tag$`
/// quoting stay whole.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut dollar_tag: Option<String> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);

        if c == '$' {
            let mut tag = String::from("$");
            while let Some(&next) = chars.peek() {
                if next == '$' || next.is_alphanumeric() || next == '_' {
                    tag.push(next);
                    current.push(next);
                    chars.next();
                    if next == '$' {
                        break;
                    }
                } else {
                    break;
                }
            }
            if tag.len() >= 2 && tag.ends_with('$') {
                match &dollar_tag {
                    Some(open) if *open == tag => dollar_tag = None,
                    None => dollar_tag = Some(tag),
                    Some(_) => {}
                }
            }
        }

        if c == ';' && dollar_tag.is_none() {
            let stmt = current.trim().trim_end_matches(';').trim();
            if !stmt.is_empty() {
                statements.push(stmt.to_string());
            }
            current.clear();
        }
    }

    let stmt = current.trim().trim_end_matches(';').trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schema_defines_tables() {
        let migrations = builtin_migrations();
        assert_eq!(migrations[0].name, "0000_latch_internal");
        let sql = &migrations[0].sql;
        for table in [
            "latch_sessions",
            "latch_records",
            "latch_log_heads",
            "latch_log_records",
            "latch_log_offsets",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table)),
                "missing {}",
                table
            );
        }
    }

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_sql_statements("SELECT 1; SELECT 2;SELECT 3");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_split_keeps_function_body_whole() {
        let sql = r#"
CREATE FUNCTION f() RETURNS void AS $body$
BEGIN
    PERFORM 1;
    PERFORM 2;
END;
$body$ LANGUAGE plpgsql;

SELECT 3;
"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("PERFORM 2;"));
        assert!(stmts[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "SELECT 3");
    }

    #[test]
    fn test_builtin_schema_splits_trigger_function_once() {
        let stmts = split_sql_statements(LATCH_INTERNAL_SQL);
        let functions: Vec<_> = stmts
            .iter()
            .filter(|s| s.contains("CREATE OR REPLACE FUNCTION"))
            .collect();
        assert_eq!(functions.len(), 1);
        assert!(functions[0].contains("pg_notify"));
        assert!(functions[0].contains("RETURN NULL;"));
    }

    #[test]
    fn test_comment_only_detection() {
        assert!(is_comment_only("-- just a note\n\n"));
        assert!(!is_comment_only("-- note\nSELECT 1"));
    }
}
