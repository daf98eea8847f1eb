//! Startup schema setup for the Postgres-backed stores.
//!
//! `scripts/pg/schema/*.sql` runs first, then `scripts/pg/indexes/*.sql`, each
//! folder in file-name order. Every script is idempotent, so this runs on each
//! boot. Afterwards the tables the stores query are checked for, so a broken
//! script fails startup instead of the first chat request.

use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::config::server::DatabaseSection;

/// Postgres schema owning every Slipstream table.
pub const SCHEMA: &str = "slipstream";

/// Script folders under the configured root, in the order they run.
const FOLDERS: [&str; 2] = ["schema", "indexes"];

/// Tables the checkpoint and conversation stores read and write.
pub const REQUIRED_TABLES: [&str; 5] = [
    "stream_checkpoints",
    "conversations",
    "messages",
    "provider_keys",
    "attachments",
];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("SQL script directory {0} does not exist")]
    NoScripts(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("script {path} failed: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("could not inspect the slipstream schema: {0}")]
    Inspect(#[source] sqlx::Error),
    #[error("tables missing from the slipstream schema after setup: {}", .0.join(", "))]
    MissingTables(Vec<String>),
}

/// Checks the pool can reach the server at all.
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Applies the SQL scripts under `database.bootstrap_path` and verifies the
/// result.
///
/// # Errors
/// Fails when the script root is missing, a script does not apply, or a
/// required table is still absent afterwards.
pub async fn prepare(pool: &PgPool, config: &DatabaseSection) -> Result<(), SchemaError> {
    let root = &config.bootstrap_path;
    if !root.is_dir() {
        return Err(SchemaError::NoScripts(root.clone()));
    }

    for folder in FOLDERS {
        let scripts = sql_scripts(&root.join(folder))?;
        debug!(folder, count = scripts.len(), "applying SQL scripts");
        for path in scripts {
            apply(pool, &path).await?;
        }
    }

    let present: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = $1",
    )
    .bind(SCHEMA)
    .fetch_all(pool)
    .await
    .map_err(SchemaError::Inspect)?;

    let missing = missing_tables(&present);
    if !missing.is_empty() {
        return Err(SchemaError::MissingTables(missing));
    }

    info!(schema = SCHEMA, tables = REQUIRED_TABLES.len(), "database schema ready");
    Ok(())
}

/// Required tables absent from `present`.
fn missing_tables(present: &[String]) -> Vec<String> {
    REQUIRED_TABLES
        .iter()
        .filter(|table| !present.iter().any(|name| name == *table))
        .map(|table| (*table).to_string())
        .collect()
}

/// `.sql` files directly inside `dir`, sorted by file name. A folder that does
/// not exist holds no scripts.
fn sql_scripts(dir: &Path) -> Result<Vec<PathBuf>, SchemaError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let io = |source| SchemaError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut scripts = std::fs::read_dir(dir)
        .map_err(io)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io)?;
    scripts.retain(|path| {
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
    });
    scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(scripts)
}

async fn apply(pool: &PgPool, path: &Path) -> Result<(), SchemaError> {
    let sql = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if sql.trim().is_empty() {
        warn!(script = %path.display(), "empty SQL script");
        return Ok(());
    }

    // raw_sql: scripts carry several statements.
    sqlx::raw_sql(&sql)
        .execute(pool)
        .await
        .map_err(|source| SchemaError::Script {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(script = %path.display(), "applied SQL script");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shipped(folder: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../scripts/pg")
            .join(folder)
    }

    #[test]
    fn scripts_run_in_file_name_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("020_messages.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("010_checkpoints.SQL"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("notes.md"), "not a script").unwrap();
        std::fs::create_dir(dir.path().join("old.sql")).unwrap();

        let names: Vec<_> = sql_scripts(dir.path())
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["010_checkpoints.SQL", "020_messages.sql"]);
    }

    #[test]
    fn absent_folder_has_no_scripts() {
        let dir = tempdir().unwrap();
        assert!(sql_scripts(&dir.path().join("indexes")).unwrap().is_empty());
    }

    #[test]
    fn shipped_scripts_create_every_required_table() {
        let sql: String = sql_scripts(&shipped("schema"))
            .unwrap()
            .iter()
            .map(|path| std::fs::read_to_string(path).unwrap())
            .collect();

        assert!(sql.contains(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}")));
        for table in REQUIRED_TABLES {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {SCHEMA}.{table} (")),
                "no script creates {table}"
            );
        }
        assert!(!sql_scripts(&shipped("indexes")).unwrap().is_empty());
    }

    #[test]
    fn missing_tables_are_named() {
        let present = vec!["conversations".to_string(), "messages".to_string()];
        assert_eq!(
            missing_tables(&present),
            ["stream_checkpoints", "provider_keys", "attachments"]
        );

        let all: Vec<String> = REQUIRED_TABLES.iter().map(|t| (*t).to_string()).collect();
        assert!(missing_tables(&all).is_empty());

        let err = SchemaError::MissingTables(missing_tables(&present));
        assert_eq!(
            err.to_string(),
            "tables missing from the slipstream schema after setup: stream_checkpoints, provider_keys, attachments"
        );
    }

    #[tokio::test]
    async fn missing_script_root_fails_before_touching_the_database() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let config = DatabaseSection {
            bootstrap_path: PathBuf::from("/nonexistent/slipstream/scripts"),
            ..DatabaseSection::default()
        };

        let err = prepare(&pool, &config).await.unwrap_err();
        assert!(matches!(err, SchemaError::NoScripts(_)));
    }
}
