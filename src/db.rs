use crate::activation::{Flag, FlagTransition};
use crate::error::{BrokerError, Result};
use crate::models::{BrokerConfig, BrokerEndpoint, ConnectionStatus, Protocol, Secret};
use crate::store::ConfigRepository;
use log::{error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS broker_configs (
    id INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    protocol TEXT NOT NULL DEFAULT 'mqtt',
    host TEXT NOT NULL,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    username TEXT,
    password TEXT,
    client_id TEXT NOT NULL,
    qos INTEGER NOT NULL DEFAULT 0 CHECK (qos IN (0, 1, 2)),
    clean_session BOOLEAN NOT NULL DEFAULT 1,
    keepalive INTEGER NOT NULL DEFAULT 60,
    connect_timeout INTEGER NOT NULL DEFAULT 30000,
    reconnect_period INTEGER NOT NULL DEFAULT 1000,
    retain BOOLEAN NOT NULL DEFAULT 0,
    fallback_brokers TEXT NOT NULL DEFAULT '[]',
    is_active BOOLEAN NOT NULL DEFAULT 0,
    is_enabled BOOLEAN NOT NULL DEFAULT 0,
    connection_status TEXT NOT NULL DEFAULT 'disconnected',
    last_connected TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const COLUMNS: &str = "id, name, protocol, host, port, username, password, client_id, qos, \
    clean_session, keepalive, connect_timeout, reconnect_period, retain, fallback_brokers, \
    is_active, is_enabled, connection_status, last_connected, last_error, created_at, updated_at";

/// SQLite-backed repository. Rows keep SQLite's implicit rowid, so listing by
/// rowid yields insertion order even for caller-chosen ids.
pub struct SqliteRepository {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteRepository {
    /// Opens (or creates) the database file and makes sure the schema exists.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path.as_ref())
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder().max_size(8).build(manager)?;
        let repo = Self { pool };
        repo.initialize_db()?;
        Ok(repo)
    }

    /// Private in-memory database. Limited to one pooled connection because
    /// every SQLite in-memory connection is its own database.
    pub fn open_in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        let repo = Self { pool };
        repo.initialize_db()?;
        Ok(repo)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.pool.get()?;
        info!("Initializing database schema...");

        match conn.execute_batch(SCHEMA) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn query_one(conn: &rusqlite::Connection, id: i64) -> Result<Option<BrokerConfig>> {
        let sql = format!("SELECT {} FROM broker_configs WHERE id = ?1", COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_config).optional()?)
    }
}

impl ConfigRepository for SqliteRepository {
    fn next_id(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        let id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM broker_configs",
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn insert(&self, config: &BrokerConfig) -> Result<()> {
        let conn = self.pool.get()?;
        let fallback = serde_json::to_string(&config.fallback_brokers)?;
        let sql = format!(
            "INSERT INTO broker_configs ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            COLUMNS
        );
        let inserted = conn.execute(
            &sql,
            params![
                config.id,
                config.name,
                config.protocol.as_str(),
                config.host,
                config.port,
                config.username,
                config.password.as_ref().map(Secret::expose),
                config.client_id,
                config.qos,
                config.clean_session,
                config.keepalive,
                config.connect_timeout,
                config.reconnect_period,
                config.retain,
                fallback,
                config.is_active,
                config.is_enabled,
                config.connection_status.as_str(),
                config.last_connected,
                config.last_error,
                config.created_at,
                config.updated_at,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(BrokerError::DuplicateId(config.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find(&self, id: i64) -> Result<Option<BrokerConfig>> {
        let conn = self.pool.get()?;
        Self::query_one(&conn, id)
    }

    fn list(&self) -> Result<Vec<BrokerConfig>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {} FROM broker_configs ORDER BY rowid", COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_config)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn replace(&self, config: &BrokerConfig) -> Result<()> {
        let conn = self.pool.get()?;
        let fallback = serde_json::to_string(&config.fallback_brokers)?;
        let changed = conn.execute(
            r#"
            UPDATE broker_configs SET
                name = ?2, protocol = ?3, host = ?4, port = ?5, username = ?6, password = ?7,
                client_id = ?8, qos = ?9, clean_session = ?10, keepalive = ?11,
                connect_timeout = ?12, reconnect_period = ?13, retain = ?14,
                fallback_brokers = ?15, is_active = ?16, is_enabled = ?17,
                connection_status = ?18, last_connected = ?19, last_error = ?20,
                updated_at = ?21
            WHERE id = ?1
            "#,
            params![
                config.id,
                config.name,
                config.protocol.as_str(),
                config.host,
                config.port,
                config.username,
                config.password.as_ref().map(Secret::expose),
                config.client_id,
                config.qos,
                config.clean_session,
                config.keepalive,
                config.connect_timeout,
                config.reconnect_period,
                config.retain,
                fallback,
                config.is_active,
                config.is_enabled,
                config.connection_status.as_str(),
                config.last_connected,
                config.last_error,
                config.updated_at,
            ],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(config.id));
        }
        Ok(())
    }

    fn remove(&self, id: i64) -> Result<Option<BrokerConfig>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = Self::query_one(&tx, id)?;
        if existing.is_some() {
            tx.execute("DELETE FROM broker_configs WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(existing)
    }

    fn apply_transition(&self, transition: FlagTransition, now: OffsetDateTime) -> Result<BrokerConfig> {
        let id = transition.id();
        let column = transition.flag().column();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM broker_configs WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(BrokerError::NotFound(id));
        }

        match transition {
            FlagTransition::Exclusive { .. } => {
                // One statement: the old holder is lowered and the new one
                // raised in the same write.
                let sql = format!(
                    "UPDATE broker_configs SET \
                         {col} = (id = ?1), \
                         updated_at = CASE WHEN id = ?1 OR {col} != (id = ?1) THEN ?2 ELSE updated_at END \
                     WHERE id = ?1 OR {col} = 1",
                    col = column
                );
                tx.execute(&sql, params![id, now])?;
            }
            FlagTransition::Clear { .. } => {
                let sql = format!(
                    "UPDATE broker_configs SET {} = 0, updated_at = ?2 WHERE id = ?1",
                    column
                );
                tx.execute(&sql, params![id, now])?;
            }
        }

        let config = Self::query_one(&tx, id)?.ok_or(BrokerError::NotFound(id))?;
        tx.commit()?;
        Ok(config)
    }

    fn find_flagged(&self, flag: Flag) -> Result<Option<BrokerConfig>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {} FROM broker_configs WHERE {} = 1 ORDER BY rowid LIMIT 1",
            COLUMNS,
            flag.column()
        );
        Ok(conn.query_row(&sql, [], row_to_config).optional()?)
    }
}

fn conversion_error(index: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<BrokerConfig> {
    let protocol: String = row.get(2)?;
    let protocol: Protocol = protocol.parse().map_err(|e| conversion_error(2, e))?;
    let password: Option<String> = row.get(6)?;
    let fallback: String = row.get(14)?;
    let fallback_brokers: Vec<BrokerEndpoint> =
        serde_json::from_str(&fallback).map_err(|e| conversion_error(14, e))?;
    let status: String = row.get(17)?;
    let connection_status: ConnectionStatus = status.parse().map_err(|e| conversion_error(17, e))?;

    Ok(BrokerConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        protocol,
        host: row.get(3)?,
        port: row.get(4)?,
        username: row.get(5)?,
        password: password.map(Secret::new),
        client_id: row.get(7)?,
        qos: row.get(8)?,
        clean_session: row.get(9)?,
        keepalive: row.get(10)?,
        connect_timeout: row.get(11)?,
        reconnect_period: row.get(12)?,
        retain: row.get(13)?,
        fallback_brokers,
        is_active: row.get(15)?,
        is_enabled: row.get(16)?,
        connection_status,
        last_connected: row.get(18)?,
        last_error: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}
