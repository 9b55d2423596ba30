//! Postgres implementation of [`AdminDatabase`] over an sqlx pool.
//!
//! DDL cannot take bind parameters, so identifiers go through
//! [`quote_ident`] and the password through [`quote_literal`]. DDL is sent
//! with the simple query protocol (`CREATE DATABASE` refuses to run inside a
//! transaction block).

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::debug;

use crate::admin::AdminDatabase;
use crate::error::{AdminError, AdminResult};

/// SQLSTATE codes the bootstrap procedure cares about.
mod sqlstate {
    pub const DUPLICATE_OBJECT: &str = "42710";
    pub const DUPLICATE_DATABASE: &str = "42P04";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Raised as `XX000` when two sessions update the same catalogue row, e.g.
/// concurrent `ALTER ROLE ... PASSWORD`.
const TUPLE_CONCURRENTLY_UPDATED: &str = "tuple concurrently updated";

/// Which statement produced an error; decides how a unique violation on a
/// system catalogue index is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Statement {
    CreateRole,
    CreateDatabase,
    Other,
}

/// Admin connection to a Postgres instance.
#[derive(Debug, Clone)]
pub struct PgAdmin {
    pool: PgPool,
}

impl PgAdmin {
    /// Single-connection pool; bootstrap is strictly sequential.
    ///
    /// Nothing is dialled here: an unreachable server surfaces from the first
    /// admin call. Must be called within a Tokio runtime.
    pub fn connect_lazy(database_url: &str, timeout: Duration) -> AdminResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_lazy_with(connect_options(database_url)?);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn execute(&self, sql: &str, statement: Statement) -> AdminResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, statement))
    }
}

#[async_trait]
impl AdminDatabase for PgAdmin {
    async fn create_role(&self, role: &str) -> AdminResult<()> {
        debug!(%role, "creating role");
        self.execute(&create_role_sql(role), Statement::CreateRole)
            .await
    }

    async fn set_role_password(&self, role: &str, password: &str) -> AdminResult<()> {
        debug!(%role, "setting role password");
        self.execute(&set_password_sql(role, password), Statement::Other)
            .await
            .map_err(|e| e.redact(password))
    }

    async fn database_exists(&self, database: &str) -> AdminResult<bool> {
        let row: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1")
                .bind(database)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| classify(e, Statement::Other))?;
        Ok(row.is_some())
    }

    async fn grant_role_to_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()> {
        let sql = format!("GRANT {} TO {}", quote_ident(role), role_spec(admin));
        self.execute(&sql, Statement::Other).await
    }

    async fn revoke_role_from_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()> {
        let sql = format!("REVOKE {} FROM {}", quote_ident(role), role_spec(admin));
        self.execute(&sql, Statement::Other).await
    }

    async fn create_database(&self, database: &str, owner: &str) -> AdminResult<()> {
        debug!(%database, %owner, "creating database");
        self.execute(&create_database_sql(database, owner), Statement::CreateDatabase)
            .await
    }
}

fn create_role_sql(role: &str) -> String {
    format!("CREATE ROLE {} WITH LOGIN", quote_ident(role))
}

fn set_password_sql(role: &str, password: &str) -> String {
    format!(
        "ALTER ROLE {} WITH PASSWORD {}",
        quote_ident(role),
        quote_literal(password)
    )
}

fn create_database_sql(database: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} OWNER {}",
        quote_ident(database),
        quote_ident(owner)
    )
}

fn role_spec(admin: Option<&str>) -> String {
    match admin {
        Some(name) => quote_ident(name),
        None => "CURRENT_USER".to_string(),
    }
}

/// Quote an identifier the way Postgres' `quote_ident` does.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal the way Postgres' `quote_literal` does,
/// switching to an `E''` literal when backslashes are present.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if value.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

/// Statement logging is off: `ALTER ROLE ... PASSWORD` carries the secret.
fn connect_options(database_url: &str) -> AdminResult<PgConnectOptions> {
    PgConnectOptions::from_str(database_url)
        .map(|options| options.disable_statement_logging())
        .map_err(|e| AdminError::Other(format!("invalid database url: {e}")))
}

fn classify(err: sqlx::Error, statement: Statement) -> AdminError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(classified) =
            classify_code(db_err.code().as_deref(), db_err.message(), statement)
        {
            return classified;
        }
    }
    AdminError::Other(err.to_string())
}

/// Map a SQLSTATE to the error classes the procedure branches on. `None`
/// means "not special", reported verbatim.
fn classify_code(code: Option<&str>, message: &str, statement: Statement) -> Option<AdminError> {
    let message = message.to_string();
    match (code?, statement) {
        (sqlstate::DUPLICATE_OBJECT, _) => Some(AdminError::RoleExists(message)),
        (sqlstate::DUPLICATE_DATABASE, _) => Some(AdminError::DatabaseExists(message)),
        // Two concurrent CREATEs can collide on the catalogue's unique
        // index instead of reporting the friendly duplicate error.
        (sqlstate::UNIQUE_VIOLATION, Statement::CreateRole) => Some(AdminError::RoleExists(message)),
        (sqlstate::UNIQUE_VIOLATION, Statement::CreateDatabase) => {
            Some(AdminError::DatabaseExists(message))
        }
        (sqlstate::INSUFFICIENT_PRIVILEGE, _) => Some(AdminError::InsufficientPrivilege(message)),
        (sqlstate::SERIALIZATION_FAILURE | sqlstate::DEADLOCK_DETECTED, _) => {
            Some(AdminError::Conflict(message))
        }
        (sqlstate::INTERNAL_ERROR, _) if message.contains(TUPLE_CONCURRENTLY_UPDATED) => {
            Some(AdminError::Conflict(message))
        }
        _ => None,
    }
}
