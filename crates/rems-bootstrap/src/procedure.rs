//! The bootstrap procedure.
//!
//! Each call to [`BootstrapProcedure::run`] is an isolated attempt that
//! converges the target role and database to the same end state no matter
//! how many times, or how concurrently, it is invoked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use rems_core::{BootstrapSettings, SecretSource, is_valid_identifier};

use crate::admin::{AdminDatabase, OwnershipStrategy};
use crate::error::{AdminError, BootstrapError, BootstrapResult};
use crate::outcome::{BootstrapOutcome, BootstrapRequest, RoleCredential};
use crate::postgres::PgAdmin;
use crate::secrets::{EnvSecretStore, FileSecretStore, SecretStore};

/// Attempts for a role statement that lost a catalogue-row race.
const ROLE_STATEMENT_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// The fixed role and database names the procedure converges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTarget {
    role_name: String,
    database_name: String,
}

impl BootstrapTarget {
    pub fn new(role_name: &str, database_name: &str) -> BootstrapResult<Self> {
        for (field, value) in [("role_name", role_name), ("database_name", database_name)] {
            if !is_valid_identifier(value) {
                return Err(BootstrapError::InvalidIdentifier {
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(Self {
            role_name: role_name.to_string(),
            database_name: database_name.to_string(),
        })
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }
}

pub struct BootstrapProcedure {
    admin: Arc<dyn AdminDatabase>,
    secrets: Arc<dyn SecretStore>,
    target: BootstrapTarget,
    strategy: OwnershipStrategy,
}

impl BootstrapProcedure {
    pub fn new(
        admin: Arc<dyn AdminDatabase>,
        secrets: Arc<dyn SecretStore>,
        target: BootstrapTarget,
        strategy: OwnershipStrategy,
    ) -> Self {
        Self {
            admin,
            secrets,
            target,
            strategy,
        }
    }

    /// Build a procedure from validated settings. The admin connection is
    /// opened on first use, so an unreachable server becomes an `ERROR`
    /// outcome of `run` rather than a construction failure.
    pub fn from_settings(settings: &BootstrapSettings) -> BootstrapResult<Self> {
        let url = settings
            .database_url
            .as_deref()
            .ok_or_else(|| BootstrapError::Connect("no database_url configured".to_string()))?;
        let timeout = settings
            .connect_timeout()
            .map_err(|e| BootstrapError::Connect(e.to_string()))?;
        let admin = PgAdmin::connect_lazy(url, timeout)
            .map_err(|e| BootstrapError::Connect(e.to_string()))?;

        let secrets: Arc<dyn SecretStore> = match settings.secret_source {
            SecretSource::Env => Arc::new(EnvSecretStore::new(settings.secret_env_prefix.as_deref())),
            SecretSource::File => {
                let dir = settings.secret_dir.clone().ok_or_else(|| {
                    BootstrapError::Connect("no secret_dir configured".to_string())
                })?;
                Arc::new(FileSecretStore::new(dir))
            }
        };

        Ok(Self::new(
            Arc::new(admin),
            secrets,
            BootstrapTarget::new(&settings.role_name, &settings.database_name)?,
            OwnershipStrategy::from_mode(settings.ownership, settings.admin_role.clone()),
        ))
    }

    pub fn target(&self) -> &BootstrapTarget {
        &self.target
    }

    /// Run one bootstrap attempt. Never fails: every error becomes an
    /// `ERROR` outcome carrying the message.
    pub async fn run(&self, request: &BootstrapRequest) -> BootstrapOutcome {
        match self.try_run(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    role = %self.target.role_name,
                    database = %self.target.database_name,
                    error = %e,
                    "bootstrap failed"
                );
                BootstrapOutcome::error(e.to_string())
            }
        }
    }

    async fn try_run(&self, request: &BootstrapRequest) -> BootstrapResult<BootstrapOutcome> {
        let secret_name = request
            .secret_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(BootstrapError::MissingSecretName)?;

        let secret = self
            .secrets
            .fetch(secret_name)
            .await?
            .ok_or_else(|| BootstrapError::MissingSecret(secret_name.to_string()))?;
        let credential = RoleCredential::from_secret(&self.target.role_name, &secret);
        let redact = |step: &'static str, e: AdminError| BootstrapError::Admin {
            step,
            source: e.redact(&credential.password),
        };

        let role = credential.username.as_str();
        let database = self.target.database_name.as_str();

        match retry_conflicts("create role", || self.admin.create_role(role)).await {
            Ok(()) => info!(%role, "role created"),
            Err(AdminError::RoleExists(_)) => debug!(%role, "role already exists, skipping"),
            Err(e) => return Err(redact("create role", e)),
        }

        retry_conflicts("set role password", || {
            self.admin.set_role_password(role, &credential.password)
        })
        .await
        .map_err(|e| redact("set role password", e))?;
        debug!(%role, "role password applied");

        if self
            .admin
            .database_exists(database)
            .await
            .map_err(|e| redact("check database", e))?
        {
            info!(%database, "database already exists");
            return Ok(BootstrapOutcome::already_exists());
        }

        match self
            .strategy
            .ensure_database(self.admin.as_ref(), database, role)
            .await
        {
            Ok(()) => {
                info!(%database, owner = %role, "database created");
                Ok(BootstrapOutcome::created())
            }
            Err(AdminError::DatabaseExists(_)) => {
                info!(%database, "database created concurrently by another invocation");
                Ok(BootstrapOutcome::already_exists())
            }
            Err(e) => {
                // A racing invocation may have created the database while our
                // own attempt tripped over its grant/revoke.
                match self.admin.database_exists(database).await {
                    Ok(true) => {
                        warn!(%database, error = %e, "create failed but database now exists");
                        Ok(BootstrapOutcome::already_exists())
                    }
                    _ => Err(redact("create database", e)),
                }
            }
        }
    }
}

/// Re-run `op` while it fails with a retryable conflict. Concurrent
/// invocations write the same role row; the later writer wins.
async fn retry_conflicts<F, Fut>(step: &'static str, mut op: F) -> Result<(), AdminError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), AdminError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < ROLE_STATEMENT_ATTEMPTS => {
                debug!(step, attempt, error = %e, "concurrent update conflict, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAdmin;
    use crate::outcome::BootstrapStatus;
    use crate::secrets::StaticSecretStore;
    use tokio::sync::Barrier;

    const SECRET: &str = "RemsDatabaseSecret";

    fn procedure(db: &MemoryAdmin, secrets: &StaticSecretStore) -> BootstrapProcedure {
        BootstrapProcedure::new(
            Arc::new(db.clone()),
            Arc::new(secrets.clone()),
            BootstrapTarget::new("rems", "rems").unwrap(),
            OwnershipStrategy::GrantMembership { admin_role: None },
        )
    }

    fn fixture() -> (MemoryAdmin, StaticSecretStore) {
        (
            MemoryAdmin::managed("postgres"),
            StaticSecretStore::new().with_secret(SECRET, "pw-1"),
        )
    }

    #[tokio::test]
    async fn first_run_creates_role_and_database() {
        let (db, secrets) = fixture();
        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;

        assert_eq!(outcome, BootstrapOutcome::created());
        assert_eq!(db.role_password("rems").as_deref(), Some("pw-1"));
        assert_eq!(db.database_owner("rems").as_deref(), Some("rems"));
        assert!(!db.is_member("postgres", "rems"));
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let (db, secrets) = fixture();
        let proc = procedure(&db, &secrets);
        let req = BootstrapRequest::new(SECRET);

        assert_eq!(proc.run(&req).await.status, BootstrapStatus::DbCreated);
        assert_eq!(proc.run(&req).await.status, BootstrapStatus::DbAlreadyExists);
        assert_eq!(proc.run(&req).await.status, BootstrapStatus::DbAlreadyExists);
    }

    #[tokio::test]
    async fn password_converges_to_current_secret() {
        let (db, secrets) = fixture();
        let proc = procedure(&db, &secrets);
        let req = BootstrapRequest::new(SECRET);

        proc.run(&req).await;
        secrets.set(SECRET, "pw-2");
        let outcome = proc.run(&req).await;

        assert_eq!(outcome.status, BootstrapStatus::DbAlreadyExists);
        assert_eq!(db.role_password("rems").as_deref(), Some("pw-2"));
    }

    #[tokio::test]
    async fn json_secret_password_is_applied() {
        let db = MemoryAdmin::managed("postgres");
        let secrets = StaticSecretStore::new()
            .with_secret(SECRET, r#"{"username":"postgres","password":"from-json"}"#);
        procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(db.role_password("rems").as_deref(), Some("from-json"));
    }

    #[tokio::test]
    async fn existing_database_is_not_repaired() {
        let (db, secrets) = fixture();
        db.create_database_unchecked("rems", "postgres");

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::DbAlreadyExists);
        assert_eq!(db.database_owner("rems").as_deref(), Some("postgres"));
        assert!(!db.calls().contains(&"grant_role_to_admin".to_string()));
    }

    #[tokio::test]
    async fn concurrent_first_runs_never_both_error() {
        let barrier = Arc::new(Barrier::new(2));
        let db = MemoryAdmin::managed("postgres").with_exists_barrier(barrier);
        let secrets = StaticSecretStore::new().with_secret(SECRET, "pw-1");

        let a = procedure(&db, &secrets);
        let b = procedure(&db, &secrets);
        let req = BootstrapRequest::new(SECRET);

        let (ra, rb) = tokio::join!(a.run(&req), b.run(&req));
        let statuses = [ra.status, rb.status];

        assert!(!statuses.contains(&BootstrapStatus::Error), "{ra:?} {rb:?}");
        assert!(statuses.contains(&BootstrapStatus::DbCreated));
        assert_eq!(db.database_owner("rems").as_deref(), Some("rems"));
        assert!(!db.is_member("postgres", "rems"));
    }

    #[tokio::test]
    async fn create_failure_with_database_present_is_already_exists() {
        let (db, secrets) = fixture();
        db.lose_next_create_race();

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::DbAlreadyExists);
    }

    #[tokio::test]
    async fn create_failure_without_database_is_error() {
        let (db, secrets) = fixture();
        db.fail_on(
            "create_database",
            AdminError::Other("disk full".to_string()),
        );

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::Error);
        assert_eq!(
            outcome.message.as_deref(),
            Some("create database failed: disk full")
        );
        assert!(!db.is_member("postgres", "rems"));
    }

    #[tokio::test]
    async fn missing_secret_name_is_error() {
        let (db, secrets) = fixture();
        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::default()).await;
        assert_eq!(outcome.status, BootstrapStatus::Error);
        assert!(outcome.message.unwrap().contains("secretName"));
        assert!(db.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_value_is_error() {
        let (db, secrets) = fixture();
        let outcome = procedure(&db, &secrets)
            .run(&BootstrapRequest::new("NoSuchSecret"))
            .await;
        assert_eq!(
            outcome,
            BootstrapOutcome::error("missing secret string from secret 'NoSuchSecret'")
        );
    }

    #[tokio::test]
    async fn unexpected_role_error_is_reported() {
        let (db, secrets) = fixture();
        db.fail_on(
            "create_role",
            AdminError::InsufficientPrivilege("permission denied to create role".into()),
        );

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::Error);
        assert!(!db.calls().contains(&"set_role_password".to_string()));
    }

    #[tokio::test]
    async fn password_never_leaks_into_error_message() {
        let (db, secrets) = fixture();
        db.fail_on(
            "set_role_password",
            AdminError::Other("syntax error at or near 'pw-1'".into()),
        );

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        let message = outcome.message.unwrap();
        assert!(!message.contains("pw-1"), "{message}");
        assert!(message.starts_with("set role password failed"));
    }

    #[tokio::test]
    async fn password_conflict_is_retried() {
        let (db, secrets) = fixture();
        db.conflict_next("set_role_password", 1);

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome, BootstrapOutcome::created());
        assert_eq!(db.role_password("rems").as_deref(), Some("pw-1"));
        let attempts = db.calls().iter().filter(|c| *c == "set_role_password").count();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn concurrent_runs_converge_through_password_conflict() {
        let barrier = Arc::new(Barrier::new(2));
        let db = MemoryAdmin::managed("postgres").with_exists_barrier(barrier);
        db.conflict_next("set_role_password", 1);
        let secrets = StaticSecretStore::new().with_secret(SECRET, "pw-1");

        let a = procedure(&db, &secrets);
        let b = procedure(&db, &secrets);
        let req = BootstrapRequest::new(SECRET);

        let (ra, rb) = tokio::join!(a.run(&req), b.run(&req));
        assert!(ra.status.is_ok(), "{ra:?}");
        assert!(rb.status.is_ok(), "{rb:?}");
        assert!([ra.status, rb.status].contains(&BootstrapStatus::DbCreated));
        assert_eq!(db.role_password("rems").as_deref(), Some("pw-1"));
    }

    #[tokio::test]
    async fn persistent_conflict_gives_up() {
        let (db, secrets) = fixture();
        db.conflict_next("set_role_password", 100);

        let outcome = procedure(&db, &secrets).run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::Error);
        assert!(outcome.message.unwrap().contains("concurrent update conflict"));
        let attempts = db.calls().iter().filter(|c| *c == "set_role_password").count();
        assert_eq!(attempts, ROLE_STATEMENT_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn unreachable_database_is_error_outcome() {
        let admin = PgAdmin::connect_lazy(
            "postgres://postgres:pw@127.0.0.1:1/postgres",
            Duration::from_millis(300),
        )
        .unwrap();
        let secrets = StaticSecretStore::new().with_secret(SECRET, "pw-1");
        let proc = BootstrapProcedure::new(
            Arc::new(admin),
            Arc::new(secrets),
            BootstrapTarget::new("rems", "rems").unwrap(),
            OwnershipStrategy::GrantMembership { admin_role: None },
        );

        let outcome = proc.run(&BootstrapRequest::new(SECRET)).await;
        assert_eq!(outcome.status, BootstrapStatus::Error);
        let message = outcome.message.unwrap();
        assert!(message.starts_with("create role failed"), "{message}");
        assert!(!message.contains("pw-1"));
    }

    #[tokio::test]
    async fn from_settings_does_not_dial() {
        let settings = BootstrapSettings {
            database_url: Some("postgres://postgres:pw@127.0.0.1:1/postgres".into()),
            ..BootstrapSettings::default()
        };
        let proc = BootstrapProcedure::from_settings(&settings).unwrap();
        assert_eq!(proc.target().role_name(), "rems");
    }

    #[test]
    fn target_rejects_bad_identifiers() {
        assert!(BootstrapTarget::new("rems", "rems").is_ok());
        assert!(matches!(
            BootstrapTarget::new("rems;drop", "rems"),
            Err(BootstrapError::InvalidIdentifier { field: "role_name", .. })
        ));
        assert!(matches!(
            BootstrapTarget::new("rems", ""),
            Err(BootstrapError::InvalidIdentifier { field: "database_name", .. })
        ));
    }
}
