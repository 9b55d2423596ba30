//! Administrative database seam and ownership strategies.

use async_trait::async_trait;
use tracing::{debug, warn};

use rems_core::OwnershipMode;

use crate::error::{AdminError, AdminResult};

/// Privileged operations the bootstrap procedure needs from the database.
///
/// Implementations classify failures into [`AdminError`] so the procedure can
/// tell an idempotent conflict from a real failure.
#[async_trait]
pub trait AdminDatabase: Send + Sync {
    /// Create a login role. Fails with `RoleExists` if it is already there.
    async fn create_role(&self, role: &str) -> AdminResult<()>;

    async fn set_role_password(&self, role: &str, password: &str) -> AdminResult<()>;

    async fn database_exists(&self, database: &str) -> AdminResult<bool>;

    /// Make `admin` (the connected role when `None`) a member of `role`.
    async fn grant_role_to_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()>;

    async fn revoke_role_from_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()>;

    /// Create `database` owned by `owner`. Fails with `DatabaseExists` if a
    /// database of that name is already there.
    async fn create_database(&self, database: &str, owner: &str) -> AdminResult<()>;
}

/// How a database owned by the service role gets created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipStrategy {
    /// `CREATE DATABASE d OWNER r` straight away.
    Direct,
    /// Grant the service role to the admin role, create, then revoke.
    ///
    /// Managed Postgres admin accounts are not superusers and may only create
    /// databases owned by roles they are members of.
    GrantMembership { admin_role: Option<String> },
}

impl OwnershipStrategy {
    pub fn from_mode(mode: OwnershipMode, admin_role: Option<String>) -> Self {
        match mode {
            OwnershipMode::Direct => OwnershipStrategy::Direct,
            OwnershipMode::GrantMembership => OwnershipStrategy::GrantMembership { admin_role },
        }
    }

    /// Create `database` owned by `owner`.
    ///
    /// With `GrantMembership` the revoke is attempted even when the create
    /// fails, so the admin role never keeps the membership.
    pub async fn ensure_database(
        &self,
        admin: &dyn AdminDatabase,
        database: &str,
        owner: &str,
    ) -> AdminResult<()> {
        match self {
            OwnershipStrategy::Direct => admin.create_database(database, owner).await,
            OwnershipStrategy::GrantMembership { admin_role } => {
                let admin_role = admin_role.as_deref();
                admin.grant_role_to_admin(owner, admin_role).await?;
                debug!(%owner, "granted service role to admin role");

                let created = admin.create_database(database, owner).await;

                match admin.revoke_role_from_admin(owner, admin_role).await {
                    Ok(()) => debug!(%owner, "revoked service role from admin role"),
                    Err(e) if created.is_ok() => {
                        warn!(%owner, error = %e, "database created but revoking membership failed");
                    }
                    Err(e) => {
                        warn!(%owner, error = %e, "revoking membership failed after failed create");
                    }
                }

                created
            }
        }
    }
}
