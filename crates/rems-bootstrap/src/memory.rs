//! In-memory catalogue implementing [`AdminDatabase`].
//!
//! Models the parts of Postgres role/database semantics the bootstrap
//! procedure relies on: duplicate detection, role membership required to
//! create a database for another owner on managed engines, and password
//! assignment, plus hooks that reproduce the races a real server exhibits.
//! Test support only; enabled by the `test-support` feature.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Barrier;

use crate::admin::AdminDatabase;
use crate::error::{AdminError, AdminResult};

#[derive(Debug, Default)]
struct Catalog {
    /// role → password
    roles: HashMap<String, Option<String>>,
    /// database → owner
    databases: HashMap<String, String>,
    /// (member, role)
    memberships: HashSet<(String, String)>,
    /// operation → injected failure
    failures: HashMap<&'static str, AdminError>,
    /// operation → remaining concurrent-update conflicts
    conflicts: HashMap<&'static str, u32>,
    calls: Vec<String>,
}

/// An in-memory stand-in for a Postgres instance seen through an admin
/// connection.
#[derive(Debug, Clone)]
pub struct MemoryAdmin {
    admin: String,
    superuser: bool,
    catalog: Arc<Mutex<Catalog>>,
    exists_barrier: Option<Arc<Barrier>>,
    lose_create_race: Arc<AtomicBool>,
}

impl MemoryAdmin {
    /// Admin account that is not a real superuser (managed database engine).
    pub fn managed(admin: &str) -> Self {
        Self::new(admin, false)
    }

    pub fn superuser(admin: &str) -> Self {
        Self::new(admin, true)
    }

    fn new(admin: &str, superuser: bool) -> Self {
        let mut catalog = Catalog::default();
        catalog.roles.insert(admin.to_string(), None);
        Self {
            admin: admin.to_string(),
            superuser,
            catalog: Arc::new(Mutex::new(catalog)),
            exists_barrier: None,
            lose_create_race: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hold every `database_exists` call at `barrier` after it has looked,
    /// so concurrent callers all observe the same answer.
    pub fn with_exists_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.exists_barrier = Some(barrier);
        self
    }

    /// Make the next `create_database` behave as if a concurrent peer created
    /// the database and revoked our membership just before we ran.
    pub fn lose_next_create_race(&self) {
        self.lose_create_race.store(true, Ordering::SeqCst);
    }

    /// Fail every call of `operation` (e.g. `"create_role"`) with `err`.
    pub fn fail_on(&self, operation: &'static str, err: AdminError) {
        self.catalog().failures.insert(operation, err);
    }

    /// Fail the next `times` calls of `operation` the way Postgres reports
    /// two sessions updating the same catalogue row.
    pub fn conflict_next(&self, operation: &'static str, times: u32) {
        self.catalog().conflicts.insert(operation, times);
    }

    pub fn role_password(&self, role: &str) -> Option<String> {
        self.catalog().roles.get(role).cloned().flatten()
    }

    pub fn role_exists(&self, role: &str) -> bool {
        self.catalog().roles.contains_key(role)
    }

    pub fn database_owner(&self, database: &str) -> Option<String> {
        self.catalog().databases.get(database).cloned()
    }

    pub fn is_member(&self, member: &str, role: &str) -> bool {
        self.catalog()
            .memberships
            .contains(&(member.to_string(), role.to_string()))
    }

    /// Insert a database without any checks.
    pub fn create_database_unchecked(&self, database: &str, owner: &str) {
        self.catalog()
            .databases
            .insert(database.to_string(), owner.to_string());
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.catalog().calls.clone()
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and return any injected failure for it.
    fn enter(&self, operation: &'static str) -> AdminResult<MutexGuard<'_, Catalog>> {
        let mut catalog = self.catalog();
        catalog.calls.push(operation.to_string());
        let injected = catalog.failures.get(operation).cloned();
        if let Some(err) = injected {
            return Err(err);
        }
        if let Some(remaining) = catalog.conflicts.get_mut(operation).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(AdminError::Conflict("tuple concurrently updated".to_string()));
        }
        Ok(catalog)
    }

    fn admin_name<'a>(&'a self, admin: Option<&'a str>) -> &'a str {
        admin.unwrap_or(&self.admin)
    }
}

#[async_trait]
impl AdminDatabase for MemoryAdmin {
    async fn create_role(&self, role: &str) -> AdminResult<()> {
        let mut catalog = self.enter("create_role")?;
        if catalog.roles.contains_key(role) {
            return Err(AdminError::RoleExists(format!(
                "role \"{role}\" already exists"
            )));
        }
        catalog.roles.insert(role.to_string(), None);
        Ok(())
    }

    async fn set_role_password(&self, role: &str, password: &str) -> AdminResult<()> {
        let mut catalog = self.enter("set_role_password")?;
        match catalog.roles.get_mut(role) {
            Some(slot) => {
                *slot = Some(password.to_string());
                Ok(())
            }
            None => Err(AdminError::Other(format!("role \"{role}\" does not exist"))),
        }
    }

    async fn database_exists(&self, database: &str) -> AdminResult<bool> {
        let exists = {
            let catalog = self.enter("database_exists")?;
            catalog.databases.contains_key(database)
        };
        if let Some(barrier) = &self.exists_barrier {
            barrier.wait().await;
        }
        Ok(exists)
    }

    async fn grant_role_to_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()> {
        let admin = self.admin_name(admin).to_string();
        let mut catalog = self.enter("grant_role_to_admin")?;
        if !catalog.roles.contains_key(role) {
            return Err(AdminError::Other(format!("role \"{role}\" does not exist")));
        }
        catalog.memberships.insert((admin, role.to_string()));
        Ok(())
    }

    async fn revoke_role_from_admin(&self, role: &str, admin: Option<&str>) -> AdminResult<()> {
        let admin = self.admin_name(admin).to_string();
        let mut catalog = self.enter("revoke_role_from_admin")?;
        catalog.memberships.remove(&(admin, role.to_string()));
        Ok(())
    }

    async fn create_database(&self, database: &str, owner: &str) -> AdminResult<()> {
        let mut catalog = self.enter("create_database")?;

        if self.lose_create_race.swap(false, Ordering::SeqCst) {
            catalog
                .databases
                .insert(database.to_string(), owner.to_string());
            return Err(AdminError::InsufficientPrivilege(format!(
                "must be able to SET ROLE \"{owner}\""
            )));
        }

        if !catalog.roles.contains_key(owner) {
            return Err(AdminError::Other(format!("role \"{owner}\" does not exist")));
        }
        let may_own = self.superuser
            || owner == self.admin
            || catalog
                .memberships
                .contains(&(self.admin.clone(), owner.to_string()));
        if !may_own {
            return Err(AdminError::InsufficientPrivilege(format!(
                "must be able to SET ROLE \"{owner}\""
            )));
        }
        if catalog.databases.contains_key(database) {
            return Err(AdminError::DatabaseExists(format!(
                "database \"{database}\" already exists"
            )));
        }
        catalog
            .databases
            .insert(database.to_string(), owner.to_string());
        Ok(())
    }
}
