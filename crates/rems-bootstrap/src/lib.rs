//! rems-bootstrap — one-shot, idempotent database bootstrap.
//!
//! Ensures a login role exists with the current secret as its password and
//! that a database owned by that role exists, all through a privileged
//! administrative connection. Safe to re-run and to run concurrently.
//!
//! # Architecture
//!
//! ```text
//! BootstrapProcedure::run(request)
//!   ├── SecretStore::fetch(secret_name)      → RoleCredential
//!   ├── AdminDatabase::create_role           (RoleExists swallowed)
//!   ├── AdminDatabase::set_role_password     (always, rotation = re-run)
//!   ├── AdminDatabase::database_exists       → DB_ALREADY_EXISTS
//!   └── OwnershipStrategy::ensure_database   → DB_CREATED
//!         (DatabaseExists from a racing peer → DB_ALREADY_EXISTS)
//! ```
//!
//! Every failure is folded into a `BootstrapOutcome` with status `ERROR`;
//! nothing escapes `run`.

pub mod admin;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod outcome;
pub mod postgres;
pub mod procedure;
pub mod secrets;

pub use admin::{AdminDatabase, OwnershipStrategy};
pub use error::{AdminError, AdminResult, BootstrapError, BootstrapResult, SecretError};
#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryAdmin;
pub use outcome::{BootstrapOutcome, BootstrapRequest, BootstrapStatus, RoleCredential};
pub use postgres::PgAdmin;
pub use procedure::{BootstrapProcedure, BootstrapTarget};
pub use secrets::{EnvSecretStore, FileSecretStore, SecretStore, StaticSecretStore};
