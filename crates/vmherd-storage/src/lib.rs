//! Persistence layer for the bot: the append-only usage ledger and the
//! managed-instance inventory, both backed by one SQLite database through
//! sea-orm. Schema lives in the `migration` crate and is applied on connect.

pub mod entities;
pub mod error;
pub mod store;

#[cfg(test)]
mod tests;

pub use error::{Result, StoreError};
pub use store::instance::{InstanceRecord, InstanceUpdate, NewInstance};

use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};

/// Handle to the bot database. Cheap to clone via `Arc` at the call sites;
/// all store methods take `&self` and are safe to share across tasks.
pub struct VmStore {
    db: DatabaseConnection,
}

impl VmStore {
    /// Opens the database and applies pending migrations.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let db = Database::connect(db_url).await?;
        Migrator::up(&db, None).await?;
        Ok(Self { db })
    }

    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}
