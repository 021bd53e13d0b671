use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(UP_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DOWN_SQL)
            .await?;
        Ok(())
    }
}

const UP_SQL: &str = "
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS usage_events (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    command_name TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_events_user_ts ON usage_events(user_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_usage_events_user_cmd_ts ON usage_events(user_id, command_name, timestamp DESC);

CREATE TABLE IF NOT EXISTS managed_instances (
    id TEXT PRIMARY KEY NOT NULL,
    owner_user_id TEXT NOT NULL,
    instance_name TEXT NOT NULL UNIQUE,
    cloud_instance_id TEXT UNIQUE,
    zone TEXT NOT NULL,
    template_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PROVISIONING',
    ip_address TEXT,
    ports TEXT,
    extra_config TEXT,
    auto_shutdown_hours INTEGER,
    created_at TEXT NOT NULL,
    last_status_update TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_managed_instances_owner ON managed_instances(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_managed_instances_status ON managed_instances(status);
";

const DOWN_SQL: &str = "
DROP TABLE IF EXISTS managed_instances;
DROP TABLE IF EXISTS usage_events;
";
