use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, PaginatorTrait,
    QueryFilter, QueryOrder,
};

use crate::entities::usage_event::{self, Column, Entity};
use crate::error::Result;
use crate::VmStore;

/// Append-only command-usage ledger. Rows are never updated or deleted;
/// retention is out of scope.
impl VmStore {
    /// Records one command invocation at the current time.
    pub async fn record_usage(&self, user_id: &str, command_name: &str) -> Result<()> {
        self.record_usage_at(user_id, command_name, Utc::now()).await
    }

    /// Records one command invocation with an explicit timestamp.
    pub async fn record_usage_at(
        &self,
        user_id: &str,
        command_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let event = usage_event::ActiveModel {
            id: Set(vmherd_common::id::next_id()),
            user_id: Set(user_id.to_owned()),
            command_name: Set(command_name.to_owned()),
            timestamp: Set(timestamp.fixed_offset()),
        };
        event.insert(self.db()).await?;
        Ok(())
    }

    /// Counts invocations by `user_id` at or after `since`, across all
    /// commands. The rate limiter calls this with `since = now - 60s`.
    pub async fn count_usage_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let count = Entity::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Timestamp.gte(since.fixed_offset()))
            .count(self.db())
            .await?;
        Ok(count)
    }

    /// Most recent invocation time of `command_name` by `user_id`, if any.
    pub async fn last_usage_timestamp(
        &self,
        user_id: &str,
        command_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = Entity::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::CommandName.eq(command_name))
            .order_by(Column::Timestamp, Order::Desc)
            .one(self.db())
            .await?;
        Ok(row.map(|m| m.timestamp.with_timezone(&Utc)))
    }
}
