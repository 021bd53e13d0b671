use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use vmherd_common::types::{InstanceStatus, PortSpec};

use crate::entities::managed_instance::{self, Column, Entity};
use crate::error::{Result, StoreError};
use crate::VmStore;

/// One managed VM as tracked by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub owner_user_id: String,
    pub instance_name: String,
    pub cloud_instance_id: Option<String>,
    pub zone: String,
    pub template_name: String,
    pub status: InstanceStatus,
    pub ip_address: Option<String>,
    pub ports: Vec<PortSpec>,
    pub extra_config: Option<serde_json::Value>,
    pub auto_shutdown_hours: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_status_update: DateTime<Utc>,
}

/// Fields for a new inventory record.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub owner_user_id: String,
    pub instance_name: String,
    pub cloud_instance_id: Option<String>,
    pub zone: String,
    pub template_name: String,
    pub status: InstanceStatus,
    pub ip_address: Option<String>,
    pub ports: Vec<PortSpec>,
    pub extra_config: Option<serde_json::Value>,
    pub auto_shutdown_hours: Option<i64>,
}

/// Optional fields for a status transition. `None` leaves the stored value
/// untouched; for the IP, an empty string clears the column (a stopped or
/// deleted VM has no address).
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub ip_address: Option<String>,
    pub cloud_instance_id: Option<String>,
    pub ports: Option<Vec<PortSpec>>,
}

fn encode_ports(ports: &[PortSpec]) -> Result<Option<String>> {
    if ports.is_empty() {
        return Ok(None);
    }
    let json = serde_json::to_string(ports).map_err(|source| StoreError::Json {
        column: "ports",
        source,
    })?;
    Ok(Some(json))
}

fn model_to_record(m: managed_instance::Model) -> Result<InstanceRecord> {
    let status: InstanceStatus = m
        .status
        .parse()
        .map_err(|_| StoreError::InvalidStatus { value: m.status })?;
    let ports: Vec<PortSpec> = match m.ports.as_deref() {
        Some(json) => serde_json::from_str(json).map_err(|source| StoreError::Json {
            column: "ports",
            source,
        })?,
        None => Vec::new(),
    };
    let extra_config = match m.extra_config.as_deref() {
        Some(json) => Some(serde_json::from_str(json).map_err(|source| StoreError::Json {
            column: "extra_config",
            source,
        })?),
        None => None,
    };
    Ok(InstanceRecord {
        id: m.id,
        owner_user_id: m.owner_user_id,
        instance_name: m.instance_name,
        cloud_instance_id: m.cloud_instance_id,
        zone: m.zone,
        template_name: m.template_name,
        status,
        ip_address: m.ip_address,
        ports,
        extra_config,
        auto_shutdown_hours: m.auto_shutdown_hours,
        created_at: m.created_at.with_timezone(&Utc),
        last_status_update: m.last_status_update.with_timezone(&Utc),
    })
}

/// Inventory of managed instances. One row per live VM, hard-deleted only
/// after a successful cloud delete and cleanup.
impl VmStore {
    pub async fn register_instance(&self, new: NewInstance) -> Result<InstanceRecord> {
        let now = Utc::now().fixed_offset();
        let extra_config = match &new.extra_config {
            Some(value) => Some(serde_json::to_string(value).map_err(|source| {
                StoreError::Json {
                    column: "extra_config",
                    source,
                }
            })?),
            None => None,
        };
        let am = managed_instance::ActiveModel {
            id: Set(vmherd_common::id::next_id()),
            owner_user_id: Set(new.owner_user_id),
            instance_name: Set(new.instance_name),
            cloud_instance_id: Set(new.cloud_instance_id),
            zone: Set(new.zone),
            template_name: Set(new.template_name),
            status: Set(new.status.as_str().to_owned()),
            ip_address: Set(new.ip_address.filter(|ip| !ip.is_empty())),
            ports: Set(encode_ports(&new.ports)?),
            extra_config: Set(extra_config),
            auto_shutdown_hours: Set(new.auto_shutdown_hours),
            created_at: Set(now),
            last_status_update: Set(now),
        };
        let model = am.insert(self.db()).await?;
        model_to_record(model)
    }

    /// Applies a status transition. Only the supplied fields change;
    /// `last_status_update` is always refreshed. Returns `Ok(false)` when no
    /// record with that name exists (logged, not an error).
    pub async fn update_instance_status(
        &self,
        instance_name: &str,
        status: InstanceStatus,
        update: InstanceUpdate,
    ) -> Result<bool> {
        let Some(model) = Entity::find()
            .filter(Column::InstanceName.eq(instance_name))
            .one(self.db())
            .await?
        else {
            tracing::warn!(instance = instance_name, "Status update for unknown instance");
            return Ok(false);
        };

        let mut am: managed_instance::ActiveModel = model.into();
        am.status = Set(status.as_str().to_owned());
        if let Some(ip) = update.ip_address {
            am.ip_address = Set(if ip.is_empty() { None } else { Some(ip) });
        }
        if let Some(cloud_id) = update.cloud_instance_id {
            am.cloud_instance_id = Set(Some(cloud_id));
        }
        if let Some(ports) = update.ports {
            am.ports = Set(encode_ports(&ports)?);
        }
        am.last_status_update = Set(Utc::now().fixed_offset());
        am.update(self.db()).await?;
        tracing::info!(instance = instance_name, status = %status, "Instance status updated");
        Ok(true)
    }

    pub async fn get_instance(&self, instance_name: &str) -> Result<Option<InstanceRecord>> {
        let model = Entity::find()
            .filter(Column::InstanceName.eq(instance_name))
            .one(self.db())
            .await?;
        model.map(model_to_record).transpose()
    }

    /// Instances of `owner_user_id` in a status that counts against the
    /// active-instance quota.
    pub async fn list_active_for_owner(
        &self,
        owner_user_id: &str,
    ) -> Result<Vec<InstanceRecord>> {
        let statuses: Vec<&str> = InstanceStatus::ACTIVE.iter().map(|s| s.as_str()).collect();
        let rows = Entity::find()
            .filter(Column::OwnerUserId.eq(owner_user_id))
            .filter(Column::Status.is_in(statuses))
            .all(self.db())
            .await?;
        rows.into_iter().map(model_to_record).collect()
    }

    /// Instances the auto-shutdown sweep must consider: candidate status
    /// with an auto-shutdown policy configured.
    pub async fn list_with_auto_shutdown(&self) -> Result<Vec<InstanceRecord>> {
        let statuses: Vec<&str> = InstanceStatus::AUTO_SHUTDOWN_CANDIDATES
            .iter()
            .map(|s| s.as_str())
            .collect();
        let rows = Entity::find()
            .filter(Column::Status.is_in(statuses))
            .filter(Column::AutoShutdownHours.is_not_null())
            .all(self.db())
            .await?;
        rows.into_iter().map(model_to_record).collect()
    }

    /// Hard-deletes the record. Returns `Ok(false)` when it did not exist.
    pub async fn remove_instance(&self, instance_name: &str) -> Result<bool> {
        let res = Entity::delete_many()
            .filter(Column::InstanceName.eq(instance_name))
            .exec(self.db())
            .await?;
        if res.rows_affected == 0 {
            tracing::warn!(instance = instance_name, "Removal of unknown instance");
        }
        Ok(res.rows_affected > 0)
    }
}
