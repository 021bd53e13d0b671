use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "managed_instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_user_id: String,
    pub instance_name: String,
    pub cloud_instance_id: Option<String>,
    pub zone: String,
    pub template_name: String,
    pub status: String,
    pub ip_address: Option<String>,
    /// JSON array of `PortSpec`.
    pub ports: Option<String>,
    /// Opaque JSON map of template parameters used at provisioning time.
    pub extra_config: Option<String>,
    pub auto_shutdown_hours: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
    pub last_status_update: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
