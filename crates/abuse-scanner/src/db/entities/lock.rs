//! Distributed lock entity.

use sea_orm::entity::prelude::*;

/// A lock row. The primary key is `<resource>:<id>`, so all pipeline hosts
/// contend on the same row for a given record. The TTL bounds the holding
/// window of a crashed owner.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub owner: String,

    /// The host currently holding the lock.
    pub host: String,

    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
