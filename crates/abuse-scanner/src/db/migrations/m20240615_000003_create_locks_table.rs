//! Migration to create the locks table.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Locks::Table)
                    .if_not_exists()
                    .col(string(Locks::Id).primary_key())
                    .col(string(Locks::Owner).not_null())
                    .col(string(Locks::Host).not_null())
                    .col(timestamp_with_time_zone(Locks::ExpiresAt).not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Locks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Locks {
    Table,
    Id,
    Owner,
    Host,
    ExpiresAt,
}
