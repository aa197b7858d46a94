//! Migration to create the ncmec_reports table.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NcmecReports::Table)
                    .if_not_exists()
                    .col(string(NcmecReports::Id).primary_key())
                    .col(string(NcmecReports::EmailUid).not_null())
                    .col(text(NcmecReports::Report).not_null())
                    .col(boolean(NcmecReports::Filed).not_null())
                    .col(timestamp_with_time_zone_null(NcmecReports::FiledAt))
                    .col(string(NcmecReports::FiledErr).not_null())
                    .col(big_integer(NcmecReports::ReportId).not_null())
                    .col(boolean(NcmecReports::Debug).not_null())
                    .col(timestamp_with_time_zone(NcmecReports::InsertedAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ncmec_reports_email_uid")
                    .table(NcmecReports::Table)
                    .col(NcmecReports::EmailUid)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ncmec_reports_filed")
                    .table(NcmecReports::Table)
                    .col(NcmecReports::Filed)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NcmecReports::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum NcmecReports {
    Table,
    Id,
    EmailUid,
    Report,
    Filed,
    FiledAt,
    FiledErr,
    ReportId,
    Debug,
    InsertedAt,
}
