//! Migration to create the emails table.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Emails::Table)
                    .if_not_exists()
                    .col(string(Emails::Uid).primary_key())
                    .col(big_integer(Emails::UidRaw).not_null())
                    .col(binary(Emails::Body).not_null())
                    .col(string(Emails::Subject).not_null())
                    .col(string(Emails::MessageId).not_null())
                    .col(string(Emails::FromAddress).not_null())
                    .col(string(Emails::ReplyTo).not_null())
                    .col(string(Emails::ToAddress).not_null())
                    .col(boolean(Emails::Skip).not_null())
                    .col(string(Emails::InsertedBy).not_null())
                    .col(timestamp_with_time_zone(Emails::InsertedAt).not_null())
                    .col(boolean(Emails::Parsed).not_null())
                    .col(timestamp_with_time_zone_null(Emails::ParsedAt))
                    .col(string_null(Emails::ParsedBy))
                    .col(json_null(Emails::ParseResult))
                    .col(boolean(Emails::Blocked).not_null())
                    .col(timestamp_with_time_zone_null(Emails::BlockedAt))
                    .col(string_null(Emails::BlockedBy))
                    .col(json_null(Emails::BlockResult))
                    .col(boolean(Emails::Finalized).not_null())
                    .col(timestamp_with_time_zone_null(Emails::FinalizedAt))
                    .col(string_null(Emails::FinalizedBy))
                    .col(boolean(Emails::Reported).not_null())
                    .col(timestamp_with_time_zone_null(Emails::ReportedAt))
                    .to_owned(),
            )
            .await?;

        // one index per stage flag, the stage queries filter on these
        for (name, column) in [
            ("idx_emails_parsed", Emails::Parsed),
            ("idx_emails_blocked", Emails::Blocked),
            ("idx_emails_finalized", Emails::Finalized),
            ("idx_emails_reported", Emails::Reported),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Emails::Table)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Emails::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Emails {
    Table,
    Uid,
    UidRaw,
    Body,
    Subject,
    MessageId,
    FromAddress,
    ReplyTo,
    ToAddress,
    Skip,
    InsertedBy,
    InsertedAt,
    Parsed,
    ParsedAt,
    ParsedBy,
    ParseResult,
    Blocked,
    BlockedAt,
    BlockedBy,
    BlockResult,
    Finalized,
    FinalizedAt,
    FinalizedBy,
    Reported,
    ReportedAt,
}
