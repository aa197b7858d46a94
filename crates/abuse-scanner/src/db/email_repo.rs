//! Queries and stage mutations for email records.
//!
//! Readers never take locks; every mutation here assumes the caller holds
//! the record's lock. A stage only ever sets its own flag group, so the flag
//! order `parsed -> blocked -> (reported) -> finalized` is preserved by
//! construction.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};

use super::entities::email::{self, BlockResult, ParseResult, TAG_CSAM};

/// Returns the email with the given composite id.
pub async fn find_one(
    db: &DatabaseConnection,
    uid: &str,
) -> Result<Option<email::Model>, DbErr> {
    email::Entity::find_by_id(uid).one(db).await
}

/// Returns whether an email with the given composite id exists.
pub async fn exists(db: &DatabaseConnection, uid: &str) -> Result<bool, DbErr> {
    Ok(find_one(db, uid).await?.is_some())
}

/// Inserts a new email record.
pub async fn insert(db: &DatabaseConnection, email: email::ActiveModel) -> Result<(), DbErr> {
    email::Entity::insert(email).exec(db).await?;
    Ok(())
}

/// Returns the emails that have not been parsed yet.
pub async fn find_unparsed(db: &DatabaseConnection) -> Result<Vec<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::Parsed.eq(false))
        .filter(email::Column::Blocked.eq(false))
        .filter(email::Column::Finalized.eq(false))
        .all(db)
        .await
}

/// Returns the emails that have been parsed but not blocked yet.
pub async fn find_unblocked(db: &DatabaseConnection) -> Result<Vec<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::Parsed.eq(true))
        .filter(email::Column::Blocked.eq(false))
        .filter(email::Column::Finalized.eq(false))
        .all(db)
        .await
}

/// Returns the emails from the given mailbox that are parsed and blocked but
/// not finalized. The mailbox prefix guards against finalizing replies that
/// live in other folders.
pub async fn find_unfinalized(
    db: &DatabaseConnection,
    mailbox: &str,
) -> Result<Vec<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::Uid.starts_with(format!("{}-", mailbox)))
        .filter(email::Column::Parsed.eq(true))
        .filter(email::Column::Blocked.eq(true))
        .filter(email::Column::Finalized.eq(false))
        .all(db)
        .await
}

/// Returns the csam-tagged emails that have not been turned into NCMEC
/// reports yet.
pub async fn find_unreported(db: &DatabaseConnection) -> Result<Vec<email::Model>, DbErr> {
    let candidates = email::Entity::find()
        .filter(email::Column::Parsed.eq(true))
        .filter(email::Column::Reported.eq(false))
        .all(db)
        .await?;
    Ok(candidates
        .into_iter()
        .filter(|e| {
            e.parse_result
                .as_ref()
                .is_some_and(|pr| pr.has_tag(TAG_CSAM))
        })
        .collect())
}

/// Writes the parse result and flips the parsed flag.
pub async fn mark_parsed(
    db: &DatabaseConnection,
    email: email::Model,
    result: ParseResult,
    host: &str,
) -> Result<(), DbErr> {
    let mut active: email::ActiveModel = email.into();
    active.parsed = Set(true);
    active.parsed_at = Set(Some(Utc::now()));
    active.parsed_by = Set(Some(host.to_string()));
    active.parse_result = Set(Some(result));
    active.update(db).await?;
    Ok(())
}

/// Writes the block outcomes and flips the blocked flag.
pub async fn mark_blocked(
    db: &DatabaseConnection,
    email: email::Model,
    result: Vec<String>,
    host: &str,
) -> Result<(), DbErr> {
    let mut active: email::ActiveModel = email.into();
    active.blocked = Set(true);
    active.blocked_at = Set(Some(Utc::now()));
    active.blocked_by = Set(Some(host.to_string()));
    active.block_result = Set(Some(BlockResult(result)));
    active.update(db).await?;
    Ok(())
}

/// Flips the finalized flag. The record is terminal afterwards.
pub async fn mark_finalized(
    db: &DatabaseConnection,
    email: email::Model,
    host: &str,
) -> Result<(), DbErr> {
    let mut active: email::ActiveModel = email.into();
    active.finalized = Set(true);
    active.finalized_at = Set(Some(Utc::now()));
    active.finalized_by = Set(Some(host.to_string()));
    active.update(db).await?;
    Ok(())
}

/// Flips the reported flag.
pub async fn mark_reported(db: &DatabaseConnection, email: email::Model) -> Result<(), DbErr> {
    let mut active: email::ActiveModel = email.into();
    active.reported = Set(true);
    active.reported_at = Set(Some(Utc::now()));
    active.update(db).await?;
    Ok(())
}
