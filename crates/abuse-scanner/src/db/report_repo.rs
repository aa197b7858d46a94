//! Queries and mutations for NCMEC report records.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};

use super::entities::report;

/// Inserts a freshly built report.
pub async fn insert(db: &DatabaseConnection, row: report::ActiveModel) -> Result<(), DbErr> {
    report::Entity::insert(row).exec(db).await?;
    Ok(())
}

/// Returns the report with the given id.
pub async fn find_one(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<report::Model>, DbErr> {
    report::Entity::find_by_id(id).one(db).await
}

/// Returns all reports derived from the given email.
pub async fn find_for_email(
    db: &DatabaseConnection,
    email_uid: &str,
) -> Result<Vec<report::Model>, DbErr> {
    report::Entity::find()
        .filter(report::Column::EmailUid.eq(email_uid))
        .all(db)
        .await
}

/// Returns the reports that still need filing. Reports with a non-empty
/// `filed_err` stay parked until an operator clears the error; they are
/// never retried automatically.
pub async fn find_unfiled(db: &DatabaseConnection) -> Result<Vec<report::Model>, DbErr> {
    report::Entity::find()
        .filter(report::Column::Filed.eq(false))
        .filter(report::Column::FiledErr.eq(""))
        .all(db)
        .await
}

/// Records the authority-assigned report id after a successful phase A. The
/// report is opened but not filed yet.
pub async fn mark_opened(
    db: &DatabaseConnection,
    row: report::Model,
    report_id: i64,
) -> Result<(), DbErr> {
    let mut active: report::ActiveModel = row.into();
    active.report_id = Set(report_id);
    active.filed_at = Set(Some(Utc::now()));
    active.update(db).await?;
    Ok(())
}

/// Records the outcome of phase B: filed on success, parked with an error
/// otherwise.
pub async fn mark_finished(
    db: &DatabaseConnection,
    row: report::Model,
    filed_err: Option<String>,
) -> Result<(), DbErr> {
    let mut active: report::ActiveModel = row.into();
    active.filed = Set(filed_err.is_none());
    active.filed_at = Set(Some(Utc::now()));
    active.filed_err = Set(filed_err.unwrap_or_default());
    active.update(db).await?;
    Ok(())
}

/// Parks a report with an error from phase A.
pub async fn mark_errored(
    db: &DatabaseConnection,
    row: report::Model,
    filed_err: String,
) -> Result<(), DbErr> {
    let mut active: report::ActiveModel = row.into();
    active.filed_err = Set(filed_err);
    active.update(db).await?;
    Ok(())
}
