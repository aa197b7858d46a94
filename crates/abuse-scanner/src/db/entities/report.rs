//! NCMEC report entity.
//!
//! One row per uploader group of a csam-tagged email, holding the serialized
//! XML payload and the two-phase filing state:
//!
//! created  (`filed=false, report_id=0, filed_err=""`) -> phase A
//! opened   (`filed=false, report_id>0, filed_err=""`) -> phase B
//! filed    (`filed=true,  report_id>0`)               -> terminal
//! errored  (`filed=false, filed_err!=""`)             -> operator reset

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "ncmec_reports")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Composite id of the abuse email this report was derived from.
    pub email_uid: String,

    /// Serialized XML report payload.
    #[sea_orm(column_type = "Text")]
    pub report: String,

    pub filed: bool,
    pub filed_at: Option<DateTimeUtc>,
    /// Empty on success. A non-empty value parks the report until an
    /// operator clears it; unsuccessful filings are never retried
    /// automatically.
    pub filed_err: String,

    /// Authority-assigned report id, 0 until the report was opened.
    pub report_id: i64,

    /// True when the report was filed against the test API.
    pub debug: bool,

    pub inserted_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
