//! Database migrations.

use sea_orm_migration::prelude::*;

mod m20240615_000001_create_emails_table;
mod m20240615_000002_create_ncmec_reports_table;
mod m20240615_000003_create_locks_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240615_000001_create_emails_table::Migration),
            Box::new(m20240615_000002_create_ncmec_reports_table::Migration),
            Box::new(m20240615_000003_create_locks_table::Migration),
        ]
    }
}
