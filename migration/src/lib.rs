//! Database migrations for the wellness coach service.
//!
//! Each table gets its own migration; `Migrator` applies them in order.

pub use sea_orm_migration::prelude::*;

mod m2025_01_06_000001_create_clients;
mod m2025_01_06_000002_create_oauth_services;
mod m2025_01_06_000003_create_oauth_states;
mod m2025_01_06_000004_create_programmes;
mod m2025_01_06_000005_create_programme_enrolments;
mod m2025_01_06_000006_create_programme_habits;
mod m2025_01_06_000007_create_habit_completions;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_06_000001_create_clients::Migration),
            Box::new(m2025_01_06_000002_create_oauth_services::Migration),
            Box::new(m2025_01_06_000003_create_oauth_states::Migration),
            Box::new(m2025_01_06_000004_create_programmes::Migration),
            Box::new(m2025_01_06_000005_create_programme_enrolments::Migration),
            Box::new(m2025_01_06_000006_create_programme_habits::Migration),
            Box::new(m2025_01_06_000007_create_habit_completions::Migration),
        ]
    }
}
