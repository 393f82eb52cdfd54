//! # Data Models
//!
//! SeaORM entities plus typed views over their JSON columns.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod client;
pub mod habit_completion;
pub mod oauth_service;
pub mod oauth_state;
pub mod programme;
pub mod programme_enrolment;
pub mod programme_habit;
pub mod settings;

pub use client::Entity as Client;
pub use habit_completion::Entity as HabitCompletion;
pub use oauth_service::Entity as OAuthService;
pub use oauth_state::Entity as OAuthState;
pub use programme::Entity as Programme;
pub use programme_enrolment::Entity as ProgrammeEnrolment;
pub use programme_habit::Entity as ProgrammeHabit;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "wellness-coach".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
