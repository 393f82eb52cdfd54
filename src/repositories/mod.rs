//! # Repository Layer
//!
//! Repositories encapsulate SeaORM operations per aggregate and share one
//! `Arc<DatabaseConnection>`.

pub mod client;
pub mod habit;
pub mod oauth_service;
pub mod oauth_state;

pub use client::ClientRepository;
pub use habit::{CompletionValues, HabitRepository};
pub use oauth_service::OAuthServiceRepository;
pub use oauth_state::OAuthStateRepository;
