//! # Wellness Coach Library
//!
//! Integration credential management (Gmail, Google Chat, Fitbit), habit completion tracking
//! and the Messenger webhook for the coaching dashboard, served over axum.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod habits;
pub mod handlers;
pub mod key_rotation;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
