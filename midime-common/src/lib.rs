//! # MiDiMe Common Library
//!
//! Shared code for the MiDiMe services:
//! - Common error and result types
//! - TOML configuration and root folder resolution
//! - SQLite database initialization
//! - Event types (MidimeEvent enum) and the EventBus

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
