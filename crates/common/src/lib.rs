//! Common utilities and types shared across Code Room components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for participant token claims and validation
pub mod jwt;
