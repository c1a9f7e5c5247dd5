//! # keyhold_core
//!
//! Core domain logic for Keyhold: token lifecycle, permission resolution,
//! field encryption and the leased-secret cache.

pub mod auth;
pub mod config;
pub mod db;
pub mod migrate;
pub mod models;
pub mod secrets;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
