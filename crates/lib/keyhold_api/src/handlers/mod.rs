//! Request handlers.

pub mod auth;
pub mod service;
pub mod users;
