//! Authentication for staff and scheduler endpoints

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_admin, require_cron_secret, tokens_match, AuthError};
