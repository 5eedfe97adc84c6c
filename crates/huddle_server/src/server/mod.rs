#![forbid(unsafe_code)]

pub mod auth;
pub mod health;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;

#[cfg(test)]
mod session_tests;
