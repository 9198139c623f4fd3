#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod coordinator;
pub mod health;
pub mod registry;


#[cfg(test)]
mod registry_tests;
