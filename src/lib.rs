// Session Relay - Library root for testing

pub mod config;
pub mod delivery;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod store;
pub mod token;

#[cfg(test)]
mod testutil;
