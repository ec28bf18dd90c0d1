pub mod client;
pub mod config;
pub mod error;
pub mod services;
pub mod session;
pub mod store;
pub mod workflow;
