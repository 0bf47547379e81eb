pub mod config;
pub mod engine;
pub mod mqtt;
pub mod protocol;
pub mod registry;
pub mod transport;
