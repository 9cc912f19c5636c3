pub mod adapters;
pub mod bot;
pub mod config;
pub mod dashboard;
pub mod dedup;
pub mod error;
pub mod events;
pub mod geo;
pub mod housekeeper;
pub mod kv;
pub mod model;
pub mod node;
pub mod ports;
pub mod shutdown;
pub mod store;
