pub mod config;
pub mod layout;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;
