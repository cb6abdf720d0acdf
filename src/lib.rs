pub mod config;
pub mod document;
pub mod errors;
pub mod index;
pub mod mcp;
pub mod store;
pub mod types;
