pub mod cache;
pub mod client;
pub mod commands;
pub mod encoding;
pub mod error;
pub mod observability;
pub mod payload;
pub mod session;
pub mod settings;
pub mod sink;
pub mod sse;
pub mod types;
pub mod worker;
