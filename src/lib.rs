pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod notify;
pub mod oauth;
pub mod sanitize;
pub mod scheduler;
pub mod sla;
pub mod source;
pub mod storage;
pub mod types;
