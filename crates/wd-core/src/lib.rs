pub mod config;
pub mod fsio;
pub mod log_reader;
pub mod queue;
pub mod shutdown;
pub mod types;
