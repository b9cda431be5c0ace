pub mod agent;
pub mod config;
pub mod engine;
pub mod format;
pub mod heap;
pub mod logging;
