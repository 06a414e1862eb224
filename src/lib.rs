pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod native;
pub mod protocol;
pub mod report;
