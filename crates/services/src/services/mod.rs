pub mod command_runner;
pub mod config;
pub mod container_runtime;
pub mod environment;
pub mod health;
