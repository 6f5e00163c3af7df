pub mod config;
pub mod definition;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod named_params;
pub mod registry;
pub mod runner;
