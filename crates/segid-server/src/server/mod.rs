pub mod config;
pub mod http;
pub mod resp;
pub mod telemetry;
