mod config;
mod registry;

pub use config::*;
pub use registry::*;
