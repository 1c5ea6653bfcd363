#![doc = include_str!("../README.md")]

mod error;
mod generator;
mod manager;
mod name;
mod store;

pub use crate::error::*;
pub use crate::generator::*;
pub use crate::manager::*;
pub use crate::name::*;
pub use crate::store::*;
