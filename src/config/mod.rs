#![allow(dead_code)]
pub mod loader;
pub mod schema;

pub use loader::{ConfigHandle, ConfigLoader, ConfigSource};
pub use schema::*;
