pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod project;
pub mod utils;

pub use error::{Error, Result};
