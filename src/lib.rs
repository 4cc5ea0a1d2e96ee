pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
