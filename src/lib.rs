pub mod types;
pub mod error;
pub mod events;
pub mod data;
pub mod broker;
pub mod server;
pub mod config;
pub mod utils;

pub use types::*;
pub use error::{Result, StreamError};
