//! Shared domain types, catalog port, errors, and configuration for Marquee.

pub mod catalog;
pub mod config;
pub mod error;
pub mod types;

pub use catalog::{InMemoryCatalog, MediaCatalog};
pub use config::MarqueeConfig;
pub use error::{MarqueeError, Result};
pub use types::*;
