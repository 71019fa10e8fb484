//! ArrayIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, state enums, flag structs, persisted
//! record layouts, error definitions and configuration used by every ArrayIO
//! component.

pub mod config;
pub mod error;
pub mod flags;
pub mod records;
pub mod region;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use flags::*;
pub use records::*;
pub use region::RegionSet;
pub use types::*;
