//! Common types, geometry, traits, and error definitions for rust_local_nav
//!
//! This module provides the foundational building blocks used across
//! every navigation component in this crate.

pub mod types;
pub mod geometry;
pub mod traits;
pub mod error;

pub use types::*;
pub use geometry::*;
pub use traits::*;
pub use error::*;
