//! # ormid Testkit
//!
//! Test utilities for ormid.
//!
//! This crate provides:
//! - Sample entity types and a ready-made data model
//! - Property-based test generators using proptest
//! - Cross-crate integration test helpers
//! - Stress testing utilities
//! - Test log setup
//!
//! ## Usage
//!
//! ```rust
//! use ormid_testkit::prelude::*;
//!
//! init_test_logging();
//! with_test_model(|t| {
//!     let dog = t
//!         .in_transaction(|ctx, _| {
//!             let dog = ctx.create(&t.dog)?;
//!             dog.set("name", "rex")?;
//!             Ok(dog)
//!         })
//!         .unwrap();
//!     assert!(!dog.is_new());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod logging;
pub mod stress;

/// Re-exports for convenient test imports.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::logging::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use logging::*;
pub use stress::*;
