//! # Disconnected State Testkit
//!
//! Test utilities for the disconnected state crates.
//!
//! This crate provides:
//! - A small catalog schema (suppliers, products, orders) and seeded stores
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use dstate_testkit::prelude::*;
//!
//! let catalog = Catalog::seeded();
//! let mut state = catalog.state();
//! let mut session = catalog.store.session();
//! catalog.prefetch_all(&mut state, &mut session);
//! assert_eq!(state.all(PRODUCT).len(), 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
