//! # txtrack Testkit
//!
//! Test utilities for txtrack.
//!
//! This crate provides:
//! - A tracker fixture over the in-memory repository, index and state store
//! - Repository builders and canned scenarios
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txtrack_testkit::prelude::*;
//!
//! #[test]
//! fn indexes_scenario_a() {
//!     with_tracker(scenario_a(), |f| {
//!         f.run_cycle().unwrap();
//!         assert_eq!(f.index.marker_ids(), vec![1, 2]);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scenarios;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scenarios::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scenarios::*;
