//! This module contains utilities for testing code that talks to a vehicle without a real link.
//!  They are used for testing this crate itself, but they are also exported for application
//!  testing.

pub mod link;
pub mod vehicle;
