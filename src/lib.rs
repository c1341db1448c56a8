//! Encryption Key Controller Library
//!
//! This library provides the core functionality for the Encryption Key Controller.
//! Unit tests live next to the code; `tests/` drives the controllers against the
//! in-memory stores.
//!
//! ## Quick Start
//!
//! ```rust
//! use encryption_key_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod encryption;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
pub mod store;
