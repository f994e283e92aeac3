//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `switchyard` crate.
//!
//! This module centralizes reusable components: the error taxonomy shared by
//! the bus core and the routing engine, and the tracing initialization helper.

pub mod error;
pub mod logging;
