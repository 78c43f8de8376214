//! The `utils` module provides definitions shared across the `astrobus` crate.
//!
//! It centralizes the error taxonomy used by the bus, the transports, the
//! serial framing layer and the persistence store, and the logging setup used
//! by the binary and by tests.

pub mod error;
pub mod logging;
