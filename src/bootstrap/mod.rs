//! Modules that run before the controller starts.
//!
//! - **logger**: tracing-subscriber initialisation.

pub mod logger;
