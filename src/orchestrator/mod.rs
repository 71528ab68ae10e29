//! Pipeline orchestration modules.
//!
//! Covers the five-stage pipeline, session lifecycle management, the
//! session timeout scanner, and the external collaborators the pipeline
//! consults (agent registry and incident memory).

pub mod memory;
pub mod pipeline;
pub mod registry;
pub mod session_manager;
pub mod timeout_scanner;
