//! Domain model module declarations.

pub mod envelope;
pub mod failed_event;
pub mod session;
pub mod stage;
