//! Long-running manager: component wiring and shutdown.

pub mod runtime;
pub mod shutdown;
