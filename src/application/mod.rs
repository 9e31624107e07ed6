//! Rendering services and the top-level error type.

pub mod error;
pub mod render;
