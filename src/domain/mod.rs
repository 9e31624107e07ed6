//! Transport-agnostic request types: framing, session state and anchors.

pub mod frame;
pub mod session;
pub mod slug;
