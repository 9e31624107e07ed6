//! Markdown rendering: the engine seam, the path choice between stateless
//! and instance renders, and the wait that bridges instance renders to the
//! single response write.

mod completion;
mod dispatch;
mod service;
mod types;

pub use completion::{
    CompletionHeuristic, DEFAULT_COMPLETION_CAP, DEFAULT_DEFAULT_MODE_WAIT, DEFAULT_EXPLICIT_MODE_WAIT,
    Settlement,
};
pub use dispatch::{
    Dispatched, OutputKind, PendingRender, RenderDispatcher, RenderPath, RenderReply,
    select_output, select_path,
};
pub use service::{ComrakEngine, EngineConfig};
pub use types::{
    RenderEngine, RenderError, RenderInstance, RenderOptions, RenderRequest, is_markdown_mode,
};

use std::sync::Arc;

use crate::config::RenderSettings;

/// Build a worker's dispatcher around a freshly constructed [`ComrakEngine`].
pub fn build_dispatcher(settings: &RenderSettings) -> Result<RenderDispatcher, RenderError> {
    let engine = ComrakEngine::new(&EngineConfig::from(settings))?;
    Ok(RenderDispatcher::new(
        Arc::new(engine),
        CompletionHeuristic::new(settings.explicit_mode_wait, settings.default_mode_wait)
            .with_completion_cap(settings.completion_cap),
    ))
}
