use thiserror::Error;
use tokio::sync::watch;

use crate::domain::frame::DEFAULT_MODE;

/// Feature toggles handed to the rendering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub math: bool,
    pub flowchart: bool,
    pub table_of_contents: bool,
    pub task_list: bool,
    pub read_only: bool,
}

impl RenderOptions {
    /// Options for the stateless fast path: plain GFM, no typesetting or diagrams.
    pub const fn static_gfm() -> Self {
        Self {
            math: false,
            flowchart: false,
            table_of_contents: true,
            task_list: true,
            read_only: true,
        }
    }

    /// Options for an instance render in the given mode. Diagrams are only
    /// meaningful for markdown modes; code modes render a single listing.
    pub fn for_mode(mode: &str) -> Self {
        Self {
            math: true,
            flowchart: is_markdown_mode(mode),
            table_of_contents: true,
            task_list: true,
            read_only: true,
        }
    }
}

/// `gfm`, `markdown` and their `+`-suffixed variants (such as `gfm+django`)
/// are rendered as markdown; every other mode names a source language.
pub fn is_markdown_mode(mode: &str) -> bool {
    ["gfm", "markdown"].iter().any(|base| {
        mode.eq_ignore_ascii_case(base)
            || mode
                .get(..base.len() + 1)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&format!("{base}+")))
    })
}

/// Immutable input for an instance render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    mode: String,
    content: String,
    options: RenderOptions,
}

impl RenderRequest {
    pub fn new(mode: impl Into<String>, content: impl Into<String>) -> Self {
        let mode = mode.into();
        let options = RenderOptions::for_mode(&mode);
        Self {
            mode,
            content: content.into(),
            options,
        }
    }

    pub fn gfm(content: impl Into<String>) -> Self {
        Self::new(DEFAULT_MODE, content)
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }
}

/// Errors surfaced by a rendering engine. They end the affected connection
/// only; nothing about them is sent over the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("markdown rendering failed: {message}")]
    Markdown { message: String },
    #[error("syntax highlighting failed: {language}: {message}")]
    Highlighting { language: String, message: String },
    #[error("document processing failed: {message}")]
    Document { message: String },
    #[error("render task aborted: {message}")]
    Aborted { message: String },
    #[error("engine unavailable: {message}")]
    Unavailable { message: String },
}

/// The markdown engine collaborator.
///
/// `render_sync` must finish before returning. `create_instance` starts
/// work that keeps running after it returns; the instance is read later.
pub trait RenderEngine: Send + Sync {
    fn render_sync(&self, content: &str, options: &RenderOptions) -> Result<String, RenderError>;

    fn create_instance(
        &self,
        request: RenderRequest,
    ) -> Result<Box<dyn RenderInstance>, RenderError>;
}

/// A stateful render started by [`RenderEngine::create_instance`].
///
/// Reading before rendering has finished is allowed and returns whatever the
/// instance holds at that moment, which may be an empty preview.
pub trait RenderInstance: Send + Sync {
    /// Flips to `true` once rendering finished. Engines that cannot report
    /// completion return `None`.
    fn completion(&self) -> Option<watch::Receiver<bool>>;

    /// Editor markup: the source holder plus the rendered preview.
    fn full_html(&self) -> Result<String, RenderError>;

    /// Rendered preview only.
    fn preview_html(&self) -> Result<String, RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_modes_enable_flowcharts() {
        assert!(RenderOptions::for_mode("gfm").flowchart);
        assert!(RenderOptions::for_mode("gfm+django").flowchart);
        assert!(RenderOptions::for_mode("Markdown").flowchart);
        assert!(!RenderOptions::for_mode("python").flowchart);
        assert!(!RenderOptions::for_mode("gfmx").flowchart);
    }

    #[test]
    fn instance_options_enable_math_toc_and_tasks() {
        let options = *RenderRequest::new("rust", "fn main() {}").options();
        assert!(options.math);
        assert!(options.table_of_contents);
        assert!(options.task_list);
        assert!(options.read_only);
    }

    #[test]
    fn static_options_disable_math_and_flowcharts() {
        let options = RenderOptions::static_gfm();
        assert!(!options.math);
        assert!(!options.flowchart);
    }
}
