//! Comrak-backed rendering engine.
//!
//! Markdown modes go through comrak with an AST rewrite for highlighting,
//! KaTeX and mermaid; every other mode is highlighted as a single listing.

mod anchors;
mod attributes;
mod config;
mod escape;
mod highlight;
mod instance;
mod math;
mod mermaid;
mod rewrite;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use comrak::{Arena, format_html, parse_document};
use syntect::{dumps::from_uncompressed_data, html::ClassStyle, parsing::SyntaxSet};
use tracing::{info, warn};

use crate::application::render::types::{
    RenderEngine, RenderError, RenderInstance, RenderOptions, RenderRequest, is_markdown_mode,
};
use crate::config::{DEFAULT_MERMAID_CACHE_DIR, DEFAULT_MERMAID_CLI_PATH, RenderSettings};

use self::highlight::Highlighter;
use self::instance::EditorInstance;
use self::mermaid::MermaidRenderer;

const CLASS_STYLE: ClassStyle = ClassStyle::SpacedPrefixed { prefix: "syntax-" };

/// Directory under the assets dir scanned for extra `.sublime-syntax` files.
const SYNTAX_ASSETS_SUBDIR: &str = "syntaxes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub assets_dir: Option<PathBuf>,
    pub mermaid_cli_path: PathBuf,
    pub mermaid_cache_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assets_dir: None,
            mermaid_cli_path: PathBuf::from(DEFAULT_MERMAID_CLI_PATH),
            mermaid_cache_dir: PathBuf::from(DEFAULT_MERMAID_CACHE_DIR),
        }
    }
}

impl From<&RenderSettings> for EngineConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            assets_dir: settings.assets_dir.clone(),
            mermaid_cli_path: settings.mermaid_cli_path.clone(),
            mermaid_cache_dir: settings.mermaid_cache_dir.clone(),
        }
    }
}

/// Built once per worker and shared by every connection it serves.
#[derive(Clone)]
pub struct ComrakEngine {
    core: Arc<EngineCore>,
}

pub(crate) struct EngineCore {
    syntax_set: SyntaxSet,
    mermaid: Option<MermaidRenderer>,
}

impl ComrakEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, RenderError> {
        let syntax_set = load_syntax_set(config.assets_dir.as_deref())?;
        let mermaid = MermaidRenderer::new(
            config.mermaid_cli_path.clone(),
            config.mermaid_cache_dir.clone(),
        )
        .inspect_err(|err| {
            warn!(
                target = "markdownd::render::mermaid",
                cli_path = %config.mermaid_cli_path.display(),
                cache_dir = %config.mermaid_cache_dir.display(),
                error = %err,
                "diagram rendering disabled"
            );
        })
        .ok();

        Ok(Self {
            core: Arc::new(EngineCore {
                syntax_set,
                mermaid,
            }),
        })
    }
}

impl RenderEngine for ComrakEngine {
    fn render_sync(&self, content: &str, options: &RenderOptions) -> Result<String, RenderError> {
        self.core.render_markdown(content, options)
    }

    fn create_instance(
        &self,
        request: RenderRequest,
    ) -> Result<Box<dyn RenderInstance>, RenderError> {
        let instance = EditorInstance::spawn(Arc::clone(&self.core), request)?;
        Ok(Box::new(instance))
    }
}

impl EngineCore {
    pub(crate) fn render_request(&self, request: &RenderRequest) -> Result<String, RenderError> {
        if is_markdown_mode(request.mode()) {
            self.render_markdown(request.content(), request.options())
        } else {
            Highlighter::new(&self.syntax_set, CLASS_STYLE).highlight(
                Some(request.mode()),
                None,
                request.content(),
            )
        }
    }

    fn render_markdown(&self, content: &str, options: &RenderOptions) -> Result<String, RenderError> {
        let comrak_options = config::markdown_options(options);
        let arena = Arena::new();
        let root = parse_document(&arena, content, &comrak_options);

        let highlighter = Highlighter::new(&self.syntax_set, CLASS_STYLE);
        let outcome = rewrite::rewrite_ast(root, &highlighter, self.mermaid.as_ref(), options)?;

        let mut html = String::new();
        format_html(root, &comrak_options, &mut html).map_err(|err| RenderError::Markdown {
            message: err.to_string(),
        })?;

        anchors::apply_heading_ids(&outcome.restore(html), &outcome.headings)
    }
}

fn load_syntax_set(assets_dir: Option<&Path>) -> Result<SyntaxSet, RenderError> {
    let baked: SyntaxSet = from_uncompressed_data(include_bytes!(env!("SYNTAX_PACK_FILE")))
        .map_err(|err| RenderError::Unavailable {
            message: format!("embedded syntax pack is unreadable: {err}"),
        })?;

    let Some(extra_dir) = assets_dir
        .map(|dir| dir.join(SYNTAX_ASSETS_SUBDIR))
        .filter(|dir| dir.is_dir())
    else {
        return Ok(baked);
    };

    let mut builder = baked.into_builder();
    builder
        .add_from_folder(&extra_dir, true)
        .map_err(|err| RenderError::Unavailable {
            message: format!("failed to load syntaxes from {}: {err}", extra_dir.display()),
        })?;
    let syntax_set = builder.build();

    info!(
        target = "markdownd::render",
        dir = %extra_dir.display(),
        syntaxes = syntax_set.syntaxes().len(),
        "loaded additional syntaxes"
    );
    Ok(syntax_set)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn engine_in(dir: &TempDir, assets_dir: Option<PathBuf>) -> ComrakEngine {
        ComrakEngine::new(&EngineConfig {
            assets_dir,
            mermaid_cli_path: dir.path().join("missing-mmdc"),
            mermaid_cache_dir: dir.path().join("mermaid"),
        })
        .expect("engine")
    }

    #[test]
    fn render_sync_produces_gfm_with_anchors() {
        let dir = TempDir::new().expect("temp dir");
        let html = engine_in(&dir, None)
            .render_sync(
                "# Hello World\n\n- [x] done\n\n| a |\n|---|\n| b |\n",
                &RenderOptions::static_gfm(),
            )
            .expect("render");

        assert!(html.contains("<h1 id=\"hello-world\">Hello World</h1>"));
        assert!(html.contains("type=\"checkbox\""));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn code_modes_render_one_listing() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine_in(&dir, None);
        let html = engine
            .core
            .render_request(&RenderRequest::new("python", "# not a heading\nprint(1)"))
            .expect("render");

        assert!(html.starts_with("<pre class=\"prettyprint linenums syntax-highlight syntax-lang-python\""));
        assert!(!html.contains("<h1"));
    }

    #[test]
    fn markdown_variant_modes_render_markdown() {
        let dir = TempDir::new().expect("temp dir");
        let html = engine_in(&dir, None)
            .core
            .render_request(&RenderRequest::new("gfm+django", "# Title"))
            .expect("render");

        assert!(html.contains("<h1 id=\"title\">Title</h1>"));
    }

    #[test]
    fn assets_dir_contributes_syntaxes() {
        let dir = TempDir::new().expect("temp dir");
        let syntaxes = dir.path().join("assets").join(SYNTAX_ASSETS_SUBDIR);
        fs::create_dir_all(&syntaxes).expect("syntax dir");
        fs::write(
            syntaxes.join("ping.sublime-syntax"),
            "%YAML 1.2\n---\nname: Ping\nfile_extensions: [ping]\nscope: source.ping\ncontexts:\n  main:\n    - match: '\\bping\\b'\n      scope: keyword.control.ping\n",
        )
        .expect("write syntax");

        let engine = engine_in(&dir, Some(dir.path().join("assets")));
        let html = engine
            .core
            .render_request(&RenderRequest::new("ping", "ping pong"))
            .expect("render");

        assert!(html.contains("syntax-keyword"), "unexpected html: {html}");
    }

    #[tokio::test]
    async fn instance_publishes_completion() {
        let dir = TempDir::new().expect("temp dir");
        let instance = engine_in(&dir, None)
            .create_instance(RenderRequest::gfm("# Intro\n\n$$x^2$$\n"))
            .expect("instance");

        let mut done = instance.completion().expect("completion signal");
        done.wait_for(|finished| *finished).await.expect("render finished");

        let preview = instance.preview_html().expect("preview");
        assert!(preview.contains("<h1 id=\"intro\">Intro</h1>"));
        assert!(preview.contains("katex"));

        let full = instance.full_html().expect("full");
        assert!(full.starts_with("<textarea style=\"display:none;\" readonly>"));
        assert!(full.contains(&preview));
    }

    #[test]
    fn instance_requires_runtime() {
        let dir = TempDir::new().expect("temp dir");
        let result = engine_in(&dir, None).create_instance(RenderRequest::gfm("x"));
        assert!(matches!(result, Err(RenderError::Unavailable { .. })));
    }
}
