//! AST pass between parsing and HTML output.
//!
//! Code blocks become highlighted markup, math and diagrams become
//! placeholders restored after formatting, user HTML is escaped, and
//! headings are collected for anchors and the `[TOC]` marker. Trailing
//! `{#id}` / `{.class}` specs on headings, paragraphs and list items become
//! attributes.
//!
//! Placeholders carry a nonce drawn per render, so document text can never
//! spell one.

use comrak::nodes::{AstNode, NodeHtmlBlock, NodeValue};
use tracing::warn;
use uuid::Uuid;

use crate::application::render::types::{RenderError, RenderOptions};
use crate::domain::slug::AnchorSlugger;

use super::attributes::{BlockAttributes, apply_at_marker, split_trailing_attributes};
use super::escape::escape_text;
use super::highlight::{Highlighter, plain_code_block};
use super::math::MathStyle;
use super::mermaid::MermaidRenderer;

const TOC_MARKERS: [&str; 2] = ["[TOC]", "[TOCM]"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeadingInfo {
    pub(crate) level: u8,
    pub(crate) anchor: String,
    pub(crate) text: String,
    pub(crate) classes: Vec<String>,
    /// The anchor was spelled out by the author; link to it from the heading.
    pub(crate) section_link: bool,
}

/// Markup swapped in for a placeholder after formatting.
#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    placeholder: String,
    html: String,
    block: bool,
}

/// Attributes waiting for the opening tag that precedes `marker`.
#[derive(Debug, Clone)]
struct BlockTarget {
    marker: String,
    tag: &'static str,
    attributes: BlockAttributes,
}

#[derive(Debug)]
pub(crate) struct RewriteOutcome {
    pub(crate) headings: Vec<HeadingInfo>,
    nonce: String,
    fragments: Vec<Fragment>,
    blocks: Vec<BlockTarget>,
    has_toc: bool,
}

impl RewriteOutcome {
    fn new() -> Self {
        Self {
            headings: Vec::new(),
            nonce: Uuid::new_v4().simple().to_string(),
            fragments: Vec::new(),
            blocks: Vec::new(),
            has_toc: false,
        }
    }

    fn toc_placeholder(&self) -> String {
        format!("<div>md-{}-toc</div>", self.nonce)
    }

    /// Replace placeholders in formatted HTML with their final markup.
    pub(crate) fn restore(&self, html: String) -> String {
        let restored = self.fragments.iter().fold(html, |acc, fragment| {
            if fragment.block {
                acc.replacen(&format!("<div>{}</div>", fragment.placeholder), &fragment.html, 1)
            } else {
                acc.replacen(&fragment.placeholder, &fragment.html, 1)
            }
        });

        let restored = if self.has_toc {
            restored.replacen(&self.toc_placeholder(), &build_toc(&self.headings), 1)
        } else {
            restored
        };

        self.blocks.iter().fold(restored, |acc, block| {
            apply_at_marker(acc, &block.marker, block.tag, &block.attributes)
        })
    }
}

pub(crate) fn rewrite_ast<'a>(
    root: &'a AstNode<'a>,
    highlighter: &Highlighter<'_>,
    mermaid: Option<&MermaidRenderer>,
    options: &RenderOptions,
) -> Result<RewriteOutcome, RenderError> {
    let mut walker = RewriteWalker {
        highlighter,
        mermaid,
        options,
        slugger: AnchorSlugger::new(),
        outcome: RewriteOutcome::new(),
    };
    walker.visit(root)?;
    Ok(walker.outcome)
}

struct RewriteWalker<'a> {
    highlighter: &'a Highlighter<'a>,
    mermaid: Option<&'a MermaidRenderer>,
    options: &'a RenderOptions,
    slugger: AnchorSlugger,
    outcome: RewriteOutcome,
}

impl RewriteWalker<'_> {
    fn visit(&mut self, node: &AstNode<'_>) -> Result<(), RenderError> {
        escape_raw_html(node);

        if let Some(level) = heading_level(node) {
            let attributes = strip_trailing_attributes(node).unwrap_or_default();
            let text = normalize_whitespace(&collect_inline_text(node));
            let anchor = match attributes.id.as_deref() {
                Some(id) => self.slugger.claim(id),
                None => self.slugger.anchor_for(&text),
            };
            self.outcome.headings.push(HeadingInfo {
                level,
                anchor,
                text,
                section_link: attributes.id.is_some(),
                classes: attributes.classes,
            });
        }

        if self.options.table_of_contents && is_toc_marker(node) {
            self.outcome.has_toc = true;
            replace_with_block(node, self.outcome.toc_placeholder());
            return Ok(());
        }

        let block_target = paragraph_target(node)
            .and_then(|tag| strip_trailing_attributes(node).map(|attributes| (tag, attributes)));

        if let Some((literal, style)) = math_literal(node) {
            self.rewrite_math(node, &literal, style);
        } else if let Some((info, literal)) = code_block(node) {
            self.rewrite_code(node, &info, &literal)?;
        }

        let mut child = node.first_child();
        while let Some(next) = child {
            self.visit(next)?;
            child = next.next_sibling();
        }

        // After the children, so the marker is not escaped as user HTML.
        if let Some((tag, attributes)) = block_target {
            let marker =
                format!("<!--md-{}-attr-{}-->", self.outcome.nonce, self.outcome.blocks.len());
            if mark_block_end(node, &marker) {
                self.outcome.blocks.push(BlockTarget {
                    marker,
                    tag,
                    attributes,
                });
            }
        }

        Ok(())
    }

    fn rewrite_math(&mut self, node: &AstNode<'_>, literal: &str, style: MathStyle) {
        let html = style.render(literal).unwrap_or_else(|err| {
            warn!(
                target = "markdownd::render::math",
                error = %err,
                "math left as source"
            );
            style.fallback(literal)
        });
        self.place_fragment(node, html, style.is_display());
    }

    fn rewrite_code(
        &mut self,
        node: &AstNode<'_>,
        info: &str,
        literal: &str,
    ) -> Result<(), RenderError> {
        let mut segments = info.split_whitespace();
        let language = segments.next();
        let meta = segments.collect::<Vec<_>>().join(" ");
        let lowered = language.map(str::to_ascii_lowercase);

        match lowered.as_deref() {
            Some("math" | "latex" | "katex") if self.options.math => {
                self.rewrite_math(node, literal, MathStyle::Display);
                return Ok(());
            }
            Some("mermaid" | "flow" | "seq" | "sequence") if self.options.flowchart => {
                if let Some(svg) = self.render_diagram(literal) {
                    self.place_fragment(
                        node,
                        format!("<div class=\"flowchart\">{svg}</div>"),
                        true,
                    );
                    return Ok(());
                }
            }
            _ => {}
        }

        let meta = (!meta.is_empty()).then_some(meta.as_str());
        let html = self
            .highlighter
            .highlight(language, meta, literal)
            .or_else(|err| match err {
                RenderError::Highlighting { .. } => {
                    warn!(
                        target = "markdownd::render::highlight",
                        error = %err,
                        "highlighting failed; emitting plain block"
                    );
                    Ok(plain_code_block(language.unwrap_or("text"), literal))
                }
                other => Err(other),
            })?;
        replace_with_block(node, html);
        Ok(())
    }

    fn render_diagram(&self, source: &str) -> Option<String> {
        let Some(renderer) = self.mermaid else {
            warn!(
                target = "markdownd::render::mermaid",
                "diagram renderer unavailable; emitting code block"
            );
            return None;
        };

        renderer
            .render_svg(source)
            .inspect_err(|err| {
                warn!(
                    target = "markdownd::render::mermaid",
                    error = %err,
                    "diagram rendering failed; emitting code block"
                );
            })
            .ok()
    }

    fn place_fragment(&mut self, node: &AstNode<'_>, html: String, block: bool) {
        let placeholder = format!("md-{}-f{}-", self.outcome.nonce, self.outcome.fragments.len());
        {
            let mut data = node.data.borrow_mut();
            data.value = if block {
                NodeValue::HtmlBlock(NodeHtmlBlock {
                    block_type: 0,
                    literal: format!("<div>{placeholder}</div>"),
                })
            } else {
                NodeValue::HtmlInline(placeholder.clone())
            };
        }
        self.outcome.fragments.push(Fragment {
            placeholder,
            html,
            block,
        });
    }
}

/// User-authored HTML is shown as text, never interpreted.
fn escape_raw_html(node: &AstNode<'_>) {
    let mut data = node.data.borrow_mut();
    match &mut data.value {
        NodeValue::HtmlBlock(block) => {
            let escaped = ammonia::clean_text(block.literal.trim_end());
            block.literal = format!("<p>{escaped}</p>\n");
        }
        NodeValue::HtmlInline(raw) => {
            *raw = ammonia::clean_text(raw);
        }
        _ => {}
    }
}

fn replace_with_block(node: &AstNode<'_>, literal: String) {
    node.data.borrow_mut().value = NodeValue::HtmlBlock(NodeHtmlBlock {
        block_type: 0,
        literal,
    });
    while let Some(child) = node.first_child() {
        child.detach();
    }
}

/// Tag a paragraph's attributes belong on: the paragraph itself, or the list
/// item when a tight list renders the paragraph without `<p>`.
fn paragraph_target(node: &AstNode<'_>) -> Option<&'static str> {
    if !matches!(node.data.borrow().value, NodeValue::Paragraph) {
        return None;
    }
    let Some(parent) = node.parent() else {
        return Some("p");
    };
    if !matches!(parent.data.borrow().value, NodeValue::Item(_) | NodeValue::TaskItem(..)) {
        return Some("p");
    }
    let tight = parent.parent().is_some_and(|list| match &list.data.borrow().value {
        NodeValue::List(list) => list.tight,
        _ => false,
    });
    match (tight, node.previous_sibling().is_none()) {
        (false, _) => Some("p"),
        (true, true) => Some("li"),
        (true, false) => None,
    }
}

/// Strip an attribute spec from the run of text nodes that ends a block.
fn strip_trailing_attributes(node: &AstNode<'_>) -> Option<BlockAttributes> {
    let mut run = Vec::new();
    let mut current = node.last_child();
    while let Some(child) = current {
        if !matches!(child.data.borrow().value, NodeValue::Text(_)) {
            break;
        }
        run.push(child);
        current = child.previous_sibling();
    }
    run.reverse();

    let joined: String = run
        .iter()
        .map(|child| match &child.data.borrow().value {
            NodeValue::Text(text) => text.to_string(),
            _ => String::new(),
        })
        .collect();
    let (rest, attributes) = split_trailing_attributes(&joined)?;
    let rest = rest.to_string();

    let (first, others) = run.split_first()?;
    if let NodeValue::Text(text) = &mut first.data.borrow_mut().value {
        *text = rest.into();
    }
    for other in others {
        other.detach();
    }
    Some(attributes)
}

/// Turn the block's closing text into raw HTML ending in `marker`.
fn mark_block_end(node: &AstNode<'_>, marker: &str) -> bool {
    let Some(last) = node.last_child() else {
        return false;
    };
    let mut data = last.data.borrow_mut();
    let html = match &data.value {
        NodeValue::Text(text) => format!("{}{marker}", escape_text(text)),
        _ => return false,
    };
    data.value = NodeValue::HtmlInline(html);
    true
}

fn is_toc_marker(node: &AstNode<'_>) -> bool {
    if !matches!(node.data.borrow().value, NodeValue::Paragraph) {
        return false;
    }
    let text = collect_inline_text(node);
    TOC_MARKERS.contains(&text.trim())
}

fn math_literal(node: &AstNode<'_>) -> Option<(String, MathStyle)> {
    let data = node.data.borrow();
    match &data.value {
        NodeValue::Math(math) => {
            let style = if math.display_math {
                MathStyle::Display
            } else {
                MathStyle::Inline
            };
            Some((math.literal.clone(), style))
        }
        _ => None,
    }
}

fn code_block(node: &AstNode<'_>) -> Option<(String, String)> {
    let data = node.data.borrow();
    match &data.value {
        NodeValue::CodeBlock(block) => Some((block.info.trim().to_string(), block.literal.clone())),
        _ => None,
    }
}

fn heading_level(node: &AstNode<'_>) -> Option<u8> {
    match &node.data.borrow().value {
        NodeValue::Heading(heading) => Some(heading.level),
        _ => None,
    }
}

fn collect_inline_text(node: &AstNode<'_>) -> String {
    fn walk(node: &AstNode<'_>, buffer: &mut String) {
        match &node.data.borrow().value {
            NodeValue::Text(text) => buffer.push_str(text),
            NodeValue::Code(code) => buffer.push_str(&code.literal),
            NodeValue::Math(math) => buffer.push_str(&math.literal),
            NodeValue::LineBreak | NodeValue::SoftBreak => buffer.push(' '),
            _ => {}
        }
        let mut child = node.first_child();
        while let Some(next) = child {
            walk(next, buffer);
            child = next.next_sibling();
        }
    }

    let mut text = String::new();
    let mut child = node.first_child();
    while let Some(next) = child {
        walk(next, &mut text);
        child = next.next_sibling();
    }
    text
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Nested list of links to every heading in document order.
fn build_toc(headings: &[HeadingInfo]) -> String {
    let mut html =
        String::from("<div class=\"markdown-toc editormd-markdown-toc\"><ul class=\"markdown-toc-list\">");
    // Open items as (level, has_child_list).
    let mut open: Vec<(u8, bool)> = Vec::new();

    for heading in headings {
        while open.last().is_some_and(|(level, _)| *level >= heading.level) {
            close_item(&mut html, &mut open);
        }
        if let Some((_, has_children)) = open.last_mut() {
            if !*has_children {
                html.push_str("<ul>");
                *has_children = true;
            }
        }
        html.push_str(&format!(
            "<li><a class=\"toc-level-{}\" href=\"#{}\">{}</a>",
            heading.level,
            heading.anchor,
            escape_text(&heading.text)
        ));
        open.push((heading.level, false));
    }

    while !open.is_empty() {
        close_item(&mut html, &mut open);
    }
    html.push_str("</ul></div>");
    html
}

fn close_item(html: &mut String, open: &mut Vec<(u8, bool)>) {
    if let Some((_, has_children)) = open.pop() {
        if has_children {
            html.push_str("</ul>");
        }
        html.push_str("</li>");
    }
}
