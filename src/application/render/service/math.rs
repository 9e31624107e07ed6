use katex::{OptsBuilder, OutputType};

use crate::application::render::types::RenderError;

use super::escape::escape_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MathStyle {
    Inline,
    Display,
}

impl MathStyle {
    pub(crate) fn is_display(self) -> bool {
        matches!(self, MathStyle::Display)
    }

    /// Typeset `literal` with KaTeX and wrap it in the container the
    /// stylesheet expects (`<span>` inline, `<div>` display).
    pub(crate) fn render(self, literal: &str) -> Result<String, RenderError> {
        let mut builder = OptsBuilder::default();
        builder.display_mode(self.is_display());
        builder.output_type(OutputType::Html);
        let opts = builder.build().map_err(|err| RenderError::Document {
            message: format!("invalid KaTeX options: {err}"),
        })?;

        let typeset =
            katex::render_with_opts(literal, opts).map_err(|err| RenderError::Document {
                message: format!("KaTeX rejected expression: {err}"),
            })?;

        Ok(match self {
            MathStyle::Inline => {
                format!("<span class=\"editormd-tex\" data-math-style=\"inline\">{typeset}</span>")
            }
            MathStyle::Display => {
                format!("<div class=\"editormd-tex\" data-math-style=\"display\">{typeset}</div>")
            }
        })
    }

    /// Source shown when typesetting fails.
    pub(crate) fn fallback(self, literal: &str) -> String {
        let escaped = escape_text(literal);
        match self {
            MathStyle::Inline => format!("<code data-math-style=\"inline\">{escaped}</code>"),
            MathStyle::Display => {
                format!("<pre data-math-style=\"display\"><code>{escaped}</code></pre>")
            }
        }
    }
}
