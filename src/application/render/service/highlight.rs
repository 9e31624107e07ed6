use syntect::{
    html::{ClassStyle, ClassedHTMLGenerator},
    parsing::{SyntaxReference, SyntaxSet},
    util::LinesWithEndings,
};

use crate::application::render::types::RenderError;

use super::escape::escape_text;

/// Class-based syntax highlighter; themes are left to the client stylesheet.
pub(crate) struct Highlighter<'a> {
    syntax_set: &'a SyntaxSet,
    class_style: ClassStyle,
}

impl<'a> Highlighter<'a> {
    pub(crate) fn new(syntax_set: &'a SyntaxSet, class_style: ClassStyle) -> Self {
        Self {
            syntax_set,
            class_style,
        }
    }

    /// Highlight `code` as `language`. Unknown languages are emitted as
    /// plain text under the requested name.
    pub(crate) fn highlight(
        &self,
        language: Option<&str>,
        meta: Option<&str>,
        code: &str,
    ) -> Result<String, RenderError> {
        let language = language.filter(|lang| !lang.is_empty()).unwrap_or("text");
        let syntax = self
            .find_syntax(language)
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());

        let mut generator =
            ClassedHTMLGenerator::new_with_class_style(syntax, self.syntax_set, self.class_style);
        for line in LinesWithEndings::from(code) {
            generator
                .parse_html_for_line_which_includes_newline(line)
                .map_err(|err| RenderError::Highlighting {
                    language: language.to_string(),
                    message: err.to_string(),
                })?;
        }
        if !code.ends_with('\n') {
            generator
                .parse_html_for_line_which_includes_newline("\n")
                .map_err(|err| RenderError::Highlighting {
                    language: language.to_string(),
                    message: err.to_string(),
                })?;
        }

        let token = class_token(language);
        let meta_attr = meta
            .filter(|meta| !meta.is_empty())
            .map(|meta| format!(" data-meta=\"{}\"", escape_text(meta)))
            .unwrap_or_default();

        Ok(format!(
            "<pre class=\"prettyprint linenums syntax-highlight syntax-lang-{token}\" data-language=\"{}\"><code class=\"language-{token} syntax-code\"{meta_attr}>{}</code></pre>",
            escape_text(language),
            generator.finalize()
        ))
    }

    fn find_syntax(&self, token: &str) -> Option<&'a SyntaxReference> {
        let lowercase = token.to_ascii_lowercase();
        self.syntax_set
            .find_syntax_by_token(&lowercase)
            .or_else(|| self.syntax_set.find_syntax_by_name(token))
            .or_else(|| self.syntax_set.find_syntax_by_extension(&lowercase))
    }
}

/// Escaped block used when highlighting itself fails.
pub(crate) fn plain_code_block(language: &str, code: &str) -> String {
    let mut escaped = escape_text(code);
    if !code.ends_with('\n') {
        escaped.push('\n');
    }
    format!(
        "<pre class=\"syntax-highlight\" data-language=\"{}\"><code>{escaped}</code></pre>",
        escape_text(language)
    )
}

/// Mode names come off the wire; keep only characters safe in a class list.
fn class_token(language: &str) -> String {
    let token: String = language
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if token.is_empty() {
        "text".to_string()
    } else {
        token
    }
}
