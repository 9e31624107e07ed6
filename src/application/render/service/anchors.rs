use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use lol_html::{RewriteStrSettings, element, html_content::ContentType, rewrite_str};

use crate::application::render::types::RenderError;

use super::rewrite::HeadingInfo;

/// Give each rendered heading the anchor collected for it, in document order.
/// Headings with an explicit `{#id}` also get a trailing section link.
///
/// Raw HTML is escaped before formatting, so every `h1`-`h6` in the output
/// comes from a markdown heading. Extra headings are left untouched.
pub(crate) fn apply_heading_ids(html: &str, headings: &[HeadingInfo]) -> Result<String, RenderError> {
    if headings.is_empty() {
        return Ok(html.to_string());
    }

    let anchors: Rc<RefCell<VecDeque<&HeadingInfo>>> =
        Rc::new(RefCell::new(headings.iter().collect()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("h1, h2, h3, h4, h5, h6", {
                let anchors = Rc::clone(&anchors);
                move |el| {
                    let Some(heading) = anchors.borrow_mut().pop_front() else {
                        return Ok(());
                    };
                    el.set_attribute("id", &heading.anchor)?;
                    if !heading.classes.is_empty() {
                        el.set_attribute("class", &heading.classes.join(" "))?;
                    }
                    if heading.section_link {
                        el.append(&section_link(&heading.anchor), ContentType::Html);
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| RenderError::Document {
        message: err.to_string(),
    })
}

fn section_link(anchor: &str) -> String {
    format!(
        " <a class=\"elementid-sectionlink\" href=\"#{anchor}\" title=\"Link to this section\">&para;</a>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(level: u8, anchor: &str) -> HeadingInfo {
        HeadingInfo {
            level,
            anchor: anchor.to_string(),
            text: anchor.to_string(),
            classes: Vec::new(),
            section_link: false,
        }
    }

    #[test]
    fn anchors_follow_document_order() {
        let html = "<h1>A</h1><p>x</p><h2>B</h2>";
        let rewritten =
            apply_heading_ids(html, &[heading(1, "a"), heading(2, "b")]).expect("rewrite");
        assert_eq!(rewritten, "<h1 id=\"a\">A</h1><p>x</p><h2 id=\"b\">B</h2>");
    }

    #[test]
    fn surplus_headings_are_untouched() {
        let rewritten = apply_heading_ids("<h1>A</h1><h3>C</h3>", &[heading(1, "a")])
            .expect("rewrite");
        assert_eq!(rewritten, "<h1 id=\"a\">A</h1><h3>C</h3>");
    }

    #[test]
    fn explicit_ids_carry_classes_and_a_section_link() {
        let tagged = HeadingInfo {
            classes: vec!["intro".to_string()],
            section_link: true,
            ..heading(2, "downloading")
        };
        let rewritten = apply_heading_ids("<h2>Download!</h2>", &[tagged]).expect("rewrite");
        assert_eq!(
            rewritten,
            "<h2 id=\"downloading\" class=\"intro\">Download! <a class=\"elementid-sectionlink\" \
             href=\"#downloading\" title=\"Link to this section\">&para;</a></h2>"
        );
    }
}
