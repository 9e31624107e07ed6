//! Trailing attribute specs on block text: `Title {#id}`, `Item {.a b}`.
//!
//! Square brackets work in place of braces (`# Download # [#downloading]`).
//! Ids and class names are limited to `-._:` and ASCII alphanumerics.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BlockAttributes {
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
}

/// Split a trailing attribute spec off `text`, returning the remaining text.
///
/// A run of `#` separated from the spec by whitespace is treated as an ATX
/// closing sequence and dropped too.
pub(crate) fn split_trailing_attributes(text: &str) -> Option<(&str, BlockAttributes)> {
    let trimmed = text.trim_end_matches([' ', '\t']);
    let closing = trimmed.chars().last()?;
    if closing != '}' && closing != ']' {
        return None;
    }

    let body = &trimmed[..trimmed.len() - 1];
    let open = body.rfind(['{', '['])?;
    let spec = body[open + 1..].trim_matches([' ', '\t']);

    let mut chars = spec.chars();
    let kind = chars.next()?;
    let value = chars.as_str();
    if value.trim().is_empty() || !value.chars().all(is_spec_char) {
        return None;
    }

    let attributes = match kind {
        '#' if !value.trim().contains([' ', '\t']) => BlockAttributes {
            id: Some(value.trim().to_string()),
            classes: Vec::new(),
        },
        '.' => BlockAttributes {
            id: None,
            classes: value.split_whitespace().map(str::to_string).collect(),
        },
        _ => return None,
    };

    Some((strip_closing_sequence(&body[..open]), attributes))
}

fn is_spec_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_' | ':' | ' ')
}

fn strip_closing_sequence(text: &str) -> &str {
    let text = text.trim_end_matches([' ', '\t']);
    let without_hashes = text.trim_end_matches('#');
    if without_hashes.len() == text.len() {
        return text;
    }
    if without_hashes.is_empty() || without_hashes.ends_with([' ', '\t']) {
        without_hashes.trim_end_matches([' ', '\t'])
    } else {
        text
    }
}

/// Add `attributes` to the opening `<tag` that encloses `marker`, then drop
/// the marker. Returns the input unchanged when no enclosing tag is found.
pub(crate) fn apply_at_marker(
    html: String,
    marker: &str,
    tag: &str,
    attributes: &BlockAttributes,
) -> String {
    let Some(marker_at) = html.find(marker) else {
        return html;
    };

    let mut html = html;
    html.replace_range(marker_at..marker_at + marker.len(), "");

    let Some(tag_start) = find_open_tag(&html[..marker_at], tag) else {
        return html;
    };
    let Some(tag_len) = html[tag_start..].find('>') else {
        return html;
    };
    let tag_end = tag_start + tag_len;
    let open_tag = &html[tag_start..tag_end];

    let mut appended = String::new();
    let mut merge_at = None;
    if !attributes.classes.is_empty() {
        match open_tag.find(" class=\"") {
            Some(at) => merge_at = Some(tag_start + at + " class=\"".len()),
            None => appended.push_str(&format!(" class=\"{}\"", attributes.classes.join(" "))),
        }
    }
    if let Some(id) = attributes.id.as_ref().filter(|_| !open_tag.contains(" id=\"")) {
        appended.push_str(&format!(" id=\"{id}\""));
    }

    html.insert_str(tag_end, &appended);
    if let Some(at) = merge_at {
        html.insert_str(at, &format!("{} ", attributes.classes.join(" ")));
    }
    html
}

fn find_open_tag(html: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{tag}");
    let mut search_end = html.len();
    while let Some(at) = html[..search_end].rfind(&needle) {
        match html[at + needle.len()..].chars().next() {
            Some('>' | ' ') => return Some(at),
            _ => search_end = at,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> BlockAttributes {
        BlockAttributes {
            id: Some(value.to_string()),
            classes: Vec::new(),
        }
    }

    #[test]
    fn id_spec_is_split_off() {
        assert_eq!(
            split_trailing_attributes("This is a test {#node1}"),
            Some(("This is a test", id("node1")))
        );
        assert_eq!(split_trailing_attributes("list: {#list.1} "), Some(("list:", id("list.1"))));
    }

    #[test]
    fn class_spec_lists_every_class() {
        let (rest, attributes) = split_trailing_attributes("Other {.node2 node3}").expect("spec");
        assert_eq!(rest, "Other");
        assert_eq!(attributes.classes, ["node2", "node3"]);
        assert_eq!(attributes.id, None);
    }

    #[test]
    fn closing_hashes_and_brackets_are_accepted() {
        assert_eq!(
            split_trailing_attributes("Download! # [#downloading]"),
            Some(("Download!", id("downloading")))
        );
        assert_eq!(split_trailing_attributes("C# {#csharp}"), Some(("C#", id("csharp"))));
    }

    #[test]
    fn ordinary_text_is_left_alone() {
        assert_eq!(split_trailing_attributes("set {a, b}"), None);
        assert_eq!(split_trailing_attributes("see [link]"), None);
        assert_eq!(split_trailing_attributes("bad {#a\"b}"), None);
        assert_eq!(split_trailing_attributes("spaced {#a b}"), None);
        assert_eq!(split_trailing_attributes("plain"), None);
    }

    #[test]
    fn attributes_land_on_the_enclosing_tag() {
        let html = "<pre>x</pre><p>Hello<!--m--></p>".to_string();
        let out = apply_at_marker(
            html,
            "<!--m-->",
            "p",
            &BlockAttributes {
                id: Some("greeting".into()),
                classes: vec!["lead".into()],
            },
        );
        assert_eq!(out, "<pre>x</pre><p class=\"lead\" id=\"greeting\">Hello</p>");
    }

    #[test]
    fn classes_merge_into_an_existing_class_attribute() {
        let html = "<li class=\"task-list-item\"><input type=\"checkbox\" /> Done<!--m--></li>";
        let out = apply_at_marker(
            html.to_string(),
            "<!--m-->",
            "li",
            &BlockAttributes {
                id: None,
                classes: vec!["shipped".into()],
            },
        );
        assert_eq!(
            out,
            "<li class=\"shipped task-list-item\"><input type=\"checkbox\" /> Done</li>"
        );
    }
}
