use comrak::options::{ListStyleType, Options};

use crate::application::render::types::RenderOptions;

/// Comrak options for one render. Extensions that have a toggle in
/// [`RenderOptions`] follow it; the rest are always on.
pub(crate) fn markdown_options(render: &RenderOptions) -> Options<'static> {
    let mut options = Options::default();

    let ext = &mut options.extension;
    ext.strikethrough = true;
    ext.table = true;
    ext.autolink = true;
    ext.tasklist = render.task_list;
    ext.footnotes = true;
    ext.superscript = false;
    ext.description_lists = true;
    ext.math_dollars = render.math;
    ext.math_code = render.math;
    ext.underline = false;
    ext.cjk_friendly_emphasis = true;

    let output = &mut options.render;
    output.github_pre_lang = true;
    output.full_info_string = true;
    output.tasklist_classes = render.task_list;
    output.list_style = ListStyleType::Dash;
    // Rewritten nodes carry trusted markup; user HTML is escaped before output.
    output.r#unsafe = true;
    output.sourcepos = false;
    output.gfm_quirks = true;

    options
}
