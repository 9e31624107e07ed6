use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use once_cell::sync::OnceCell;
use tokio::{runtime::Handle, sync::watch};

use crate::application::render::types::{RenderError, RenderInstance, RenderRequest};

use super::EngineCore;
use super::escape::escape_text;

type RenderSlot = Arc<OnceCell<Result<String, RenderError>>>;

/// One request's editor document, rendered on the blocking pool.
///
/// The preview slot is written once by the render task; until then reads
/// see an empty preview.
pub(crate) struct EditorInstance {
    source: String,
    read_only: bool,
    preview: RenderSlot,
    done: watch::Receiver<bool>,
}

impl EditorInstance {
    pub(crate) fn spawn(core: Arc<EngineCore>, request: RenderRequest) -> Result<Self, RenderError> {
        let runtime = Handle::try_current().map_err(|err| RenderError::Unavailable {
            message: format!("instance render needs a runtime: {err}"),
        })?;

        let (done_tx, done) = watch::channel(false);
        let preview: RenderSlot = Arc::new(OnceCell::new());
        let slot = Arc::clone(&preview);
        let source = request.content().to_string();
        let read_only = request.options().read_only;

        runtime.spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| core.render_request(&request)))
                .unwrap_or_else(|payload| {
                    Err(RenderError::Aborted {
                        message: panic_message(payload.as_ref()),
                    })
                });
            let _ = slot.set(result);
            let _ = done_tx.send(true);
        });

        Ok(Self {
            source,
            read_only,
            preview,
            done,
        })
    }
}

impl RenderInstance for EditorInstance {
    fn completion(&self) -> Option<watch::Receiver<bool>> {
        Some(self.done.clone())
    }

    fn full_html(&self) -> Result<String, RenderError> {
        let preview = self.preview_html()?;
        Ok(editor_markup(&self.source, &preview, self.read_only))
    }

    fn preview_html(&self) -> Result<String, RenderError> {
        match self.preview.get() {
            Some(Ok(html)) => Ok(html.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Ok(String::new()),
        }
    }
}

fn editor_markup(source: &str, preview: &str, read_only: bool) -> String {
    let readonly = if read_only { " readonly" } else { "" };
    format!(
        "<textarea style=\"display:none;\"{readonly}>{}</textarea>\n<div class=\"markdown-body editormd-preview-container\">{preview}</div>",
        escape_text(source)
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "render task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_markup_escapes_source() {
        let html = editor_markup("<b>&</b>", "<p>x</p>", true);
        assert!(html.starts_with("<textarea style=\"display:none;\" readonly>&lt;b&gt;&amp;"));
        assert!(html.ends_with(
            "<div class=\"markdown-body editormd-preview-container\"><p>x</p></div>"
        ));
    }

    #[test]
    fn editor_markup_keeps_source_whitespace() {
        let html = editor_markup("a b\n\tc = 'd'", "", true);
        assert!(html.contains(">a b\n\tc = &#39;d&#39;</textarea>"));
        assert!(!html.contains("&#32;"));
    }

    #[test]
    fn editable_markup_omits_readonly() {
        let html = editor_markup("x", "", false);
        assert!(!html.contains("readonly"));
    }

    #[test]
    fn panic_payloads_are_described() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "render task panicked");
    }
}
