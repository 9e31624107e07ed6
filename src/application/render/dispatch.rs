//! Chooses between the stateless and the instance render for one frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::domain::frame::{DEFAULT_MODE, Frame};

use super::completion::CompletionHeuristic;
use super::types::{RenderEngine, RenderError, RenderInstance, RenderOptions, RenderRequest};

const METRIC_RENDER_TOTAL: &str = "markdownd_render_total";
const METRIC_RENDER_MS: &str = "markdownd_render_ms";
const METRIC_RENDER_INCOMPLETE: &str = "markdownd_render_incomplete_total";
const METRIC_RENDER_FAILURES: &str = "markdownd_render_failures_total";

const CODE_FENCE: &[u8] = b"```";
const DISPLAY_MATH: &[u8] = b"$$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    /// `render_sync` with math and flowcharts disabled.
    Fast,
    /// A render instance read back after the completion heuristic.
    Slow,
}

impl RenderPath {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderPath::Fast => "fast",
            RenderPath::Slow => "slow",
        }
    }
}

/// Which accessor produced the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Editor markup including the source holder.
    Full,
    /// Rendered markdown only. The fast path always yields this.
    Preview,
}

/// The single result handed to the connection for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderReply {
    pub html: String,
    pub path: RenderPath,
    pub output: OutputKind,
    pub possibly_incomplete: bool,
    pub elapsed: Duration,
}

/// Plain `gfm` without code fences or display math takes the fast path.
pub fn select_path(frame: &Frame) -> RenderPath {
    let content = frame.content();
    if frame.mode() == DEFAULT_MODE
        && !contains_marker(content, CODE_FENCE)
        && !contains_marker(content, DISPLAY_MATH)
    {
        RenderPath::Fast
    } else {
        RenderPath::Slow
    }
}

/// An explicit tag asks for the editor markup; default-mode markdown that
/// was routed to the slow path only wants the preview.
pub fn select_output(frame: &Frame) -> OutputKind {
    if frame.has_explicit_mode() {
        OutputKind::Full
    } else {
        OutputKind::Preview
    }
}

fn contains_marker(haystack: &[u8], marker: &[u8]) -> bool {
    haystack.windows(marker.len()).any(|window| window == marker)
}

/// Outcome of starting a dispatch.
pub enum Dispatched {
    Ready(RenderReply),
    /// An instance is rendering; [`PendingRender::finish`] waits and reads it.
    Pending(PendingRender),
}

#[derive(Clone)]
pub struct RenderDispatcher {
    engine: Arc<dyn RenderEngine>,
    heuristic: CompletionHeuristic,
}

impl RenderDispatcher {
    pub fn new(engine: Arc<dyn RenderEngine>, heuristic: CompletionHeuristic) -> Self {
        Self { engine, heuristic }
    }

    pub fn heuristic(&self) -> CompletionHeuristic {
        self.heuristic
    }

    /// Render the frame to completion.
    pub async fn dispatch(&self, frame: &Frame) -> Result<RenderReply, RenderError> {
        match self.start(frame)? {
            Dispatched::Ready(reply) => Ok(reply),
            Dispatched::Pending(pending) => pending.finish().await,
        }
    }

    /// Run the fast path to completion, or create the instance for the slow
    /// path without waiting on it. Never suspends.
    pub fn start(&self, frame: &Frame) -> Result<Dispatched, RenderError> {
        let started_at = Instant::now();
        let path = select_path(frame);
        let text = frame.text();

        match path {
            RenderPath::Fast => {
                let result = self
                    .engine
                    .render_sync(&text, &RenderOptions::static_gfm());
                let html = record_failure(path, result)?;
                let reply = RenderReply {
                    html,
                    path,
                    output: OutputKind::Preview,
                    possibly_incomplete: false,
                    elapsed: started_at.elapsed(),
                };
                record_success(&reply);
                Ok(Dispatched::Ready(reply))
            }
            RenderPath::Slow => {
                let request = RenderRequest::new(frame.mode(), text.into_owned());
                let mode = request.mode().to_string();
                let instance = record_failure(path, self.engine.create_instance(request))?;
                debug!(
                    target = "markdownd::render::dispatch",
                    mode = %mode,
                    explicit = frame.has_explicit_mode(),
                    "render instance created"
                );
                Ok(Dispatched::Pending(PendingRender {
                    instance,
                    heuristic: self.heuristic,
                    explicit_mode: frame.has_explicit_mode(),
                    output: select_output(frame),
                    mode,
                    started_at,
                }))
            }
        }
    }
}

/// A slow-path render waiting to be read back. Dropping it discards the
/// instance.
pub struct PendingRender {
    instance: Box<dyn RenderInstance>,
    heuristic: CompletionHeuristic,
    explicit_mode: bool,
    output: OutputKind,
    mode: String,
    started_at: Instant,
}

impl PendingRender {
    pub fn output(&self) -> OutputKind {
        self.output
    }

    pub async fn finish(self) -> Result<RenderReply, RenderError> {
        let settlement = self
            .heuristic
            .settle(self.instance.as_ref(), self.explicit_mode)
            .await;

        if settlement.possibly_incomplete {
            counter!(METRIC_RENDER_INCOMPLETE).increment(1);
            warn!(
                target = "markdownd::render::dispatch",
                mode = %self.mode,
                waited_ms = settlement.waited.as_millis() as u64,
                "reading render instance without observed completion"
            );
        }

        let result = match self.output {
            OutputKind::Full => self.instance.full_html(),
            OutputKind::Preview => self.instance.preview_html(),
        };
        let html = record_failure(RenderPath::Slow, result)?;

        let reply = RenderReply {
            html,
            path: RenderPath::Slow,
            output: self.output,
            possibly_incomplete: settlement.possibly_incomplete,
            elapsed: self.started_at.elapsed(),
        };
        record_success(&reply);
        Ok(reply)
    }
}

fn record_success(reply: &RenderReply) {
    counter!(METRIC_RENDER_TOTAL, "path" => reply.path.as_str()).increment(1);
    histogram!(METRIC_RENDER_MS, "path" => reply.path.as_str())
        .record(reply.elapsed.as_secs_f64() * 1000.0);
}

fn record_failure<T>(path: RenderPath, result: Result<T, RenderError>) -> Result<T, RenderError> {
    result.inspect_err(|_| {
        counter!(METRIC_RENDER_FAILURES, "path" => path.as_str()).increment(1);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::watch;

    use super::*;
    use crate::domain::frame::decode;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        RenderSync { content: String, options: RenderOptions },
        CreateInstance { mode: String, options: RenderOptions },
        FullHtml,
        PreviewHtml,
    }

    #[derive(Default)]
    struct RecordingEngine {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_instance: bool,
    }

    impl RecordingEngine {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    struct RecordingInstance {
        calls: Arc<Mutex<Vec<Call>>>,
        content: String,
        done: watch::Receiver<bool>,
    }

    impl RenderInstance for RecordingInstance {
        fn completion(&self) -> Option<watch::Receiver<bool>> {
            Some(self.done.clone())
        }

        fn full_html(&self) -> Result<String, RenderError> {
            self.calls.lock().expect("calls lock").push(Call::FullHtml);
            Ok(format!("<full>{}</full>", self.content))
        }

        fn preview_html(&self) -> Result<String, RenderError> {
            self.calls.lock().expect("calls lock").push(Call::PreviewHtml);
            Ok(format!("<preview>{}</preview>", self.content))
        }
    }

    impl RenderEngine for RecordingEngine {
        fn render_sync(&self, content: &str, options: &RenderOptions) -> Result<String, RenderError> {
            self.calls.lock().expect("calls lock").push(Call::RenderSync {
                content: content.to_string(),
                options: *options,
            });
            Ok(format!("<sync>{content}</sync>"))
        }

        fn create_instance(
            &self,
            request: RenderRequest,
        ) -> Result<Box<dyn RenderInstance>, RenderError> {
            self.calls.lock().expect("calls lock").push(Call::CreateInstance {
                mode: request.mode().to_string(),
                options: *request.options(),
            });
            if self.fail_instance {
                return Err(RenderError::Unavailable {
                    message: "engine offline".to_string(),
                });
            }
            let (_tx, done) = watch::channel(true);
            Ok(Box::new(RecordingInstance {
                calls: Arc::clone(&self.calls),
                content: request.content().to_string(),
                done,
            }))
        }
    }

    fn dispatcher(engine: Arc<RecordingEngine>) -> RenderDispatcher {
        RenderDispatcher::new(
            engine,
            CompletionHeuristic::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    #[test]
    fn plain_gfm_selects_fast_path() {
        assert_eq!(select_path(&decode(b"# Hello\n\n*world*")), RenderPath::Fast);
        assert_eq!(select_path(&decode(b"gfm\0plain")), RenderPath::Fast);
    }

    #[test]
    fn fences_math_and_modes_select_slow_path() {
        assert_eq!(select_path(&decode(b"```\ncode\n```")), RenderPath::Slow);
        assert_eq!(select_path(&decode(b"$$x^2$$")), RenderPath::Slow);
        assert_eq!(select_path(&decode(b"python\0print(1)")), RenderPath::Slow);
        assert_eq!(select_path(&decode(b"GFM\0plain")), RenderPath::Slow);
    }

    #[test]
    fn single_dollar_and_double_backtick_stay_fast() {
        assert_eq!(select_path(&decode(b"costs $5 and `x`")), RenderPath::Fast);
        assert_eq!(select_path(&decode(b"``inline``")), RenderPath::Fast);
    }

    #[tokio::test]
    async fn fast_path_uses_render_sync_without_math_or_flowcharts() {
        let engine = Arc::new(RecordingEngine::default());
        let reply = dispatcher(Arc::clone(&engine))
            .dispatch(&decode(b"hello"))
            .await
            .expect("render");

        assert_eq!(reply.html, "<sync>hello</sync>");
        assert_eq!(reply.path, RenderPath::Fast);
        assert!(!reply.possibly_incomplete);
        assert_eq!(
            engine.calls(),
            vec![Call::RenderSync {
                content: "hello".to_string(),
                options: RenderOptions::static_gfm(),
            }]
        );
    }

    #[tokio::test]
    async fn default_mode_with_code_reads_preview() {
        let engine = Arc::new(RecordingEngine::default());
        let reply = dispatcher(Arc::clone(&engine))
            .dispatch(&decode(b"```\nx\n```"))
            .await
            .expect("render");

        assert_eq!(reply.path, RenderPath::Slow);
        assert_eq!(reply.output, OutputKind::Preview);
        assert_eq!(reply.html, "<preview>```\nx\n```</preview>");
        assert_eq!(
            engine.calls(),
            vec![
                Call::CreateInstance {
                    mode: "gfm".to_string(),
                    options: RenderOptions::for_mode("gfm"),
                },
                Call::PreviewHtml,
            ]
        );
    }

    #[tokio::test]
    async fn explicit_mode_reads_full_html() {
        let engine = Arc::new(RecordingEngine::default());
        let reply = dispatcher(Arc::clone(&engine))
            .dispatch(&decode(b"python\0print(1)"))
            .await
            .expect("render");

        assert_eq!(reply.output, OutputKind::Full);
        assert_eq!(reply.html, "<full>print(1)</full>");
        let calls = engine.calls();
        assert!(matches!(&calls[0], Call::CreateInstance { mode, options }
            if mode == "python" && options.math && !options.flowchart));
        assert_eq!(calls[1], Call::FullHtml);
    }

    #[tokio::test]
    async fn instance_failure_is_returned() {
        let engine = Arc::new(RecordingEngine {
            fail_instance: true,
            ..RecordingEngine::default()
        });
        let err = dispatcher(engine)
            .dispatch(&decode(b"rust\0fn main() {}"))
            .await
            .expect_err("instance creation fails");

        assert!(matches!(err, RenderError::Unavailable { .. }));
    }

    #[test]
    fn start_does_not_read_pending_instance() {
        let engine = Arc::new(RecordingEngine::default());
        let dispatched = dispatcher(Arc::clone(&engine))
            .start(&decode(b"$$a$$"))
            .expect("start");

        match dispatched {
            Dispatched::Pending(pending) => assert_eq!(pending.output(), OutputKind::Preview),
            Dispatched::Ready(_) => panic!("slow path must be pending"),
        }
        assert_eq!(engine.calls().len(), 1);
    }
}
