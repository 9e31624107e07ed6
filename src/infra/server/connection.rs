//! One accepted connection: buffer until half-close, render, write once.

use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::application::render::{Dispatched, RenderDispatcher, RenderError, RenderPath};
use crate::config::ServerSettings;
use crate::domain::session::{
    ConnectionSession, EMPTY_RESPONSE, SessionError, SessionInput, SessionPhase,
};

const METRIC_REQUEST_BYTES: &str = "markdownd_request_bytes";
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_request_bytes: usize,
    pub idle_timeout: Duration,
}

impl From<&ServerSettings> for ConnectionLimits {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            max_request_bytes: settings.max_request_bytes.get(),
            idle_timeout: settings.idle_timeout,
        }
    }
}

/// How a connection that produced a response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Nothing was sent; a bare newline was written.
    Empty,
    Rendered {
        path: RenderPath,
        bytes: usize,
        possibly_incomplete: bool,
    },
}

impl ConnectionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionOutcome::Empty => "empty",
            ConnectionOutcome::Rendered { .. } => "rendered",
        }
    }
}

/// Every way a connection can end without a response. The peer only ever
/// observes a close.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("connection i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionError::IdleTimeout(_) => "idle_timeout",
            ConnectionError::Session(SessionError::PayloadTooLarge { .. }) => "too_large",
            ConnectionError::Session(_) => "session_error",
            ConnectionError::Render(_) => "render_failed",
            ConnectionError::Io(_) => "io_error",
        }
    }
}

/// Drive one session over `stream` until the response is written.
///
/// Exactly one write happens on success, followed by closing the write
/// side. On error the stream is dropped without writing anything.
pub async fn handle_connection<S>(
    mut stream: S,
    id: u64,
    dispatcher: &RenderDispatcher,
    limits: ConnectionLimits,
) -> Result<ConnectionOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = ConnectionSession::new(id, limits.max_request_bytes);
    let result = serve_session(&mut stream, &mut session, dispatcher, limits).await;
    session.close();
    result
}

async fn serve_session<S>(
    stream: &mut S,
    session: &mut ConnectionSession,
    dispatcher: &RenderDispatcher,
    limits: ConnectionLimits,
) -> Result<ConnectionOutcome, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_until_half_close(stream, session, limits.idle_timeout).await?;
    histogram!(METRIC_REQUEST_BYTES).record(session.buffered_len() as f64);

    let frame = match session.finish_input()? {
        SessionInput::Empty => {
            session.advance(SessionPhase::Writing)?;
            write_response(stream, EMPTY_RESPONSE).await?;
            session.advance(SessionPhase::Closed)?;
            return Ok(ConnectionOutcome::Empty);
        }
        SessionInput::Frame(frame) => frame,
    };

    session.advance(SessionPhase::Dispatching)?;
    let reply = match dispatcher.start(&frame)? {
        Dispatched::Ready(reply) => reply,
        Dispatched::Pending(pending) => {
            session.advance(SessionPhase::Waiting)?;
            pending.finish().await?
        }
    };

    session.advance(SessionPhase::Writing)?;
    write_response(stream, reply.html.as_bytes()).await?;
    session.advance(SessionPhase::Closed)?;

    debug!(
        target = "markdownd::server::connection",
        connection = session.id(),
        mode = %frame.mode(),
        path = reply.path.as_str(),
        bytes = reply.html.len(),
        elapsed_ms = reply.elapsed.as_millis() as u64,
        "response written"
    );

    Ok(ConnectionOutcome::Rendered {
        path: reply.path,
        bytes: reply.html.len(),
        possibly_incomplete: reply.possibly_incomplete,
    })
}

async fn read_until_half_close<S>(
    stream: &mut S,
    session: &mut ConnectionSession,
    idle_timeout: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = timeout(idle_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| ConnectionError::IdleTimeout(idle_timeout))??;
        if read == 0 {
            return Ok(());
        }
        session.append(&chunk[..read])?;
    }
}

async fn write_response<S>(stream: &mut S, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(body).await?;
    stream.shutdown().await
}

/// Count a finished connection under its outcome label.
pub(crate) fn record_outcome(result: &Result<ConnectionOutcome, ConnectionError>) {
    let outcome = match result {
        Ok(outcome) => outcome.label(),
        Err(err) => err.label(),
    };
    counter!(super::METRIC_CONNECTIONS_TOTAL, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::sync::watch;

    use super::*;
    use crate::application::render::{
        CompletionHeuristic, RenderEngine, RenderInstance, RenderOptions, RenderRequest,
    };

    #[derive(Default)]
    struct EchoEngine {
        calls: Mutex<Vec<String>>,
    }

    struct EchoInstance {
        html: String,
        done: watch::Receiver<bool>,
    }

    impl RenderInstance for EchoInstance {
        fn completion(&self) -> Option<watch::Receiver<bool>> {
            Some(self.done.clone())
        }

        fn full_html(&self) -> Result<String, RenderError> {
            Ok(format!("<full>{}</full>", self.html))
        }

        fn preview_html(&self) -> Result<String, RenderError> {
            Ok(format!("<preview>{}</preview>", self.html))
        }
    }

    impl RenderEngine for EchoEngine {
        fn render_sync(&self, content: &str, _: &RenderOptions) -> Result<String, RenderError> {
            self.calls.lock().expect("calls").push("sync".into());
            if content == "fail" {
                return Err(RenderError::Document {
                    message: "broken".into(),
                });
            }
            Ok(format!("<p>{content}</p>"))
        }

        fn create_instance(
            &self,
            request: RenderRequest,
        ) -> Result<Box<dyn RenderInstance>, RenderError> {
            self.calls.lock().expect("calls").push("instance".into());
            let (_, done) = watch::channel(true);
            Ok(Box::new(EchoInstance {
                html: request.content().to_string(),
                done,
            }))
        }
    }

    fn dispatcher() -> (RenderDispatcher, Arc<EchoEngine>) {
        let engine = Arc::new(EchoEngine::default());
        let dispatcher = RenderDispatcher::new(engine.clone(), CompletionHeuristic::default());
        (dispatcher, engine)
    }

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_request_bytes: 64,
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn exchange(
        payload: &[u8],
        dispatcher: &RenderDispatcher,
        limits: ConnectionLimits,
    ) -> (Result<ConnectionOutcome, ConnectionError>, Vec<u8>) {
        let (mut client, server) = duplex(1024);
        client.write_all(payload).await.expect("write payload");
        client.shutdown().await.expect("half close");

        let result = handle_connection(server, 7, dispatcher, limits).await;
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("read response");
        (result, response)
    }

    #[tokio::test]
    async fn empty_input_yields_a_newline() {
        let (dispatcher, engine) = dispatcher();
        let (result, response) = exchange(b"", &dispatcher, limits()).await;

        assert_eq!(result.expect("outcome"), ConnectionOutcome::Empty);
        assert_eq!(response, b"\n");
        assert!(engine.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test]
    async fn plain_markdown_is_written_once() {
        let (dispatcher, _) = dispatcher();
        let (result, response) = exchange(b"hello", &dispatcher, limits()).await;

        assert!(matches!(
            result.expect("outcome"),
            ConnectionOutcome::Rendered {
                path: RenderPath::Fast,
                ..
            }
        ));
        assert_eq!(response, b"<p>hello</p>");
    }

    #[tokio::test]
    async fn tagged_input_waits_and_reads_full_html() {
        let (dispatcher, _) = dispatcher();
        let (result, response) = exchange(b"python\0print(1)", &dispatcher, limits()).await;

        assert!(matches!(
            result.expect("outcome"),
            ConnectionOutcome::Rendered {
                path: RenderPath::Slow,
                possibly_incomplete: false,
                ..
            }
        ));
        assert_eq!(response, b"<full>print(1)</full>");
    }

    #[tokio::test]
    async fn oversized_input_closes_without_payload() {
        let (dispatcher, engine) = dispatcher();
        let (result, response) = exchange(&[b'a'; 65], &dispatcher, limits()).await;

        let err = result.expect_err("too large");
        assert_eq!(err.label(), "too_large");
        assert!(response.is_empty());
        assert!(engine.calls.lock().expect("calls").is_empty());
    }

    #[tokio::test]
    async fn render_failure_closes_without_payload() {
        let (dispatcher, _) = dispatcher();
        let (result, response) = exchange(b"fail", &dispatcher, limits()).await;

        assert!(matches!(result, Err(ConnectionError::Render(_))));
        assert!(response.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_the_idle_timeout() {
        let (dispatcher, _) = dispatcher();
        let (_client, server) = duplex(64);

        let result = handle_connection(server, 9, &dispatcher, limits()).await;
        assert!(matches!(result, Err(ConnectionError::IdleTimeout(_))));
    }
}
