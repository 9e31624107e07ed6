//! Worker accept loop.

mod connection;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{task::JoinSet, time::sleep};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::application::render::RenderDispatcher;

use super::transport::Listener;

pub use connection::{
    ConnectionError, ConnectionLimits, ConnectionOutcome, handle_connection,
};

pub(crate) const METRIC_CONNECTIONS_TOTAL: &str = "markdownd_connections_total";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything one worker needs to serve connections.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker: usize,
    pub dispatcher: RenderDispatcher,
    pub limits: ConnectionLimits,
}

/// Accept connections until `shutdown` resolves, serving each on its own
/// task. A panic while serving one connection ends only that connection.
///
/// In-flight connections get up to one idle timeout to finish after
/// shutdown; whatever is left is aborted.
pub async fn run_worker<F>(listener: Arc<Listener>, context: WorkerContext, shutdown: F)
where
    F: Future<Output = ()>,
{
    let span = info_span!("worker", worker = context.worker);
    async move {
        info!(target = "markdownd::server", "worker accepting connections");
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    reap(joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                        let dispatcher = context.dispatcher.clone();
                        let limits = context.limits;
                        let span = info_span!("connection", connection = id, peer = %peer);
                        connections.spawn(
                            async move {
                                let result =
                                    handle_connection(stream, id, &dispatcher, limits).await;
                                connection::record_outcome(&result);
                                if let Err(err) = result {
                                    warn!(
                                        target = "markdownd::server",
                                        error = %err,
                                        "connection closed without response"
                                    );
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(err) => {
                        error!(target = "markdownd::server", error = %err, "accept failed");
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        drain(&mut connections, context.limits.idle_timeout).await;
        info!(target = "markdownd::server", "worker stopped");
    }
    .instrument(span)
    .await
}

async fn drain(connections: &mut JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }
    debug!(
        target = "markdownd::server",
        in_flight = connections.len(),
        "waiting for in-flight connections"
    );
    let finished = tokio::time::timeout(grace, async {
        while let Some(joined) = connections.join_next().await {
            reap(joined);
        }
    })
    .await;
    if finished.is_err() {
        warn!(
            target = "markdownd::server",
            aborted = connections.len(),
            "aborting connections still open after shutdown"
        );
        connections.shutdown().await;
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    let Err(err) = joined else {
        return;
    };
    if err.is_panic() {
        metrics::counter!(METRIC_CONNECTIONS_TOTAL, "outcome" => "panicked").increment(1);
        error!(
            target = "markdownd::server",
            error = %err,
            "connection task panicked"
        );
    }
}
