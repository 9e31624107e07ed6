use std::{process, sync::Arc, time::Duration};

use markdownd::{
    application::{error::AppError, render::build_dispatcher},
    config::{self, Command, SendArgs, Settings, WorkerMode},
    domain::frame,
    infra::{
        client,
        error::InfraError,
        server::{ConnectionLimits, WorkerContext, run_worker},
        supervisor::{
            DispatcherFactory, InheritedWorker, ProcessLauncher, RespawnPolicy, Supervisor,
            TaskLauncher, WorkerLauncher, shutdown_signal,
        },
        telemetry,
        transport::{self, BoundListener},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    runtime::Builder,
    sync::watch,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = start() {
        report_application_error(&error);
        process::exit(1);
    }
}

/// Workers run on a single-threaded runtime; the supervisor and the client
/// use the multi-threaded one.
fn start() -> Result<(), AppError> {
    let worker = InheritedWorker::from_env()?;
    let mut builder = match worker {
        Some(_) => Builder::new_current_thread(),
        None => Builder::new_multi_thread(),
    };
    let runtime = builder.enable_all().build().map_err(InfraError::from)?;
    runtime.block_on(run(worker))
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run(worker: Option<InheritedWorker>) -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    if let Some(worker) = worker {
        return run_inherited_worker(worker, &settings).await;
    }

    match cli_args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(settings).await,
        Command::Send(args) => run_send(&settings, args).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    // Fail fast on a broken render setup instead of crash-looping workers.
    build_dispatcher(&settings.render)?;

    let listener = transport::bind_std(&settings.server.listen, settings.server.socket_mode)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let limits = ConnectionLimits::from(&settings.server);

    // Process workers inherit the descriptor, so the listener stays open here.
    let (launcher, _inherited): (Arc<dyn WorkerLauncher>, Option<BoundListener>) =
        match settings.supervisor.mode {
            WorkerMode::Process => {
                let fd = listener.share_with_children()?;
                (Arc::new(ProcessLauncher::current(fd)?), Some(listener))
            }
            WorkerMode::Task => {
                let render = settings.render.clone();
                let factory: DispatcherFactory = Arc::new(move || build_dispatcher(&render));
                let listener = Arc::new(listener.into_async()?);
                let launcher = TaskLauncher::new(listener, factory, limits, stop_rx.clone());
                (Arc::new(launcher), None)
            }
        };

    tokio::spawn(async move {
        // Dropping the sender on failure also stops the pool.
        if let Err(err) = shutdown_signal().await {
            error!(error = %err, "failed to listen for shutdown signals");
            return;
        }
        let _ = stop_tx.send(true);
    });

    info!(
        listen = %settings.server.listen,
        workers = settings.supervisor.workers.get(),
        mode = ?settings.supervisor.mode,
        "markdownd starting"
    );

    let supervisor = Supervisor::new(
        launcher,
        settings.supervisor.workers,
        RespawnPolicy::from(&settings.supervisor),
    );
    let respawns = supervisor.run(stop_rx).await;

    transport::remove_socket_file(&settings.server.listen);
    info!(respawns, "markdownd stopped");
    Ok(())
}

async fn run_inherited_worker(
    worker: InheritedWorker,
    settings: &Settings,
) -> Result<(), AppError> {
    let listener =
        BoundListener::from_inherited_fd(worker.fd, &settings.server.listen)?.into_async()?;
    let context = WorkerContext {
        worker: worker.slot,
        dispatcher: build_dispatcher(&settings.render)?,
        limits: ConnectionLimits::from(&settings.server),
    };

    run_worker(Arc::new(listener), context, async {
        if let Err(err) = shutdown_signal().await {
            error!(error = %err, "failed to listen for shutdown signals");
            std::future::pending::<()>().await;
        }
    })
    .await;
    Ok(())
}

async fn run_send(settings: &Settings, args: SendArgs) -> Result<(), AppError> {
    let content = match args.file.as_ref() {
        Some(path) => tokio::fs::read(path).await.map_err(InfraError::from)?,
        None => {
            let mut buffer = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buffer)
                .await
                .map_err(InfraError::from)?;
            buffer
        }
    };

    let payload = frame::encode(args.mode.as_deref(), &content)?;
    let response = client::request(
        &settings.server.listen,
        &payload,
        Duration::from_millis(args.timeout_ms),
    )
    .await?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&response).await.map_err(InfraError::from)?;
    stdout.flush().await.map_err(InfraError::from)?;
    Ok(())
}
