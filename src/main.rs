use std::{future::IntoFuture, path::Path, process};

use pdfrasterizer::{
    application::error::AppError,
    config::{self, ClientArgs},
    infra::{error::InfraError, http, telemetry},
};
use pdfrasterizer_client::{Client, LOCALHOST, REMOTE, TokenSource};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) =
        config::load_with_cli().map_err(|err| AppError::from(InfraError::from(err)))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::ClientRemote(args) => {
            run_client(args, REMOTE, TokenSource::from_env()).await
        }
        config::Command::ClientLocalhost(args) => {
            run_client(args, LOCALHOST, TokenSource::None).await
        }
    }
}

#[cfg(unix)]
async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let state = http::HttpState::ghostscript(&settings.render);
    serve_http(&settings, state).await
}

#[cfg(not(unix))]
async fn run_serve(_settings: config::Settings) -> Result<(), AppError> {
    Err(AppError::unexpected(
        "the rasterization service needs named pipes and only runs on unix",
    ))
}

#[cfg(unix)]
async fn serve_http(settings: &config::Settings, state: http::HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "pdfrasterizer::serve",
        addr = %settings.server.addr,
        ghostscript = %settings.render.ghostscript_path.display(),
        fifo_dir = %settings.render.fifo_dir.display(),
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(stopped(shutdown_rx.clone()))
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        stopped(shutdown_rx).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
            info!(target = "pdfrasterizer::serve", "server stopped");
        }
        _ = deadline => {
            warn!(
                target = "pdfrasterizer::serve",
                grace_ms = grace.as_millis() as u64,
                "graceful shutdown timed out; dropping open connections"
            );
        }
    }

    Ok(())
}

/// Resolves once shutdown was requested, or the sender is gone.
#[cfg(unix)]
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!(target = "pdfrasterizer::serve", "shutdown signal received");
}

async fn run_client(
    args: ClientArgs,
    default_base_url: &str,
    token: TokenSource,
) -> Result<(), AppError> {
    let base_url = args.base_url.as_deref().unwrap_or(default_base_url);
    let client = Client::new(base_url, token)?;

    let pdf = read_document(&args.path).await?;
    let input_bytes = pdf.len();
    let image = client.rasterize(pdf, args.format.into()).await?;

    let mut stdout = tokio::io::stdout();
    let written = image.copy_to(&mut stdout).await?;

    info!(
        target = "pdfrasterizer::client",
        endpoint = %client.endpoint(),
        input_bytes,
        output_bytes = written,
        "document rasterized"
    );
    Ok(())
}

async fn read_document(path: &Path) -> Result<Vec<u8>, AppError> {
    tokio::fs::read(path)
        .await
        .map_err(|err| AppError::from(InfraError::input_file(path, err)))
}

