use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};
use clap::Parser;
use operator::{
    cert_manager::{State, run},
    config::Args,
    telemetry,
};
use tokio_util::sync::CancellationToken;
use tracing::*;

#[get("/health")]
async fn health(c: Data<State>, _: HttpRequest) -> impl Responder {
    if c.healthy().await {
        HttpResponse::Ok().json("healthy")
    } else {
        HttpResponse::ServiceUnavailable().json("last sync failed")
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = ctrl_c.await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_format);
    let settings = args.settings()?;

    let state = State::default();
    let cancel = CancellationToken::new();
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(args.listen)?
    .disable_signals()
    .shutdown_timeout(5)
    .run();
    let server_handle = server.handle();

    let signals = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        signals.cancel();
    });

    let sync = async {
        let res = run(state, settings, cancel.clone()).await;
        // the web server goes down with the sync loop, whatever stopped it
        cancel.cancel();
        server_handle.stop(true).await;
        res
    };

    let (sync_result, server_result) = tokio::join!(sync, server);
    server_result?;
    sync_result?;
    Ok(())
}
