use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

pub use gateway_operator::{self, telemetry, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Address the metrics, health and diagnostics endpoints listen on
    #[arg(
        long = "metrics-bind-address",
        env = "GATEWAY_OPERATOR_METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    metrics_bind_address: String,

    /// Proxy image for DataPlanes that do not set one
    #[arg(
        long = "default-dataplane-image",
        env = "GATEWAY_OPERATOR_DEFAULT_DATAPLANE_IMAGE",
        default_value = "kong/kong-gateway:3.9"
    )]
    default_dataplane_image: String,

    #[arg(
        long = "konnect-sync-period",
        env = "GATEWAY_OPERATOR_KONNECT_SYNC_PERIOD",
        value_name = "SECONDS",
        default_value_t = 60
    )]
    konnect_sync_period: u64,

    #[arg(
        long = "konnect-request-timeout",
        env = "GATEWAY_OPERATOR_KONNECT_REQUEST_TIMEOUT",
        value_name = "SECONDS",
        default_value_t = 30
    )]
    konnect_request_timeout: u64,

    #[arg(
        long = "controller-concurrency",
        env = "GATEWAY_OPERATOR_CONTROLLER_CONCURRENCY",
        default_value_t = 4
    )]
    controller_concurrency: u16,

    /// Only reconcile DataPlanes
    #[arg(long = "disable-konnect", env = "GATEWAY_OPERATOR_DISABLE_KONNECT")]
    disable_konnect: bool,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();

    // Initiatilize Kubernetes controller state
    let state = State::new(
        args.default_dataplane_image,
        Duration::from_secs(args.konnect_sync_period),
        Duration::from_secs(args.konnect_request_timeout),
        args.controller_concurrency,
        !args.disable_konnect,
    );
    let controller = gateway_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.metrics_bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
