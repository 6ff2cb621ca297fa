use actix_web::{middleware, web, App, HttpServer};
use notification_stream::{
    handlers::register_stream, logging, metrics, Config, StreamService,
};
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    logging::init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    tracing::info!(
        ping_interval_secs = config.stream.ping_interval.as_secs(),
        liveness_timeout_secs = config.stream.liveness_timeout.as_secs(),
        max_connections = ?config.stream.max_connections,
        "Starting notification stream service"
    );

    let stream_service = StreamService::new(config.stream.clone());
    let addr = config.bind_address();
    tracing::info!("HTTP server listening on {}", addr);

    let app_service = stream_service.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_service.clone()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware::new())
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(register_stream)
    })
    .bind(&addr)?
    .disable_signals()
    .run();

    // Open streams never end on their own, so close them before stopping
    let handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        stream_service.shutdown();
        handle.stop(true).await;
    });

    server.await
}
