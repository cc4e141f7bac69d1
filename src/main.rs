mod config;
mod db;
mod dispatcher;
mod http;
mod models;
mod notifier;
mod state;
mod telemetry;
mod tls;
mod transfer;

use clap::Parser;
use config::Config;
use std::sync::Arc;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();

    tokio::fs::create_dir_all(&config.data_dir).await.ok();
    tokio::fs::create_dir_all(&config.uploads_dir).await.ok();

    let pool = db::connect(&config.db_path).await?;

    if db::list_printers(&pool).await?.is_empty() {
        if let Some(seed) = config.default_printer() {
            log::info!("seeding default printer {}", seed.serial);
            db::create_printer(&pool, seed).await?;
        }
    }

    let printers = Arc::new(telemetry::PrinterManager::new(config.swap_cooldown_secs));
    for printer in db::list_printers(&pool).await? {
        printers
            .add_printer(&printer.serial, &printer.host_address, &printer.access_code)
            .await;
    }

    let notifier = notifier::Notifier::new(config.webhook_url.clone());
    let dispatcher_handle = Arc::new(dispatcher::DispatcherHandle::new());

    let dispatcher = dispatcher::Dispatcher::new(
        pool.clone(),
        printers.clone(),
        notifier,
        dispatcher_handle.clone(),
        config.uploads_dir.clone(),
    );
    tokio::spawn(dispatcher.run());

    let state = http::AppState {
        pool,
        printers,
        dispatcher: dispatcher_handle,
        uploads_dir: config.uploads_dir.clone(),
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    log::info!("listening on {}", config.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
