use anyhow::Result;
use chrono::Local;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::oneshot;
use xhls::metrics::Metrics;
use xhls::{hls, PathManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = xhls::config::get_setting();

    let env = env_logger::Env::default()
        .filter_or(env_logger::DEFAULT_FILTER_ENV, config.log_level.clone());
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .init();

    let metrics = Arc::new(Metrics::new());

    let manager = PathManager::new(&config)?;
    let manager_handle = manager.handle();
    let manager_task = tokio::spawn(manager.run());

    let (request_tx, request_rx) = xhls::request_channel();
    let service = hls::Service::new(config.hls.clone(), manager_handle.clone(), metrics.clone());

    let (service_stop_tx, service_stop_rx) = oneshot::channel();
    let service_task = tokio::spawn(service.run(request_rx, service_stop_rx));

    let (http_stop_tx, http_stop_rx) = oneshot::channel();
    let port = config.hls.port;
    let http_task = tokio::spawn(async move {
        if let Err(e) = hls::run_http_server(port, request_tx, http_stop_rx).await {
            log::error!("HLS listener failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    let _ = http_stop_tx.send(());
    let _ = service_stop_tx.send(());
    http_task.await?;
    service_task.await?;

    drop(manager_handle);
    manager_task.await?;
    Ok(())
}
