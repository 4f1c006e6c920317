use anyhow::{anyhow, Result};
use srpd::config::{Config, SharedConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("srpd".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let cancel = CancellationToken::new();

    tracing::info!(domain = %config.domain, "starting SRP server");
    let (handle, server) = srpd::new_server(config.clone(), cancel.clone());
    let mut server_task = tokio::spawn(server);

    let api_config = config.api_bind_addr;
    if let Some(bind_addr) = api_config {
        tracing::info!("API listening on {bind_addr}");
    }
    let api_cancel = cancel.clone();
    let api_state = (config.clone(), handle.clone());
    let mut api_task = tokio::spawn(async move {
        match api_config {
            Some(bind_addr) => {
                srpd::new_api(api_state.0, api_state.1, bind_addr, api_cancel).await
            }
            None => std::future::pending().await,
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
            cancel.cancel();
            let _ = (&mut server_task).await;
        },
        Ok(server_res) = &mut server_task => {
            if let Err(err) = server_res {
                return Err(err.into());
            }
        }
        Ok(api_res) = &mut api_task => {
            if let Err(err) = api_res {
                return Err(err.into());
            }
        }
    }
    tracing::info!("goodbye");
    Ok(())
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "srpd=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            let config = Config::try_from_file(&config_file)?;
            tracing::debug!("loaded config from {config_file}");
            Ok(Arc::new(config))
        }
    }
}
