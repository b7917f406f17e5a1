mod config;
mod dispatcher;
mod http;
mod listener;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, warn, LevelFilter};
use sensor_database::{MysqlStore, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Args, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::listener::ListenError;

#[derive(Error, Debug)]
enum BridgeError {
    #[error("ConfigError({})", .0)]
    Config(#[from] ConfigError),
    #[error("{}", .0)]
    Store(#[from] StoreError),
    #[error("{}", .0)]
    Listen(#[from] ListenError),
    #[error("IoError({})", .0)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Bridge stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), BridgeError> {
    let broker_config = args.broker_config()?;
    let store = MysqlStore::connect(&args.database_config()).await?;
    let dispatcher = Arc::new(Dispatcher::new(store));

    let (sender, receiver) = mpsc::channel(args.queue_capacity as usize);
    tokio::spawn(dispatcher.run(receiver, args.pool_size as usize));

    let http_listener = http::bind(args.port).await?;
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_listener).await {
            warn!("HTTP listener stopped: {}", e);
        }
    });

    let (client, eventloop) = listener::connect(&broker_config);
    // Outstanding writes are abandoned when the runtime shuts down.
    listener::listen(client, eventloop, sender, interrupted()).await?;
    Ok(())
}

/// Resolves on SIGINT. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for interrupts: {}", e);
        std::future::pending::<()>().await;
    }
}
