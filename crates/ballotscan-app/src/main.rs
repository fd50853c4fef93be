// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ballotscan — Precinct ballot scanner service
//
// Entry point. Initialises logging and backend services, then serves
// JSON-lines RPC on stdin/stdout. Logs go to stderr.

mod rpc;
mod services;

use services::app_services::AppServices;
use ballotscan_core::config::ScannerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("ballotscan starting");

    let data_dir = services::data_dir::data_dir();
    let config = match ScannerConfig::load(data_dir.join("config.json")) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load scanner config");
            std::process::exit(1);
        }
    };

    let svc = match AppServices::init(data_dir, config).await {
        Ok(svc) => svc,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise scanner services");
            std::process::exit(1);
        }
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = rpc::serve(&svc, stdin, tokio::io::stdout()).await {
        tracing::error!(error = %e, "rpc transport failed");
    }

    if let Err(e) = svc.shutdown().await {
        tracing::warn!(error = %e, "scanner shutdown failed");
    }
    tracing::info!("ballotscan stopped");
}
