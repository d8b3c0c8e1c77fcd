// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use roost::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = roost::run::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
