// Copyright 2025 ribd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use ribd::config::Config;
use ribd::log::{self, error, info};
use ribd::server::BgpServer;
use serde_json::json;

#[derive(Parser)]
#[command(name = "ribd")]
#[command(about = "BGP route server daemon", version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                json!({
                    "timestamp": log::get_timestamp(),
                    "level": "ERROR",
                    "message": "failed to load config",
                    "path": &args.config,
                    "error": e.to_string()
                })
            );
            std::process::exit(1);
        }
    };
    log::init(&config.log_level, args.log_json)?;

    info!(
        asn = config.asn,
        router_id = %config.router_id,
        listen = ?config.listen_addrs,
        peers = config.peers.len(),
        "starting BGP daemon"
    );

    let server = BgpServer::new(config)?;
    let handle = server.handle();
    let mut task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut task => {
            match result {
                Ok(Ok(())) => info!("server stopped"),
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task failed"),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "shutdown request failed");
    }
    match task.await {
        Ok(Err(e)) => error!(error = %e, "server error"),
        Err(e) => error!(error = %e, "server task failed"),
        Ok(Ok(())) => info!("server stopped"),
    }
    Ok(())
}
