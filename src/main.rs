// Copyright 2026 Bluebridge Team
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

//! Bluebridge daemon entry point.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluebridge::events::EventProcessor;
use bluebridge::sco::LogAudioRouter;
use bluebridge::{BluetoothService, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bluebridge=info".parse().unwrap()),
        )
        .init();

    info!("Starting Bluebridge v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Bring the Bluetooth stack up
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
    let service = BluetoothService::start(config, Arc::new(LogAudioRouter), event_tx).await?;
    info!(
        "Profiles up: OPP on channel {}, FTP on channel {}, HFP on channel {}",
        service.config().profiles.opp_channel,
        service.config().profiles.ftp_channel,
        service.config().profiles.hfp_channel
    );

    let mut processor = EventProcessor::new(service.state());

    // Run until interrupted
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if let Err(e) = processor.process_event(event) {
                    error!("Error processing event: {e:#}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.shutdown().await;
    info!("Bluebridge stopped");
    Ok(())
}
