// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use remote_wake::{PanelClient, PanelConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "remote_wake=info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let Some(config) = PanelConfig::from_env() else {
        warn!("ATERNOS_USERNAME or ATERNOS_PASSWORD is not set; cannot start server");
        std::process::exit(1);
    };

    let outcome = match PanelClient::new(config) {
        Ok(client) => client.wake().await,
        Err(error) => Err(error),
    };
    match outcome {
        Ok(outcome) => {
            let wait_seconds = outcome.wait_seconds();
            info!(wait_seconds, "start flow complete");
            println!("WAIT_TIME_SECONDS:{wait_seconds}");
        }
        Err(error) => {
            warn!(error = %format!("{:#}", error), "could not start server");
        }
    }
    Ok(())
}
