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

mod config;
mod idle;
mod runtime;
mod session;
mod supervisor;

use std::sync::Arc;

use axum::Router;
use rand::{SeedableRng, rngs::StdRng};
use remote_wake::PanelWakeTrigger;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::ServiceConfig, runtime::Runtime, session::BridgeConnector, supervisor::Supervisor,
};

const LIVENESS_BODY: &str = "AFK rotation service is running.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "rotation_service=debug,remote_wake=info,tower_http=info".to_string()
        }))
        .init();

    let config = ServiceConfig::from_env()?;
    info!(
        host = %config.bridge.host,
        port = config.bridge.port,
        version = %config.bridge.version,
        identities = config.pool.names().len(),
        "rotation-service starting"
    );

    let listener = tokio::net::TcpListener::bind(&config.liveness_bind).await?;
    info!(bind_addr = %config.liveness_bind, "liveness endpoint listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, build_router()).await {
            warn!(error = %error, "liveness endpoint stopped");
        }
    });

    let wake = Arc::new(PanelWakeTrigger::from_env()?);
    let connector = Arc::new(BridgeConnector::new(config.bridge));
    let supervisor = Supervisor::new(config.rotation, config.pool, StdRng::from_os_rng());
    let runtime = Runtime::new(supervisor, connector, wake);

    tokio::select! {
        result = runtime.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("rotation-service shutting down");
        }
    }
    Ok(())
}

fn build_router() -> Router {
    Router::new()
        .fallback(liveness)
        .layer(TraceLayer::new_for_http())
}

async fn liveness() -> &'static str {
    LIVENESS_BODY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_answers_any_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router()).await.unwrap();
        });

        let client = reqwest::Client::new();
        for path in ["/", "/health", "/anything/else"] {
            let response = client
                .get(format!("http://{addr}{path}"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            assert_eq!(response.text().await.unwrap(), LIVENESS_BODY);
        }
    }
}
