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

//! Client for the hosting panel's start flow: log in, find the server
//! instance, ask it to start, and report how long the start should take.

use std::{sync::LazyLock, time::Duration};

use afk_common::{WakeEstimate, WakeTrigger, env_string};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_PANEL_BASE_URL: &str = "https://aternos.org";
const LOGIN_PATH: &str = "/panel/ajax/login.php";
const SERVER_LIST_PATH: &str = "/panel/ajax/getservers.php";
const SERVER_START_PATH: &str = "/panel/ajax/start.php";
const PANEL_USER_AGENT: &str = "GuardianBot/1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static TOKEN_COOKIE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ATtoken=([^;]+)").expect("token cookie pattern is valid"));

#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl PanelConfig {
    /// Reads credentials from the environment. Returns `None` when either
    /// credential is missing.
    pub fn from_env() -> Option<Self> {
        let username = env_string("ATERNOS_USERNAME")?;
        let password = env_string("ATERNOS_PASSWORD")?;
        Some(Self {
            base_url: env_string("ATERNOS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PANEL_BASE_URL.to_string()),
            username,
            password,
        })
    }
}

/// Cookies and optional anti-forgery token obtained from login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelSession {
    pub cookies: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { queue: Option<u64> },
    Queued { wait: u64 },
    AlreadyStarting,
}

impl StartOutcome {
    pub fn estimate(&self) -> WakeEstimate {
        match self {
            Self::Started { queue: Some(wait) } | Self::Queued { wait } => {
                WakeEstimate::reported(*wait)
            }
            Self::Started { queue: None } | Self::AlreadyStarting => WakeEstimate::panel_default(),
        }
    }

    /// Seconds reported to the operator, before the safety margin.
    pub fn wait_seconds(&self) -> u64 {
        match self {
            Self::Started { queue: Some(wait) } | Self::Queued { wait } => *wait,
            Self::Started { queue: None } | Self::AlreadyStarting => {
                afk_common::PANEL_DEFAULT_WAIT_SECONDS
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerListResponse {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    queue: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct PanelClient {
    client: reqwest::Client,
    config: PanelConfig,
}

impl PanelClient {
    pub fn new(config: PanelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build panel http client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Runs the whole start flow.
    pub async fn wake(&self) -> anyhow::Result<StartOutcome> {
        let session = self.login().await?;
        let server_id = self.find_server_id(&session).await?;
        self.request_start(&session, &server_id).await
    }

    pub async fn login(&self) -> anyhow::Result<PanelSession> {
        info!(base_url = %self.config.base_url, "logging in to panel");
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .header(USER_AGENT, PANEL_USER_AGENT)
            .form(&[
                ("user", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
                ("remember", "true"),
            ])
            .send()
            .await
            .context("failed to send panel login request")?;

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response
            .text()
            .await
            .context("failed to read panel login response")?;
        parse_login(&body)?;

        let session = session_from_set_cookies(&set_cookies)?;
        if session.token.is_none() {
            warn!("panel login returned no ATtoken cookie; continuing with session cookies only");
        }
        info!("panel login successful");
        Ok(session)
    }

    pub async fn find_server_id(&self, session: &PanelSession) -> anyhow::Result<String> {
        let body = self
            .client
            .get(self.url(SERVER_LIST_PATH))
            .header(USER_AGENT, PANEL_USER_AGENT)
            .header(COOKIE, &session.cookies)
            .send()
            .await
            .context("failed to fetch panel server list")?
            .text()
            .await
            .context("failed to read panel server list")?;
        let server_id = parse_server_id(&body)?;
        info!(server_id = %server_id, "found panel server instance");
        Ok(server_id)
    }

    pub async fn request_start(
        &self,
        session: &PanelSession,
        server_id: &str,
    ) -> anyhow::Result<StartOutcome> {
        info!(server_id = %server_id, "sending start command");
        let mut request = self
            .client
            .post(self.url(SERVER_START_PATH))
            .header(USER_AGENT, PANEL_USER_AGENT)
            .header(COOKIE, &session.cookies)
            .header(REFERER, format!("{}/server/", self.config.base_url.trim_end_matches('/')))
            .header("X-Requested-With", "XMLHttpRequest")
            .form(&[("id", server_id)]);
        if let Some(token) = &session.token {
            request = request.header("ATtoken", token);
        }

        let body = request
            .send()
            .await
            .context("failed to send panel start request")?
            .text()
            .await
            .context("failed to read panel start response")?;
        let outcome = parse_start(&body)?;
        match outcome {
            StartOutcome::Started { queue } => {
                info!(queue_seconds = ?queue, "server start command accepted")
            }
            StartOutcome::Queued { wait } => info!(wait_seconds = wait, "server queued for start"),
            StartOutcome::AlreadyStarting => info!("server is already starting"),
        }
        Ok(outcome)
    }
}

fn parse_login(body: &str) -> anyhow::Result<()> {
    let login = serde_json::from_str::<LoginResponse>(body)
        .with_context(|| format!("invalid panel login payload: {}", preview(body)))?;
    if !login.success {
        anyhow::bail!(
            "login failed: {}",
            login.err.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn session_from_set_cookies(headers: &[String]) -> anyhow::Result<PanelSession> {
    if headers.is_empty() {
        anyhow::bail!("login successful but missing required session cookies");
    }
    let cookies = headers
        .iter()
        .filter_map(|header| header.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    let token = headers.iter().find_map(|header| {
        TOKEN_COOKIE
            .captures(header)
            .map(|caps| caps[1].to_string())
    });
    Ok(PanelSession { cookies, token })
}

fn parse_server_id(body: &str) -> anyhow::Result<String> {
    let list = serde_json::from_str::<ServerListResponse>(body)
        .with_context(|| format!("invalid panel server list payload: {}", preview(body)))?;
    let Some(server) = list.servers.into_iter().next() else {
        anyhow::bail!("could not find any servers in the account");
    };
    match server.id {
        serde_json::Value::String(id) if !id.trim().is_empty() => Ok(id),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        other => anyhow::bail!("server entry has unusable id {other}"),
    }
}

fn parse_start(body: &str) -> anyhow::Result<StartOutcome> {
    let response = serde_json::from_str::<StartResponse>(body)
        .with_context(|| format!("non-JSON start response received: {}", preview(body)))?;
    let queue = response.queue.as_ref().and_then(queue_seconds);

    match response.status.as_deref() {
        Some("queue") => Ok(queue
            .map(|wait| StartOutcome::Queued { wait })
            .unwrap_or(StartOutcome::Started { queue: None })),
        Some("starting") => Ok(StartOutcome::AlreadyStarting),
        Some("success") => Ok(StartOutcome::Started { queue }),
        _ if response.success == Some(true) => Ok(StartOutcome::Started { queue }),
        _ => anyhow::bail!(
            "server start failed: {}",
            response.message.unwrap_or_else(|| preview(body))
        ),
    }
}

fn queue_seconds(value: &serde_json::Value) -> Option<u64> {
    let seconds = match value {
        serde_json::Value::Number(number) => number.as_u64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    seconds.filter(|seconds| *seconds > 0)
}

fn preview(body: &str) -> String {
    let mut out: String = body.chars().take(100).collect();
    if body.chars().count() > 100 {
        out.push_str("...");
    }
    out
}

/// [`WakeTrigger`] backed by the panel start flow. Without credentials every
/// attempt resolves to the fallback estimate.
pub struct PanelWakeTrigger {
    client: Option<PanelClient>,
}

impl PanelWakeTrigger {
    pub fn new(client: Option<PanelClient>) -> Self {
        Self { client }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let client = PanelConfig::from_env().map(PanelClient::new).transpose()?;
        if client.is_none() {
            warn!("ATERNOS_USERNAME or ATERNOS_PASSWORD not set; remote wake will only wait");
        }
        Ok(Self { client })
    }
}

#[async_trait]
impl WakeTrigger for PanelWakeTrigger {
    async fn attempt_wake(&self) -> WakeEstimate {
        let Some(client) = &self.client else {
            return WakeEstimate::fallback();
        };
        match client.wake().await {
            Ok(outcome) => outcome.estimate(),
            Err(error) => {
                warn!(error = %format!("{:#}", error), "could not start server via panel");
                WakeEstimate::fallback()
            }
        }
    }
}
