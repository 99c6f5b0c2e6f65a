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

//! Session client adapter. Each session is one simulated participant driven
//! through an external bridge process that owns the game protocol and the
//! navigator; this side only speaks newline-delimited JSON with it.

use std::{process::Stdio, sync::Arc, time::Duration};

use afk_common::{FailureKind, classify_failure, classify_io_failure};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    idle::IdleAction,
    supervisor::{Event, SessionId},
};

pub const QUIT_REASON: &str = "disconnect.quitting";
const QUIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Spawned {
        players: Vec<String>,
        time_of_day: Option<i64>,
    },
    PlayerJoined {
        username: String,
    },
    PlayerLeft {
        username: String,
    },
    TimeOfDay {
        time_of_day: i64,
    },
    Slept,
    RestFailed {
        reason: String,
    },
    Woke,
    Error {
        kind: FailureKind,
        message: String,
    },
    Disconnected {
        reason: String,
        intentional: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOp {
    /// Stop pathing and release forward, back, sneak and jump.
    ClearControls,
    Idle(IdleAction),
    SeekRest { max_distance: u32 },
    Chat { message: String },
}

pub trait SessionHandle: Send {
    fn perform(&self, op: SessionOp);
    /// Graceful, intentional disconnect.
    fn quit(&self);
}

pub trait SessionConnector: Send + Sync {
    /// Starts connecting `identity` in the background. Everything that happens
    /// to the connection afterwards, failures included, arrives on `events`.
    fn connect(
        &self,
        session: SessionId,
        identity: &str,
        events: mpsc::UnboundedSender<Event>,
    ) -> Box<dyn SessionHandle>;
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub command: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub auth: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Spawn {
        #[serde(default)]
        players: Vec<String>,
        #[serde(default)]
        time_of_day: Option<i64>,
    },
    PlayerJoined {
        username: String,
    },
    PlayerLeft {
        username: String,
    },
    Time {
        time_of_day: i64,
    },
    Slept,
    RestFailed {
        #[serde(default)]
        reason: String,
    },
    Wake,
    Error {
        message: String,
    },
    End {
        #[serde(default)]
        reason: String,
    },
}

impl BridgeEvent {
    fn into_session_event(self, quit_requested: bool) -> SessionEvent {
        match self {
            Self::Spawn {
                players,
                time_of_day,
            } => SessionEvent::Spawned {
                players,
                time_of_day,
            },
            Self::PlayerJoined { username } => SessionEvent::PlayerJoined { username },
            Self::PlayerLeft { username } => SessionEvent::PlayerLeft { username },
            Self::Time { time_of_day } => SessionEvent::TimeOfDay { time_of_day },
            Self::Slept => SessionEvent::Slept,
            Self::RestFailed { reason } => SessionEvent::RestFailed { reason },
            Self::Wake => SessionEvent::Woke,
            Self::Error { message } => SessionEvent::Error {
                kind: classify_failure(&message),
                message,
            },
            Self::End { reason } => SessionEvent::Disconnected {
                reason,
                intentional: quit_requested,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeCommand {
    ClearControls,
    Control { control: &'static str, state: bool },
    Look { yaw: f32, pitch: f32 },
    Jump,
    SeekRest { max_distance: u32 },
    Chat { message: String },
    Quit { reason: String },
}

fn bridge_command(op: SessionOp) -> BridgeCommand {
    match op {
        SessionOp::ClearControls => BridgeCommand::ClearControls,
        SessionOp::Idle(IdleAction::Advance) => BridgeCommand::Control {
            control: "forward",
            state: true,
        },
        SessionOp::Idle(IdleAction::Crouch) => BridgeCommand::Control {
            control: "sneak",
            state: true,
        },
        SessionOp::Idle(IdleAction::Look { yaw, pitch }) => BridgeCommand::Look { yaw, pitch },
        SessionOp::Idle(IdleAction::Jump) => BridgeCommand::Jump,
        SessionOp::SeekRest { max_distance } => BridgeCommand::SeekRest { max_distance },
        SessionOp::Chat { message } => BridgeCommand::Chat { message },
    }
}

enum BridgeControl {
    Op(SessionOp),
    Quit,
}

struct BridgeHandle {
    control_tx: mpsc::UnboundedSender<BridgeControl>,
}

impl SessionHandle for BridgeHandle {
    fn perform(&self, op: SessionOp) {
        if self.control_tx.send(BridgeControl::Op(op)).is_err() {
            debug!("session bridge already gone; dropping op");
        }
    }

    fn quit(&self) {
        let _ = self.control_tx.send(BridgeControl::Quit);
    }
}

/// Spawns one bridge process per session.
pub struct BridgeConnector {
    settings: Arc<BridgeSettings>,
}

impl BridgeConnector {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl SessionConnector for BridgeConnector {
    fn connect(
        &self,
        session: SessionId,
        identity: &str,
        events: mpsc::UnboundedSender<Event>,
    ) -> Box<dyn SessionHandle> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let settings = self.settings.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            run_bridge(settings, session, identity, events, control_rx).await;
        });
        Box::new(BridgeHandle { control_tx })
    }
}

struct EventSink {
    session: SessionId,
    events: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(Event::Session {
            session: self.session,
            event,
        });
    }
}

async fn run_bridge(
    settings: Arc<BridgeSettings>,
    session: SessionId,
    identity: String,
    events: mpsc::UnboundedSender<Event>,
    control_rx: mpsc::UnboundedReceiver<BridgeControl>,
) {
    info!(
        identity = %identity,
        session_id = session,
        host = %settings.host,
        port = settings.port,
        version = %settings.version,
        "connecting session"
    );
    let sink = EventSink { session, events };
    let mut quit_requested = false;
    if let Err(error) =
        drive_bridge(&settings, &identity, &sink, control_rx, &mut quit_requested).await
    {
        let message = format!("{:#}", error);
        warn!(identity = %identity, session_id = session, error = %message, "session bridge failed");
        let kind = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>())
            .map(classify_io_failure)
            .unwrap_or_else(|| classify_failure(&message));
        sink.emit(SessionEvent::Error {
            kind,
            message: message.clone(),
        });
        sink.emit(SessionEvent::Disconnected {
            reason: message,
            intentional: quit_requested,
        });
    }
}

async fn drive_bridge(
    settings: &BridgeSettings,
    identity: &str,
    sink: &EventSink,
    mut control_rx: mpsc::UnboundedReceiver<BridgeControl>,
    quit_requested: &mut bool,
) -> anyhow::Result<()> {
    let mut parts = settings.command.split_whitespace();
    let program = parts.next().context("session bridge command is empty")?;
    let mut child = Command::new(program)
        .args(parts)
        .env("AFK_HOST", &settings.host)
        .env("AFK_PORT", settings.port.to_string())
        .env("AFK_USERNAME", identity)
        .env("AFK_VERSION", &settings.version)
        .env("AFK_AUTH", &settings.auth)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn session bridge {program}"))?;
    let mut stdin = child.stdin.take().context("session bridge stdin unavailable")?;
    let stdout = child
        .stdout
        .take()
        .context("session bridge stdout unavailable")?;
    let mut lines = BufReader::new(stdout).lines();

    let connect_deadline = tokio::time::sleep(settings.connect_timeout);
    tokio::pin!(connect_deadline);
    let mut spawned = false;

    loop {
        tokio::select! {
            _ = &mut connect_deadline, if !spawned => {
                let _ = child.kill().await;
                anyhow::bail!(
                    "connection timed out after {}s",
                    settings.connect_timeout.as_secs_f32()
                );
            }
            control = control_rx.recv() => match control {
                Some(BridgeControl::Op(op)) => {
                    write_command(&mut stdin, &bridge_command(op)).await?;
                }
                Some(BridgeControl::Quit) | None => {
                    *quit_requested = true;
                    let quit = BridgeCommand::Quit { reason: QUIT_REASON.to_string() };
                    if let Err(error) = write_command(&mut stdin, &quit).await {
                        debug!(identity = %identity, error = %error, "quit not delivered to session bridge");
                    }
                    if tokio::time::timeout(QUIT_GRACE, child.wait()).await.is_err() {
                        let _ = child.kill().await;
                    }
                    sink.emit(SessionEvent::Disconnected {
                        reason: QUIT_REASON.to_string(),
                        intentional: true,
                    });
                    return Ok(());
                }
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read session bridge output")? else {
                    let status = child.wait().await.context("failed to reap session bridge")?;
                    sink.emit(SessionEvent::Disconnected {
                        reason: format!("session bridge exited with {status}"),
                        intentional: *quit_requested,
                    });
                    return Ok(());
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<BridgeEvent>(line) {
                    Ok(event) => event,
                    Err(error) => {
                        debug!(identity = %identity, error = %error, line = %line, "ignoring unrecognised bridge output");
                        continue;
                    }
                };
                let ended = matches!(event, BridgeEvent::End { .. });
                if matches!(event, BridgeEvent::Spawn { .. }) {
                    spawned = true;
                }
                sink.emit(event.into_session_event(*quit_requested));
                if ended {
                    let _ = tokio::time::timeout(QUIT_GRACE, child.wait()).await;
                    return Ok(());
                }
            }
        }
    }
}

async fn write_command(stdin: &mut ChildStdin, command: &BridgeCommand) -> anyhow::Result<()> {
    let mut payload =
        serde_json::to_string(command).context("failed to encode session bridge command")?;
    payload.push('\n');
    stdin
        .write_all(payload.as_bytes())
        .await
        .context("failed to write to session bridge")?;
    stdin
        .flush()
        .await
        .context("failed to flush session bridge input")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn bridge_events_map_to_session_events() {
        let event: BridgeEvent = serde_json::from_str(
            r#"{"event":"spawn","players":["Madara","Eve"],"time_of_day":14000}"#,
        )
        .unwrap();
        assert_eq!(
            event.into_session_event(false),
            SessionEvent::Spawned {
                players: vec!["Madara".to_string(), "Eve".to_string()],
                time_of_day: Some(14000),
            }
        );

        let error: BridgeEvent =
            serde_json::from_str(r#"{"event":"error","message":"connect ECONNREFUSED 10.0.0.1:25565"}"#)
                .unwrap();
        assert!(matches!(
            error.into_session_event(false),
            SessionEvent::Error {
                kind: FailureKind::Unreachable,
                ..
            }
        ));

        let end: BridgeEvent =
            serde_json::from_str(r#"{"event":"end","reason":"socketClosed"}"#).unwrap();
        assert_eq!(
            end.into_session_event(true),
            SessionEvent::Disconnected {
                reason: "socketClosed".to_string(),
                intentional: true,
            }
        );
    }

    #[test]
    fn idle_actions_encode_as_bridge_ops() {
        let encoded: Vec<String> = [
            SessionOp::ClearControls,
            SessionOp::Idle(IdleAction::Advance),
            SessionOp::Idle(IdleAction::Crouch),
            SessionOp::Idle(IdleAction::Jump),
            SessionOp::SeekRest { max_distance: 32 },
        ]
        .into_iter()
        .map(bridge_command)
        .map(|command| serde_json::to_string(&command).unwrap())
        .collect();

        assert_eq!(
            encoded,
            vec![
                r#"{"op":"clear_controls"}"#,
                r#"{"op":"control","control":"forward","state":true}"#,
                r#"{"op":"control","control":"sneak","state":true}"#,
                r#"{"op":"jump"}"#,
                r#"{"op":"seek_rest","max_distance":32}"#,
            ]
        );
    }

    fn bridge_script(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "afk-bridge-{}-{}.sh",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    fn settings(script: &Path, connect_timeout: Duration) -> BridgeSettings {
        BridgeSettings {
            command: format!("sh {}", script.display()),
            host: "127.0.0.1".to_string(),
            port: 25565,
            version: "1.20.4".to_string(),
            auth: "offline".to_string(),
            connect_timeout,
        }
    }

    async fn next_session_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> SessionEvent {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("bridge event within timeout")
            .expect("event channel open");
        match event {
            Event::Session { event, .. } => event,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn bridge_reports_spawn_and_intentional_quit() {
        let script = bridge_script(
            "quit",
            "echo '{\"event\":\"spawn\",\"players\":[\"'\"$AFK_USERNAME\"'\"],\"time_of_day\":1000}'\nread line\necho '{\"event\":\"end\",\"reason\":\"disconnect.quitting\"}'\n",
        );
        let connector = BridgeConnector::new(settings(&script, Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = connector.connect(7, "Madara", tx);
        assert_eq!(
            next_session_event(&mut rx).await,
            SessionEvent::Spawned {
                players: vec!["Madara".to_string()],
                time_of_day: Some(1000),
            }
        );

        handle.quit();
        assert_eq!(
            next_session_event(&mut rx).await,
            SessionEvent::Disconnected {
                reason: QUIT_REASON.to_string(),
                intentional: true,
            }
        );
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn silent_bridge_times_out_as_unreachable() {
        let script = bridge_script("silent", "sleep 30\n");
        let connector = BridgeConnector::new(settings(&script, Duration::from_millis(200)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = connector.connect(3, "Obito", tx);
        match next_session_event(&mut rx).await {
            SessionEvent::Error { kind, message } => {
                assert_eq!(kind, FailureKind::Unreachable);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(
            next_session_event(&mut rx).await,
            SessionEvent::Disconnected {
                intentional: false,
                ..
            }
        ));
        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn bridge_exit_without_end_is_unexpected_disconnect() {
        let script = bridge_script(
            "crash",
            "echo '{\"event\":\"spawn\"}'\nexit 3\n",
        );
        let connector = BridgeConnector::new(settings(&script, Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _handle = connector.connect(9, "Shisui", tx);
        assert!(matches!(
            next_session_event(&mut rx).await,
            SessionEvent::Spawned { .. }
        ));
        match next_session_event(&mut rx).await {
            SessionEvent::Disconnected {
                reason,
                intentional,
            } => {
                assert!(!intentional);
                assert!(reason.contains("exited"));
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        let _ = std::fs::remove_file(script);
    }
}
