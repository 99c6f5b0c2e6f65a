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

//! Executes supervisor commands on tokio and feeds the results back as events.

use std::{collections::HashMap, sync::Arc};

use afk_common::WakeTrigger;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    session::{SessionConnector, SessionEvent, SessionHandle},
    supervisor::{Command, Event, SessionId, Supervisor, TimerToken},
};

pub struct Runtime {
    supervisor: Supervisor,
    connector: Arc<dyn SessionConnector>,
    wake: Arc<dyn WakeTrigger>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    sessions: HashMap<SessionId, Box<dyn SessionHandle>>,
    timers: HashMap<TimerToken, JoinHandle<()>>,
}

impl Runtime {
    pub fn new(
        supervisor: Supervisor,
        connector: Arc<dyn SessionConnector>,
        wake: Arc<dyn WakeTrigger>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            supervisor,
            connector,
            wake,
            events_tx,
            events_rx,
            sessions: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Runs until the event channel closes, which only happens if every
    /// sender (including the one held here) is gone.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.dispatch(Event::Start);
        while let Some(event) = self.events_rx.recv().await {
            match &event {
                Event::TimerFired { token, .. } => {
                    self.timers.remove(token);
                }
                Event::Session {
                    session,
                    event: SessionEvent::Disconnected { .. },
                } => {
                    self.sessions.remove(session);
                }
                _ => {}
            }
            self.dispatch(event);
        }
        warn!("event channel closed; rotation runtime stopping");
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let before = (self.supervisor.phase(), self.supervisor.recovery());
        for command in self.supervisor.handle(event) {
            self.execute(command);
        }
        let after = (self.supervisor.phase(), self.supervisor.recovery());
        if before != after {
            info!(
                phase = ?after.0,
                recovery = ?after.1,
                active = %self.supervisor.active_identity(),
                sessions = self.supervisor.session_count(),
                handovers = self.supervisor.handovers(),
                "rotation state changed"
            );
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { session, identity } => {
                let handle = self
                    .connector
                    .connect(session, &identity, self.events_tx.clone());
                self.sessions.insert(session, handle);
            }
            Command::Perform { session, op } => match self.sessions.get(&session) {
                Some(handle) => handle.perform(op),
                None => debug!(session_id = session, op = ?op, "no live handle for session op"),
            },
            Command::Quit { session } => {
                if let Some(handle) = self.sessions.remove(&session) {
                    handle.quit();
                }
            }
            Command::Schedule {
                timer,
                token,
                after,
            } => {
                let events_tx = self.events_tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = events_tx.send(Event::TimerFired { timer, token });
                });
                if let Some(previous) = self.timers.insert(token, handle) {
                    previous.abort();
                }
            }
            Command::Cancel { token } => {
                if let Some(handle) = self.timers.remove(&token) {
                    handle.abort();
                }
            }
            Command::AttemptWake => {
                info!("dispatching remote start request");
                let wake = self.wake.clone();
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let estimate = wake.attempt_wake().await;
                    let _ = events_tx.send(Event::WakeCompleted(estimate));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::SessionOp,
        supervisor::{Phase, RotationSettings},
    };
    use afk_common::{FailureKind, IdentityPool, WakeEstimate};
    use async_trait::async_trait;
    use rand::{SeedableRng, rngs::StdRng};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(SessionId, String),
        Perform(SessionId, SessionOp),
        Quit(SessionId),
    }

    #[derive(Clone, Default)]
    struct RecordingConnector {
        calls: Arc<Mutex<Vec<Call>>>,
        unreachable_once: Arc<AtomicUsize>,
    }

    impl RecordingConnector {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn connects(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Connect(_, identity) => Some(identity),
                    _ => None,
                })
                .collect()
        }
    }

    struct RecordingHandle {
        session: SessionId,
        calls: Arc<Mutex<Vec<Call>>>,
        events: mpsc::UnboundedSender<Event>,
    }

    impl SessionHandle for RecordingHandle {
        fn perform(&self, op: SessionOp) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Perform(self.session, op));
        }

        fn quit(&self) {
            self.calls.lock().unwrap().push(Call::Quit(self.session));
            let _ = self.events.send(Event::Session {
                session: self.session,
                event: SessionEvent::Disconnected {
                    reason: crate::session::QUIT_REASON.to_string(),
                    intentional: true,
                },
            });
        }
    }

    impl SessionConnector for RecordingConnector {
        fn connect(
            &self,
            session: SessionId,
            identity: &str,
            events: mpsc::UnboundedSender<Event>,
        ) -> Box<dyn SessionHandle> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Connect(session, identity.to_string()));

            let unreachable = self
                .unreachable_once
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            let first = if unreachable {
                SessionEvent::Error {
                    kind: FailureKind::Unreachable,
                    message: "connect ECONNREFUSED 127.0.0.1:25565".to_string(),
                }
            } else {
                SessionEvent::Spawned {
                    players: vec![identity.to_string()],
                    time_of_day: Some(1_000),
                }
            };
            let _ = events.send(Event::Session {
                session,
                event: first,
            });

            Box::new(RecordingHandle {
                session,
                calls: self.calls.clone(),
                events,
            })
        }
    }

    #[derive(Default)]
    struct CountingWake {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WakeTrigger for CountingWake {
        async fn attempt_wake(&self) -> WakeEstimate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            WakeEstimate {
                wait: Duration::from_millis(50),
                ..WakeEstimate::fallback()
            }
        }
    }

    fn fast_settings() -> RotationSettings {
        RotationSettings {
            rotation_interval: Duration::from_millis(200),
            overlap: Duration::from_millis(40),
            polling_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            action_interval: Duration::from_millis(30),
            greeting_delay: Duration::from_millis(10),
            crash_cooldown: Duration::from_millis(50),
            ..RotationSettings::default()
        }
    }

    fn runtime(connector: &RecordingConnector, wake: &Arc<CountingWake>) -> Runtime {
        let pool = IdentityPool::new(["Madara", "Obito"]).unwrap();
        let supervisor = Supervisor::new(fast_settings(), pool, StdRng::seed_from_u64(3));
        Runtime::new(supervisor, Arc::new(connector.clone()), wake.clone())
    }

    #[tokio::test]
    async fn rotates_sessions_on_real_timers() {
        let connector = RecordingConnector::default();
        let wake = Arc::new(CountingWake::default());
        let task = tokio::spawn(runtime(&connector, &wake).run());

        tokio::time::sleep(Duration::from_millis(330)).await;
        task.abort();

        assert_eq!(connector.connects(), vec!["Madara", "Obito"]);
        let calls = connector.calls();
        assert!(calls.contains(&Call::Quit(1)));
        assert!(
            calls
                .iter()
                .any(|call| matches!(call, Call::Perform(_, SessionOp::Idle(_))))
        );
        assert_eq!(wake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_connect_requests_wake_and_reconnects() {
        let connector = RecordingConnector::default();
        connector.unreachable_once.store(1, Ordering::SeqCst);
        let wake = Arc::new(CountingWake::default());
        let task = tokio::spawn(runtime(&connector, &wake).run());

        tokio::time::sleep(Duration::from_millis(120)).await;
        task.abort();

        assert_eq!(wake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects(), vec!["Madara", "Madara"]);
    }

    #[tokio::test]
    async fn cancelled_timers_are_aborted_and_forgotten() {
        let connector = RecordingConnector::default();
        let wake = Arc::new(CountingWake::default());
        let mut runtime = runtime(&connector, &wake);
        runtime.dispatch(Event::Start);
        assert!(!runtime.timers.is_empty());

        let tokens: Vec<TimerToken> = runtime.timers.keys().copied().collect();
        for token in tokens {
            runtime.execute(Command::Cancel { token });
        }
        assert!(runtime.timers.is_empty());
        assert_eq!(runtime.supervisor.phase(), Phase::Rotating);
    }
}
