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

//! Rotation supervisor: the single owner of rotation state.
//!
//! Every input (session lifecycle, timer fires, wake completions) arrives as
//! an [`Event`] and every side effect leaves as a [`Command`]. The runtime
//! executes commands and feeds results back as new events, so the supervisor
//! itself never blocks and never shares its state.

use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use afk_common::{
    FailureKind, IdentityPool, Occupancy, WakeEstimate, classify_failure, classify_occupancy,
    random_greeting,
};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::{
    idle::{self, IdleDecision, IdleView, REST_SEARCH_RADIUS},
    session::{SessionEvent, SessionOp},
};

pub type SessionId = u64;

/// Idle ticks a rest attempt may take before it is abandoned.
const REST_ATTEMPT_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Rotation,
    Overlap(SessionId),
    IdleTick(SessionId),
    RestTimeout(SessionId),
    Poll,
    ProbeTimeout(SessionId),
    Greeting { session: SessionId, player: String },
    Resume,
}

impl TimerKind {
    fn session(&self) -> Option<SessionId> {
        match self {
            Self::Overlap(session)
            | Self::IdleTick(session)
            | Self::RestTimeout(session)
            | Self::ProbeTimeout(session)
            | Self::Greeting { session, .. } => Some(*session),
            Self::Rotation | Self::Poll | Self::Resume => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Session {
        session: SessionId,
        event: SessionEvent,
    },
    TimerFired {
        timer: TimerKind,
        token: TimerToken,
    },
    WakeCompleted(WakeEstimate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect {
        session: SessionId,
        identity: String,
    },
    Perform {
        session: SessionId,
        op: SessionOp,
    },
    /// Intentional disconnect; the session is already forgotten.
    Quit { session: SessionId },
    Schedule {
        timer: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    Cancel { token: TimerToken },
    AttemptWake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Rotating,
    HandoverPending { incoming: SessionId },
    PollingStandby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCause {
    Wake,
    Crash,
}

/// Offline recovery sub-state. While set, the rotation timer is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    WakeInFlight,
    ResumePending(ResumeCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Candidate,
    Probe,
}

#[derive(Debug, Clone)]
pub struct RotationSettings {
    pub max_human_players: usize,
    pub rotation_interval: Duration,
    pub overlap: Duration,
    pub polling_interval: Duration,
    pub probe_timeout: Duration,
    pub action_interval: Duration,
    pub greeting_delay: Duration,
    pub crash_cooldown: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            max_human_players: afk_common::DEFAULT_MAX_HUMAN_PLAYERS,
            rotation_interval: Duration::from_secs(8 * 60),
            overlap: Duration::from_secs(10),
            polling_interval: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(30),
            action_interval: Duration::from_secs(10),
            greeting_delay: Duration::from_secs(3),
            crash_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    id: SessionId,
    identity: String,
    role: Role,
    connected: bool,
    sleeping: bool,
    resting: bool,
    players: BTreeSet<String>,
    time_of_day: Option<i64>,
}

impl Session {
    fn idle_view(&self) -> IdleView {
        IdleView {
            sleeping: self.sleeping,
            resting: self.resting,
            time_of_day: self.time_of_day,
        }
    }
}

pub struct Supervisor {
    settings: RotationSettings,
    pool: IdentityPool,
    active_index: usize,
    phase: Phase,
    recovery: Option<Recovery>,
    started: bool,
    standby_since: Option<DateTime<Utc>>,
    sessions: HashMap<String, Session>,
    timers: HashMap<TimerKind, TimerToken>,
    next_session_id: SessionId,
    next_token: u64,
    handovers: u64,
    rng: StdRng,
    commands: Vec<Command>,
}

impl Supervisor {
    pub fn new(settings: RotationSettings, pool: IdentityPool, rng: StdRng) -> Self {
        Self {
            settings,
            pool,
            active_index: 0,
            phase: Phase::Rotating,
            recovery: None,
            started: false,
            standby_since: None,
            sessions: HashMap::new(),
            timers: HashMap::new(),
            next_session_id: 1,
            next_token: 1,
            handovers: 0,
            rng,
            commands: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn recovery(&self) -> Option<Recovery> {
        self.recovery
    }

    pub fn active_identity(&self) -> &str {
        self.pool.name(self.active_index)
    }

    pub fn handovers(&self) -> u64 {
        self.handovers
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs one event to completion and returns the side effects it produced.
    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        match event {
            Event::Start => self.on_start(),
            Event::Session { session, event } => self.on_session_event(session, event),
            Event::TimerFired { timer, token } => self.on_timer(timer, token),
            Event::WakeCompleted(estimate) => self.on_wake_completed(estimate),
        }
        std::mem::take(&mut self.commands)
    }

    fn on_start(&mut self) {
        if self.started {
            debug!("start requested twice; ignoring");
            return;
        }
        self.started = true;
        info!(
            identities = ?self.pool.names(),
            max_human_players = self.settings.max_human_players,
            rotation_interval_secs = self.settings.rotation_interval.as_secs(),
            "starting rotation supervisor"
        );
        self.start_rotation();
    }

    fn start_rotation(&mut self) {
        self.phase = Phase::Rotating;
        self.recovery = None;
        self.standby_since = None;
        let identity = self.active_identity().to_string();
        info!(identity = %identity, "starting rotation with active identity");
        self.spawn(&identity, Role::Active);
        self.schedule(TimerKind::Rotation, self.settings.rotation_interval);
    }

    fn on_session_event(&mut self, session_id: SessionId, event: SessionEvent) {
        let Some(identity) = self.identity_for(session_id) else {
            debug!(session_id, event = ?event, "event for a session that is no longer tracked");
            return;
        };

        match event {
            SessionEvent::Spawned {
                players,
                time_of_day,
            } => self.on_spawned(&identity, players, time_of_day),
            SessionEvent::PlayerJoined { username } => self.on_player_joined(&identity, username),
            SessionEvent::PlayerLeft { username } => self.on_player_left(&identity, username),
            SessionEvent::TimeOfDay { time_of_day } => {
                if let Some(session) = self.sessions.get_mut(&identity) {
                    session.time_of_day = Some(time_of_day);
                }
            }
            SessionEvent::Slept => {
                if let Some(session) = self.sessions.get_mut(&identity) {
                    session.sleeping = true;
                    session.resting = false;
                    let id = session.id;
                    self.cancel(&TimerKind::RestTimeout(id));
                }
                info!(identity = %identity, "session is now sleeping");
            }
            SessionEvent::RestFailed { reason } => self.on_rest_failed(&identity, reason),
            SessionEvent::Woke => self.on_woke(&identity),
            SessionEvent::Error { kind, message } => {
                warn!(identity = %identity, session_id, kind = ?kind, error = %message, "session error");
                if kind == FailureKind::Unreachable {
                    self.begin_recovery(&message);
                }
            }
            SessionEvent::Disconnected {
                reason,
                intentional,
            } => self.on_disconnected(&identity, reason, intentional),
        }
    }

    fn on_spawned(&mut self, identity: &str, players: Vec<String>, time_of_day: Option<i64>) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        session.connected = true;
        session.players = players.into_iter().collect();
        session.players.insert(identity.to_string());
        session.time_of_day = time_of_day;
        let (id, role) = (session.id, session.role);
        info!(identity = %identity, session_id = id, role = ?role, "session spawned");

        if role == Role::Probe {
            self.on_probe_spawned(identity, id);
            return;
        }

        if self.check_occupancy(identity) == Occupancy::OverThreshold {
            return;
        }
        self.schedule(TimerKind::IdleTick(id), self.settings.action_interval);
        if role == Role::Candidate {
            self.schedule(TimerKind::Overlap(id), self.settings.overlap);
        }
    }

    fn on_probe_spawned(&mut self, identity: &str, id: SessionId) {
        self.cancel(&TimerKind::ProbeTimeout(id));
        let Some(session) = self.sessions.get(identity) else {
            return;
        };
        let (occupancy, humans) =
            classify_occupancy(&session.players, &self.pool, self.settings.max_human_players);
        self.quit_session(identity);

        if occupancy == Occupancy::OverThreshold {
            info!(
                humans,
                max_human_players = self.settings.max_human_players,
                "server still over human threshold; staying in standby"
            );
            self.schedule(TimerKind::Poll, self.settings.polling_interval);
        } else {
            info!(humans, "human count back under threshold; resuming rotation");
            self.start_rotation();
        }
    }

    fn on_player_joined(&mut self, identity: &str, username: String) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        session.players.insert(username.clone());
        let (id, role, connected) = (session.id, session.role, session.connected);
        if !connected || role == Role::Probe {
            return;
        }

        if !self.pool.contains(&username) {
            info!(identity = %identity, player = %username, "player joined");
            if self.holds_active_slot(identity) {
                self.schedule(
                    TimerKind::Greeting {
                        session: id,
                        player: username,
                    },
                    self.settings.greeting_delay,
                );
            }
        }
        self.check_occupancy(identity);
    }

    fn on_player_left(&mut self, identity: &str, username: String) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        session.players.remove(&username);
        if session.connected && session.role != Role::Probe {
            self.check_occupancy(identity);
        }
    }

    fn on_rest_failed(&mut self, identity: &str, reason: String) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        session.resting = false;
        let (id, sleeping) = (session.id, session.sleeping);
        self.cancel(&TimerKind::RestTimeout(id));
        warn!(identity = %identity, reason = %reason, "could not sleep; falling back to idle action");
        if !sleeping {
            let action = idle::random_action(&mut self.rng);
            self.perform_micro(id, action);
        }
    }

    fn on_woke(&mut self, identity: &str) {
        let Some(session) = self.sessions.get_mut(identity) else {
            return;
        };
        session.sleeping = false;
        session.resting = false;
        let id = session.id;
        self.cancel(&TimerKind::RestTimeout(id));
        info!(identity = %identity, "session woke up; resuming idle actions");
        self.schedule(TimerKind::IdleTick(id), self.settings.action_interval);
    }

    fn on_disconnected(&mut self, identity: &str, reason: String, intentional: bool) {
        let Some(session) = self.forget_session(identity) else {
            return;
        };
        warn!(
            identity = %identity,
            session_id = session.id,
            reason = %reason,
            intentional,
            "session disconnected"
        );
        if intentional {
            return;
        }
        if classify_failure(&reason) == FailureKind::Unreachable {
            self.begin_recovery(&reason);
            return;
        }

        match session.role {
            Role::Probe => {
                if self.phase == Phase::PollingStandby {
                    self.schedule(TimerKind::Poll, self.settings.polling_interval);
                }
            }
            Role::Candidate => {
                if self.phase == (Phase::HandoverPending { incoming: session.id }) {
                    warn!(identity = %identity, "incoming session dropped; handover abandoned");
                    self.phase = Phase::Rotating;
                }
            }
            Role::Active => self.on_active_crash(identity),
        }
    }

    fn on_active_crash(&mut self, identity: &str) {
        if self.recovery.is_some() || self.phase == Phase::PollingStandby {
            return;
        }
        self.cancel(&TimerKind::Rotation);
        self.teardown_sessions();
        self.phase = Phase::Rotating;
        self.active_index = self.pool.next_index(self.active_index);
        self.recovery = Some(Recovery::ResumePending(ResumeCause::Crash));
        warn!(
            crashed = %identity,
            next_identity = %self.active_identity(),
            cooldown_secs = self.settings.crash_cooldown.as_secs(),
            "active session crashed; restarting full cycle after cooldown"
        );
        self.schedule(TimerKind::Resume, self.settings.crash_cooldown);
    }

    fn begin_recovery(&mut self, reason: &str) {
        match self.recovery {
            Some(Recovery::WakeInFlight) | Some(Recovery::ResumePending(ResumeCause::Wake)) => {
                debug!(reason = %reason, "server already recovering; ignoring failure");
                return;
            }
            Some(Recovery::ResumePending(ResumeCause::Crash)) | None => {}
        }
        warn!(reason = %reason, "server unreachable; requesting remote start");
        self.cancel(&TimerKind::Rotation);
        self.cancel(&TimerKind::Poll);
        self.cancel(&TimerKind::Resume);
        self.teardown_sessions();
        self.phase = Phase::Rotating;
        self.standby_since = None;
        self.recovery = Some(Recovery::WakeInFlight);
        self.commands.push(Command::AttemptWake);
    }

    fn on_wake_completed(&mut self, estimate: WakeEstimate) {
        if self.recovery != Some(Recovery::WakeInFlight) {
            debug!(estimate = ?estimate, "wake completion without a wake in flight");
            return;
        }
        info!(
            wait_secs = estimate.wait.as_secs(),
            source = ?estimate.source,
            "remote start attempted; waiting before reconnecting"
        );
        self.recovery = Some(Recovery::ResumePending(ResumeCause::Wake));
        self.schedule(TimerKind::Resume, estimate.wait);
    }

    /// Returns the classification and enters standby when over threshold.
    fn check_occupancy(&mut self, identity: &str) -> Occupancy {
        let Some(session) = self.sessions.get(identity) else {
            return Occupancy::Normal;
        };
        let (occupancy, humans) =
            classify_occupancy(&session.players, &self.pool, self.settings.max_human_players);
        match occupancy {
            Occupancy::OverThreshold if self.phase != Phase::PollingStandby => {
                self.enter_standby(humans)
            }
            Occupancy::OverThreshold => {}
            Occupancy::Normal => debug!(humans, "human count within threshold; rotation continues"),
        }
        occupancy
    }

    fn enter_standby(&mut self, humans: usize) {
        info!(
            humans,
            max_human_players = self.settings.max_human_players,
            "player limit reached; entering polling standby and disconnecting all sessions"
        );
        self.cancel(&TimerKind::Rotation);
        self.teardown_sessions();
        self.phase = Phase::PollingStandby;
        self.standby_since = Some(Utc::now());
        self.schedule(TimerKind::Poll, self.settings.polling_interval);
    }

    fn on_timer(&mut self, timer: TimerKind, token: TimerToken) {
        if self.timers.get(&timer) != Some(&token) {
            debug!(timer = ?timer, "stale timer fire ignored");
            return;
        }
        self.timers.remove(&timer);

        match timer {
            TimerKind::Rotation => self.on_rotation_timer(),
            TimerKind::Overlap(id) => self.on_overlap_elapsed(id),
            TimerKind::IdleTick(id) => self.on_idle_tick(id),
            TimerKind::RestTimeout(id) => self.on_rest_timeout(id),
            TimerKind::Poll => self.on_poll(),
            TimerKind::ProbeTimeout(id) => self.on_probe_timeout(id),
            TimerKind::Greeting { session, player } => self.on_greeting(session, player),
            TimerKind::Resume => {
                if matches!(self.recovery, Some(Recovery::ResumePending(_))) {
                    self.start_rotation();
                }
            }
        }
    }

    fn on_rotation_timer(&mut self) {
        if self.recovery.is_some() || self.phase == Phase::PollingStandby {
            return;
        }
        self.schedule(TimerKind::Rotation, self.settings.rotation_interval);

        if let Phase::HandoverPending { incoming } = self.phase {
            debug!(incoming, "handover still pending; skipping this rotation");
            return;
        }
        if self.pool.names().len() < 2 {
            debug!("single identity pool; nothing to rotate to");
            return;
        }

        let current = self.active_identity().to_string();
        let next = self.pool.name(self.pool.next_index(self.active_index)).to_string();
        info!(from = %current, to = %next, "initiating swap");
        let incoming = self.spawn(&next, Role::Candidate);
        self.phase = Phase::HandoverPending { incoming };
    }

    fn on_overlap_elapsed(&mut self, id: SessionId) {
        if self.phase != (Phase::HandoverPending { incoming: id }) {
            return;
        }
        let Some(incoming) = self.identity_for(id) else {
            return;
        };

        let outgoing = self.active_identity().to_string();
        if self.sessions.contains_key(&outgoing) {
            info!(
                outgoing = %outgoing,
                overlap_secs = self.settings.overlap.as_secs_f32(),
                "overlap complete; quitting outgoing session"
            );
            self.quit_session(&outgoing);
        } else {
            warn!(outgoing = %outgoing, "outgoing session not found; assuming disconnected");
        }

        if let Some(index) = self.pool.index_of(&incoming) {
            self.active_index = index;
        }
        if let Some(session) = self.sessions.get_mut(&incoming) {
            session.role = Role::Active;
        }
        self.schedule(TimerKind::IdleTick(id), self.settings.action_interval);
        self.phase = Phase::Rotating;
        self.handovers += 1;
        info!(active = %incoming, handovers = self.handovers, "handover complete");
    }

    fn on_idle_tick(&mut self, id: SessionId) {
        let Some(identity) = self.identity_for(id) else {
            return;
        };
        let Some(session) = self.sessions.get(&identity) else {
            return;
        };
        if !session.connected || session.role == Role::Probe {
            return;
        }
        let view = session.idle_view();
        self.schedule(TimerKind::IdleTick(id), self.settings.action_interval);

        let designated = self.holds_active_slot(&identity);
        match idle::decide(view, designated, &mut self.rng) {
            IdleDecision::Noop => {}
            IdleDecision::SeekRest => {
                if let Some(session) = self.sessions.get_mut(&identity) {
                    session.resting = true;
                }
                debug!(identity = %identity, "night time; looking for a bed");
                self.perform(
                    id,
                    SessionOp::SeekRest {
                        max_distance: REST_SEARCH_RADIUS,
                    },
                );
                self.schedule(
                    TimerKind::RestTimeout(id),
                    self.settings.action_interval * REST_ATTEMPT_TICKS,
                );
            }
            IdleDecision::Micro(action) => self.perform_micro(id, action),
        }
    }

    /// A rest attempt the bridge never resolved; stop pathing and move again.
    fn on_rest_timeout(&mut self, id: SessionId) {
        let Some(identity) = self.identity_for(id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&identity) else {
            return;
        };
        if !session.resting || session.sleeping {
            return;
        }
        session.resting = false;
        warn!(identity = %identity, "rest attempt timed out; falling back to idle action");
        let action = idle::random_action(&mut self.rng);
        self.perform_micro(id, action);
    }

    fn on_poll(&mut self) {
        if self.phase != Phase::PollingStandby {
            return;
        }
        let standby_minutes = self
            .standby_since
            .map(|since| (Utc::now() - since).num_minutes())
            .unwrap_or_default();
        let probe = self.pool.name(0).to_string();
        info!(identity = %probe, standby_minutes, "polling server with probe session");
        let id = self.spawn(&probe, Role::Probe);
        self.schedule(TimerKind::ProbeTimeout(id), self.settings.probe_timeout);
    }

    fn on_probe_timeout(&mut self, id: SessionId) {
        if let Some(identity) = self.identity_for(id) {
            info!(identity = %identity, "polling probe timed out; quitting it");
            self.quit_session(&identity);
        }
        if self.phase == Phase::PollingStandby {
            self.schedule(TimerKind::Poll, self.settings.polling_interval);
        }
    }

    fn on_greeting(&mut self, id: SessionId, player: String) {
        let Some(identity) = self.identity_for(id) else {
            return;
        };
        if !self.sessions.get(&identity).is_some_and(|session| session.connected) {
            return;
        }
        let message = random_greeting(&mut self.rng, &player, &identity);
        self.perform(id, SessionOp::Chat { message });
        info!(identity = %identity, player = %player, "greeting delivered");
    }

    fn holds_active_slot(&self, identity: &str) -> bool {
        self.phase != Phase::PollingStandby
            && identity == self.active_identity()
            && self
                .sessions
                .get(identity)
                .is_some_and(|session| session.role == Role::Active)
    }

    fn identity_for(&self, id: SessionId) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.id == id)
            .map(|session| session.identity.clone())
    }

    fn spawn(&mut self, identity: &str, role: Role) -> SessionId {
        if self.sessions.contains_key(identity) {
            warn!(identity = %identity, "replacing existing session for identity");
            self.quit_session(identity);
        }
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(
            identity.to_string(),
            Session {
                id,
                identity: identity.to_string(),
                role,
                connected: false,
                sleeping: false,
                resting: false,
                players: BTreeSet::new(),
                time_of_day: None,
            },
        );
        self.commands.push(Command::Connect {
            session: id,
            identity: identity.to_string(),
        });
        id
    }

    /// Drops a session and every timer armed for it.
    fn forget_session(&mut self, identity: &str) -> Option<Session> {
        let session = self.sessions.remove(identity)?;
        let stale: Vec<TimerKind> = self
            .timers
            .keys()
            .filter(|timer| timer.session() == Some(session.id))
            .cloned()
            .collect();
        for timer in stale {
            self.cancel(&timer);
        }
        Some(session)
    }

    fn quit_session(&mut self, identity: &str) {
        if let Some(session) = self.forget_session(identity) {
            self.commands.push(Command::Quit {
                session: session.id,
            });
        }
    }

    fn teardown_sessions(&mut self) {
        let identities: Vec<String> = self.sessions.keys().cloned().collect();
        for identity in identities {
            self.quit_session(&identity);
        }
    }

    fn perform(&mut self, session: SessionId, op: SessionOp) {
        self.commands.push(Command::Perform { session, op });
    }

    fn perform_micro(&mut self, session: SessionId, action: idle::IdleAction) {
        self.perform(session, SessionOp::ClearControls);
        self.perform(session, SessionOp::Idle(action));
    }

    /// Arms `timer`, replacing any earlier schedule of the same timer.
    fn schedule(&mut self, timer: TimerKind, after: Duration) {
        self.cancel(&timer);
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.timers.insert(timer.clone(), token);
        self.commands.push(Command::Schedule {
            timer,
            token,
            after,
        });
    }

    fn cancel(&mut self, timer: &TimerKind) {
        if let Some(token) = self.timers.remove(timer) {
            self.commands.push(Command::Cancel { token });
        }
    }
}
