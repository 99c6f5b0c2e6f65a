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

use std::{
    collections::{BTreeSet, HashSet},
    io,
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_HUMAN_PLAYERS: usize = 1;
pub const DEFAULT_WAKE_WAIT_SECONDS: u64 = 60;
pub const PANEL_DEFAULT_WAIT_SECONDS: u64 = 90;
pub const WAKE_SAFETY_MARGIN_SECONDS: u64 = 15;

/// Identities used when `BOT_NAMES` is not configured, in rotation order.
pub const DEFAULT_BOT_NAMES: [&str; 4] = ["Madara", "Obito", "Shisui", "Satro_gojo"];

pub const GREETINGS: [&str; 4] = [
    "Welcome to the server, {PLAYER}! I'm {BOT}, here to keep the server alive for you.",
    "Hey, {PLAYER}! Glad you could make it. I'm {BOT}, and my shift just started!",
    "A wild {PLAYER} has appeared! Welcome aboard. I'm {BOT}, the current Guardian.",
    "Howdy, {PLAYER}! {BOT} reporting for duty. Have fun!",
];

const UNREACHABLE_PATTERNS: [&str; 5] = [
    "no route to host",
    "timed out",
    "econnrefused",
    "connection refused",
    "host unreachable",
];

/// Fixed, ordered set of bot identities taking turns on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPool {
    names: Vec<String>,
}

impl IdentityPool {
    pub fn new<I, S>(names: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.into().trim().to_string())
            .collect();
        if names.is_empty() {
            anyhow::bail!("identity pool must contain at least one name");
        }
        let mut seen = HashSet::new();
        for name in &names {
            if name.is_empty() {
                anyhow::bail!("identity pool contains a blank name");
            }
            if !seen.insert(name.as_str()) {
                anyhow::bail!("identity pool contains duplicate name {name}");
            }
        }
        Ok(Self { names })
    }

    /// Name at `index`, wrapping around the pool.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index % self.names.len()]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|entry| entry == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Normal,
    OverThreshold,
}

/// Participants present on the server that are not part of the pool.
pub fn human_participants<'a>(
    participants: &'a BTreeSet<String>,
    pool: &IdentityPool,
) -> BTreeSet<&'a str> {
    participants
        .iter()
        .map(String::as_str)
        .filter(|name| !pool.contains(name))
        .collect()
}

pub fn classify_occupancy(
    participants: &BTreeSet<String>,
    pool: &IdentityPool,
    threshold: usize,
) -> (Occupancy, usize) {
    let humans = human_participants(participants, pool).len();
    let occupancy = if humans > threshold {
        Occupancy::OverThreshold
    } else {
        Occupancy::Normal
    };
    (occupancy, humans)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Refused, timed out or no route: the server is most likely asleep.
    Unreachable,
    Other,
}

pub fn classify_failure(message: &str) -> FailureKind {
    let normalized = message.to_ascii_lowercase();
    if UNREACHABLE_PATTERNS
        .iter()
        .any(|pattern| normalized.contains(pattern))
    {
        FailureKind::Unreachable
    } else {
        FailureKind::Other
    }
}

pub fn classify_io_failure(error: &io::Error) -> FailureKind {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::TimedOut
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => FailureKind::Unreachable,
        _ => classify_failure(&error.to_string()),
    }
}

pub fn render_greeting(template: &str, player: &str, bot: &str) -> String {
    template.replace("{PLAYER}", player).replace("{BOT}", bot)
}

pub fn random_greeting<R: Rng + ?Sized>(rng: &mut R, player: &str, bot: &str) -> String {
    let template = GREETINGS[rng.random_range(0..GREETINGS.len())];
    render_greeting(template, player, bot)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// The panel reported a queue time.
    Reported,
    /// The panel accepted the start but gave no queue time.
    PanelDefault,
    /// The wake flow failed or could not run.
    Fallback,
}

/// How long to wait before trying to reconnect after a wake attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WakeEstimate {
    pub wait: Duration,
    pub source: EstimateSource,
}

impl WakeEstimate {
    pub fn reported(wait_seconds: u64) -> Self {
        Self {
            wait: Duration::from_secs(wait_seconds + WAKE_SAFETY_MARGIN_SECONDS),
            source: EstimateSource::Reported,
        }
    }

    pub fn panel_default() -> Self {
        Self {
            wait: Duration::from_secs(PANEL_DEFAULT_WAIT_SECONDS + WAKE_SAFETY_MARGIN_SECONDS),
            source: EstimateSource::PanelDefault,
        }
    }

    pub fn fallback() -> Self {
        Self {
            wait: Duration::from_secs(DEFAULT_WAKE_WAIT_SECONDS),
            source: EstimateSource::Fallback,
        }
    }
}

/// Out-of-band request to start the dormant server. Implementations never
/// fail: errors are logged and turned into [`WakeEstimate::fallback`].
#[async_trait]
pub trait WakeTrigger: Send + Sync {
    async fn attempt_wake(&self) -> WakeEstimate;
}

static ENV_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

pub fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

pub fn env_string(var_name: &str) -> Option<String> {
    normalize_optional_string(std::env::var(var_name).ok())
}

/// Split a comma separated list, dropping blank entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn abcd() -> IdentityPool {
        IdentityPool::new(["A", "B", "C", "D"]).unwrap()
    }

    #[test]
    fn one_human_with_full_pool_is_normal() {
        let (occupancy, humans) =
            classify_occupancy(&names(&["A", "B", "C", "D", "Eve"]), &abcd(), 1);
        assert_eq!(occupancy, Occupancy::Normal);
        assert_eq!(humans, 1);
    }

    #[test]
    fn second_human_is_over_threshold() {
        let (occupancy, humans) =
            classify_occupancy(&names(&["A", "B", "C", "D", "Eve", "Bob"]), &abcd(), 1);
        assert_eq!(occupancy, Occupancy::OverThreshold);
        assert_eq!(humans, 2);
    }

    #[test]
    fn absent_identities_do_not_count_as_humans() {
        let (occupancy, humans) = classify_occupancy(&names(&["B"]), &abcd(), 0);
        assert_eq!(occupancy, Occupancy::Normal);
        assert_eq!(humans, 0);
    }

    #[test]
    fn pool_rejects_empty_blank_and_duplicate_names() {
        assert!(IdentityPool::new(Vec::<String>::new()).is_err());
        assert!(IdentityPool::new(["A", " "]).is_err());
        assert!(IdentityPool::new(["A", "B", "A"]).is_err());
    }

    #[test]
    fn next_index_cycles_back_to_start_for_every_pool_size() {
        for size in 1..=6 {
            let pool = IdentityPool::new((0..size).map(|i| format!("bot{i}"))).unwrap();
            let mut index = 0;
            let mut visited = Vec::new();
            for _ in 0..size {
                index = pool.next_index(index);
                visited.push(index);
            }
            assert_eq!(index, 0, "pool of {size} did not cycle back");
            let expected: Vec<usize> = (1..size).chain(std::iter::once(0)).collect();
            assert_eq!(visited, expected);
        }
    }

    #[test]
    fn default_pool_matches_configured_defaults() {
        let pool = IdentityPool::new(DEFAULT_BOT_NAMES).unwrap();
        assert_eq!(pool.names().len(), 4);
        assert_eq!(pool.name(0), "Madara");
        assert_eq!(pool.index_of("Satro_gojo"), Some(3));
        assert_eq!(pool.name(5), "Obito");
    }

    #[test]
    fn connectivity_messages_are_unreachable() {
        assert_eq!(
            classify_failure("connect ECONNREFUSED 1.2.3.4:25565"),
            FailureKind::Unreachable
        );
        assert_eq!(classify_failure("Client timed out after 30000 milliseconds"), FailureKind::Unreachable);
        assert_eq!(classify_failure("connect EHOSTUNREACH No route to host"), FailureKind::Unreachable);
        assert_eq!(classify_failure("socketClosed"), FailureKind::Other);
        assert_eq!(classify_failure("kicked: You logged in from another location"), FailureKind::Other);
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let broken = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(classify_io_failure(&refused), FailureKind::Unreachable);
        assert_eq!(classify_io_failure(&broken), FailureKind::Other);
    }

    #[test]
    fn greeting_substitutes_player_and_bot() {
        let message = render_greeting(GREETINGS[3], "Eve", "Obito");
        assert_eq!(message, "Howdy, Eve! Obito reporting for duty. Have fun!");

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let message = random_greeting(&mut rng, "Eve", "Obito");
            assert!(message.contains("Eve"));
            assert!(message.contains("Obito"));
            assert!(!message.contains('{'));
        }
    }

    #[test]
    fn wake_estimates_add_margin_only_to_panel_answers() {
        assert_eq!(WakeEstimate::reported(120).wait, Duration::from_secs(135));
        assert_eq!(WakeEstimate::panel_default().wait, Duration::from_secs(105));
        assert_eq!(WakeEstimate::fallback().wait, Duration::from_secs(60));
        assert_eq!(WakeEstimate::fallback().source, EstimateSource::Fallback);
    }

    #[test]
    fn split_list_drops_blank_entries() {
        assert_eq!(split_list(" A, B ,,C "), vec!["A", "B", "C"]);
    }

    #[test]
    fn expand_env_vars_replaces_unset_with_empty() {
        let expanded = expand_env_vars("user=${AFK_COMMON_TEST_SURELY_UNSET_VAR}!");
        assert_eq!(expanded, "user=!");
    }
}
