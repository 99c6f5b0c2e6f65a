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

use std::{str::FromStr, time::Duration};

use afk_common::{
    DEFAULT_MAX_HUMAN_PLAYERS, IdentityPool, expand_env_vars, normalize_optional_string,
    split_list,
};
use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{session::BridgeSettings, supervisor::RotationSettings};

const DEFAULT_SERVER_PORT: u16 = 25565;
const DEFAULT_VERSION: &str = "1.20.4";
const DEFAULT_AUTH: &str = "offline";
const DEFAULT_BRIDGE_CMD: &str = "node session-bridge.js";
const DEFAULT_LIVENESS_BIND: &str = "0.0.0.0:3000";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Optional YAML overrides, consulted for anything the environment leaves unset.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    host: Option<String>,
    server_port: Option<u16>,
    version: Option<String>,
    auth: Option<String>,
    max_human_players: Option<usize>,
    bot_names: Option<Vec<String>>,
    rotation_interval_secs: Option<u64>,
    overlap_secs: Option<u64>,
    polling_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    action_interval_secs: Option<u64>,
    greeting_delay_secs: Option<u64>,
    crash_cooldown_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    session_bridge_cmd: Option<String>,
    liveness_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub pool: IdentityPool,
    pub rotation: RotationSettings,
    pub bridge: BridgeSettings,
    pub liveness_bind: String,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let file = load_config_file();
        resolve(file, |name| std::env::var(name).ok())
    }
}

fn load_config_file() -> ConfigFile {
    let Some(path) = normalize_optional_string(std::env::var("AFK_CONFIG_PATH").ok()) else {
        return ConfigFile::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read config path");
            return ConfigFile::default();
        }
    };

    match serde_yaml::from_str::<ConfigFile>(&expand_env_vars(&raw)) {
        Ok(parsed) => {
            info!(path = %path, "loaded config file");
            parsed
        }
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse config yaml");
            ConfigFile::default()
        }
    }
}

struct Lookup<F> {
    env: F,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        normalize_optional_string((self.env)(name))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.string(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring unparsable value");
                None
            }
        }
    }

    fn secs(&self, name: &str, file: Option<u64>, default: u64) -> Duration {
        Duration::from_secs(self.parse(name).or(file).unwrap_or(default))
    }
}

fn resolve<F>(file: ConfigFile, env: F) -> anyhow::Result<ServiceConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Lookup { env };
    let defaults = RotationSettings::default();

    let host = env
        .string("HOST")
        .or(normalize_optional_string(file.host))
        .context("HOST must be set to the game server address")?;

    let names = match env.string("BOT_NAMES") {
        Some(raw) => split_list(&raw),
        None => file.bot_names.unwrap_or_else(|| {
            afk_common::DEFAULT_BOT_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect()
        }),
    };
    let pool = IdentityPool::new(names).context("invalid BOT_NAMES")?;

    let rotation = RotationSettings {
        max_human_players: env
            .parse("MAX_HUMAN_PLAYERS")
            .or(file.max_human_players)
            .unwrap_or(DEFAULT_MAX_HUMAN_PLAYERS),
        rotation_interval: env.secs(
            "ROTATION_INTERVAL_SECS",
            file.rotation_interval_secs,
            defaults.rotation_interval.as_secs(),
        ),
        overlap: env.secs("OVERLAP_SECS", file.overlap_secs, defaults.overlap.as_secs()),
        polling_interval: env.secs(
            "POLLING_INTERVAL_SECS",
            file.polling_interval_secs,
            defaults.polling_interval.as_secs(),
        ),
        probe_timeout: env.secs(
            "PROBE_TIMEOUT_SECS",
            file.probe_timeout_secs,
            defaults.probe_timeout.as_secs(),
        ),
        action_interval: env.secs(
            "ACTION_INTERVAL_SECS",
            file.action_interval_secs,
            defaults.action_interval.as_secs(),
        ),
        greeting_delay: env.secs(
            "GREETING_DELAY_SECS",
            file.greeting_delay_secs,
            defaults.greeting_delay.as_secs(),
        ),
        crash_cooldown: env.secs(
            "CRASH_COOLDOWN_SECS",
            file.crash_cooldown_secs,
            defaults.crash_cooldown.as_secs(),
        ),
    };
    if rotation.overlap >= rotation.rotation_interval {
        anyhow::bail!("OVERLAP_SECS must be shorter than ROTATION_INTERVAL_SECS");
    }

    let bridge = BridgeSettings {
        command: env
            .string("SESSION_BRIDGE_CMD")
            .or(normalize_optional_string(file.session_bridge_cmd))
            .unwrap_or_else(|| DEFAULT_BRIDGE_CMD.to_string()),
        host,
        port: env
            .parse("SERVER_PORT")
            .or(file.server_port)
            .unwrap_or(DEFAULT_SERVER_PORT),
        version: env
            .string("VERSION")
            .or(normalize_optional_string(file.version))
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        auth: env
            .string("AUTH")
            .or(normalize_optional_string(file.auth))
            .unwrap_or_else(|| DEFAULT_AUTH.to_string()),
        connect_timeout: env.secs(
            "CONNECT_TIMEOUT_SECS",
            file.connect_timeout_secs,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        ),
    };

    let liveness_bind = match env.parse::<u16>("PORT") {
        Some(port) => format!("0.0.0.0:{port}"),
        None => env
            .string("LIVENESS_BIND")
            .or(normalize_optional_string(file.liveness_bind))
            .unwrap_or_else(|| DEFAULT_LIVENESS_BIND.to_string()),
    };

    Ok(ServiceConfig {
        pool,
        rotation,
        bridge,
        liveness_bind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_host_is_set() {
        let config = resolve(ConfigFile::default(), env(&[("HOST", "play.example.net")])).unwrap();

        assert_eq!(config.bridge.host, "play.example.net");
        assert_eq!(config.bridge.port, 25565);
        assert_eq!(config.bridge.version, "1.20.4");
        assert_eq!(config.bridge.auth, "offline");
        assert_eq!(config.bridge.command, "node session-bridge.js");
        assert_eq!(config.bridge.connect_timeout, Duration::from_secs(60));
        assert_eq!(
            config.pool.names(),
            &["Madara", "Obito", "Shisui", "Satro_gojo"]
        );
        assert_eq!(config.rotation.max_human_players, 1);
        assert_eq!(config.rotation.rotation_interval, Duration::from_secs(480));
        assert_eq!(config.rotation.overlap, Duration::from_secs(10));
        assert_eq!(config.rotation.polling_interval, Duration::from_secs(300));
        assert_eq!(config.liveness_bind, "0.0.0.0:3000");
    }

    #[test]
    fn missing_host_is_an_error() {
        let error = resolve(ConfigFile::default(), env(&[])).unwrap_err();
        assert!(error.to_string().contains("HOST"));
    }

    #[test]
    fn environment_overrides_file_and_file_overrides_defaults() {
        let file: ConfigFile = serde_yaml::from_str(
            "host: from-file\nserver_port: 25570\nmax_human_players: 3\nbot_names: [A, B]\n",
        )
        .unwrap();
        let config = resolve(
            file,
            env(&[("SERVER_PORT", "25580"), ("ROTATION_INTERVAL_SECS", "60")]),
        )
        .unwrap();

        assert_eq!(config.bridge.host, "from-file");
        assert_eq!(config.bridge.port, 25580);
        assert_eq!(config.rotation.max_human_players, 3);
        assert_eq!(config.rotation.rotation_interval, Duration::from_secs(60));
        assert_eq!(config.pool.names(), &["A", "B"]);
    }

    #[test]
    fn bot_names_are_split_and_validated() {
        let config = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("BOT_NAMES", " Itachi , Kisame ")]),
        )
        .unwrap();
        assert_eq!(config.pool.names(), &["Itachi", "Kisame"]);

        let duplicate = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("BOT_NAMES", "Itachi,Itachi")]),
        );
        assert!(duplicate.is_err());
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("MAX_HUMAN_PLAYERS", "lots")]),
        )
        .unwrap();
        assert_eq!(config.rotation.max_human_players, 1);
    }

    #[test]
    fn port_wins_over_liveness_bind() {
        let config = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("PORT", "10000"), ("LIVENESS_BIND", "127.0.0.1:9")]),
        )
        .unwrap();
        assert_eq!(config.liveness_bind, "0.0.0.0:10000");

        let config = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("LIVENESS_BIND", "127.0.0.1:9")]),
        )
        .unwrap();
        assert_eq!(config.liveness_bind, "127.0.0.1:9");
    }

    #[test]
    fn overlap_must_fit_inside_rotation_interval() {
        let result = resolve(
            ConfigFile::default(),
            env(&[("HOST", "h"), ("ROTATION_INTERVAL_SECS", "10")]),
        );
        assert!(result.is_err());
    }
}
