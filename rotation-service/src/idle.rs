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

use std::f32::consts::{FRAC_PI_4, TAU};

use rand::Rng;

/// Game ticks during which beds can be used.
pub const NOCTURNAL_START: i64 = 13_000;
pub const NOCTURNAL_END: i64 = 23_450;
pub const REST_SEARCH_RADIUS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleAction {
    Advance,
    Crouch,
    Look { yaw: f32, pitch: f32 },
    Jump,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleDecision {
    Noop,
    SeekRest,
    Micro(IdleAction),
}

/// What the policy needs to know about one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleView {
    pub sleeping: bool,
    pub resting: bool,
    pub time_of_day: Option<i64>,
}

pub fn is_nocturnal(time_of_day: Option<i64>) -> bool {
    time_of_day.is_some_and(|time| (NOCTURNAL_START..=NOCTURNAL_END).contains(&time))
}

/// Picks the behaviour for one idle tick. Only the session holding the active
/// slot (`designated`) ever looks for a bed.
pub fn decide<R: Rng + ?Sized>(view: IdleView, designated: bool, rng: &mut R) -> IdleDecision {
    if view.sleeping || view.resting {
        return IdleDecision::Noop;
    }
    if designated && is_nocturnal(view.time_of_day) {
        return IdleDecision::SeekRest;
    }
    IdleDecision::Micro(random_action(rng))
}

pub fn random_action<R: Rng + ?Sized>(rng: &mut R) -> IdleAction {
    match rng.random_range(0..4) {
        0 => IdleAction::Advance,
        1 => IdleAction::Crouch,
        2 => IdleAction::Look {
            yaw: rng.random_range(0.0..TAU),
            pitch: rng.random_range(-FRAC_PI_4..=FRAC_PI_4),
        },
        _ => IdleAction::Jump,
    }
}
