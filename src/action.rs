//! Priority-ordered action states.
//!
//! Every condition keeps its own latch; only the highest-priority latched
//! state is active for a given tick. When a transient state such as
//! `Punching` ends, whatever lies under it (usually `Moving`) shows again
//! without the player re-issuing input.

use bevy::log::{debug, warn};
use serde::Deserialize;

use crate::interfaces::{AudioPlayer, ChannelHandle, SpriteKey};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ActionState {
    Idle,
    Moving,
    Jumping,
    Flying,
    Punching,
    Channeling,
}

/// Highest priority first.
pub const PRIORITY: [ActionState; 6] = [
    ActionState::Channeling,
    ActionState::Flying,
    ActionState::Punching,
    ActionState::Jumping,
    ActionState::Moving,
    ActionState::Idle,
];

impl ActionState {
    /// 1 is highest.
    pub fn priority(self) -> usize {
        PRIORITY
            .iter()
            .position(|s| *s == self)
            .map_or(PRIORITY.len(), |i| i + 1)
    }

    pub fn sprite(self) -> SpriteKey {
        match self {
            ActionState::Idle => SpriteKey::Idle,
            ActionState::Moving => SpriteKey::Walk,
            ActionState::Jumping => SpriteKey::Jump,
            ActionState::Flying => SpriteKey::Fly,
            ActionState::Punching => SpriteKey::Punch,
            ActionState::Channeling => SpriteKey::Channel,
        }
    }
}

/// Which states are currently satisfied. Idle always is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    pub channeling: bool,
    pub flying: bool,
    pub punching: bool,
    pub jumping: bool,
    pub moving: bool,
}

impl Conditions {
    pub fn holds(&self, state: ActionState) -> bool {
        match state {
            ActionState::Channeling => self.channeling,
            ActionState::Flying => self.flying,
            ActionState::Punching => self.punching,
            ActionState::Jumping => self.jumping,
            ActionState::Moving => self.moving,
            ActionState::Idle => true,
        }
    }
}

/// Pick the single active state: the first satisfied entry of [`PRIORITY`].
pub fn select(conditions: &Conditions) -> ActionState {
    PRIORITY
        .into_iter()
        .find(|s| conditions.holds(*s))
        .unwrap_or(ActionState::Idle)
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ActionTimers {
    /// Seconds a punch stays active.
    pub punch: f32,
    /// Minimum seconds a beam channel lasts.
    pub channel: f32,
    /// Seconds between footstep sounds while walking.
    pub footstep: f32,
}

impl Default for ActionTimers {
    fn default() -> Self {
        Self {
            punch: 0.25,
            channel: 1.5,
            footstep: 0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Channel {
    remaining: f32,
    sound: Option<ChannelHandle>,
}

/// Outcome of advancing the machine's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerEvents {
    pub punch_finished: bool,
    /// The channel ended this tick; its deferred effect is due.
    pub channel_finished: bool,
}

#[derive(Debug, Clone)]
pub struct ActionMachine {
    timers: ActionTimers,
    flying: bool,
    punch_left: f32,
    channel: Option<Channel>,
    jumping: bool,
    moving: bool,
    active: ActionState,
}

impl ActionMachine {
    pub fn new(timers: ActionTimers) -> Self {
        Self {
            timers,
            flying: false,
            punch_left: 0.0,
            channel: None,
            jumping: false,
            moving: false,
            active: ActionState::Idle,
        }
    }

    pub fn timers(&self) -> &ActionTimers {
        &self.timers
    }

    pub fn active(&self) -> ActionState {
        self.active
    }

    pub fn is_flying(&self) -> bool {
        self.flying
    }

    pub fn is_channeling(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_punching(&self) -> bool {
        self.punch_left > 0.0
    }

    pub fn conditions(&self) -> Conditions {
        Conditions {
            channeling: self.is_channeling(),
            flying: self.flying,
            punching: self.is_punching(),
            jumping: self.jumping,
            moving: self.moving,
        }
    }

    /// Flip flight on or off; returns the new flight state.
    pub fn toggle_flight(&mut self) -> bool {
        self.flying = !self.flying;
        if !self.flying {
            self.jumping = false;
        }
        self.flying
    }

    /// Start a punch unless one is running.
    pub fn start_punch(&mut self) -> bool {
        if self.is_punching() {
            return false;
        }
        self.punch_left = self.timers.punch;
        true
    }

    /// Start channeling with the beam's sound channel, unless already channeling.
    pub fn start_channel(&mut self, sound: Option<ChannelHandle>) -> bool {
        if self.channel.is_some() {
            return false;
        }
        self.channel = Some(Channel {
            remaining: self.timers.channel,
            sound,
        });
        true
    }

    pub fn set_moving(&mut self, moving: bool) {
        self.moving = moving;
    }

    pub fn set_jumping(&mut self, jumping: bool) {
        self.jumping = jumping;
    }

    /// Count down timers. A channel whose timer ran out stays active while
    /// its sound is still playing; a failed audio query counts as finished.
    pub fn advance(&mut self, dt: f32, audio: &dyn AudioPlayer) -> TimerEvents {
        let mut events = TimerEvents::default();

        if self.punch_left > 0.0 {
            self.punch_left -= dt;
            if self.punch_left <= 0.0 {
                self.punch_left = 0.0;
                events.punch_finished = true;
            }
        }

        if let Some(channel) = self.channel.as_mut() {
            channel.remaining -= dt;
            if channel.remaining <= 0.0 {
                let busy = match channel.sound {
                    Some(handle) => audio.is_busy(handle).unwrap_or_else(|e| {
                        warn!("beam sound state unknown, finishing channel: {e}");
                        false
                    }),
                    None => false,
                };
                if !busy {
                    self.channel = None;
                    events.channel_finished = true;
                }
            }
        }

        events
    }

    /// Re-select the active state from the current latches.
    pub fn resolve(&mut self) -> ActionState {
        let next = select(&self.conditions());
        if next != self.active {
            debug!("action {:?} -> {:?}", self.active, next);
            self.active = next;
        }
        next
    }
}
