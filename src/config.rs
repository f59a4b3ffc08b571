//! Runtime configuration.
//!
//! Everything is optional in the file; missing fields take the defaults
//! below. Values are checked once by [`PetConfig::validate`] and trusted
//! afterwards.

use std::fs;
use std::path::Path;

use bevy::math::Vec2;
use serde::Deserialize;

use crate::action::ActionTimers;
use crate::classify::{ClassifierConfig, ReferenceSetting};
use crate::error::ConfigError;
use crate::physics::{PhysicsTuning, WorldBounds};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    pub width: f32,
    pub height: f32,
    pub spawn_x: f32,
    pub spawn_y: f32,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            width: 48.0,
            height: 80.0,
            spawn_x: 100.0,
            spawn_y: 100.0,
        }
    }
}

impl BodyConfig {
    pub fn size(&self) -> Vec2 {
        Vec2::new(self.width, self.height)
    }

    pub fn spawn(&self) -> Vec2 {
        Vec2::new(self.spawn_x, self.spawn_y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Reach of the beam in front of the character, px.
    pub length: f32,
    pub height: f32,
    /// How long an impact region stays on screen, s.
    pub impact_secs: f32,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            length: 240.0,
            height: 24.0,
            impact_secs: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Microphone RMS above which the beam fires.
    pub rms_threshold: f32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self { rms_threshold: 0.02 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PetConfig {
    pub world: WorldBounds,
    /// Physics ticks per second.
    pub tick_hz: f32,
    /// Collision map refreshes per second.
    pub collision_hz: f32,
    /// Ambient background resamples per second.
    pub ambient_color_hz: f32,
    pub trigger_poll_hz: f32,
    /// Margin around the AABB captured for the collision map, px.
    pub capture_padding: i32,
    /// Bottom rows ignored by the horizontal probe.
    pub step_height: u32,
    pub body: BodyConfig,
    pub physics: PhysicsTuning,
    pub timers: ActionTimers,
    pub beam: BeamConfig,
    pub classifier: ClassifierConfig,
    pub trigger: TriggerConfig,
    /// Draw the collision mask under the character.
    pub debug_mask: bool,
}

impl Default for PetConfig {
    fn default() -> Self {
        Self {
            world: WorldBounds::default(),
            tick_hz: 60.0,
            collision_hz: 20.0,
            ambient_color_hz: 1.0,
            trigger_poll_hz: 4.0,
            capture_padding: 64,
            step_height: 12,
            body: BodyConfig::default(),
            physics: PhysicsTuning::default(),
            timers: ActionTimers::default(),
            beam: BeamConfig::default(),
            classifier: ClassifierConfig::default(),
            trigger: TriggerConfig::default(),
            debug_mask: false,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be positive, got {value}")))
    }
}

fn non_negative(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must not be negative, got {value}")))
    }
}

impl PetConfig {
    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: PetConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("world.width", self.world.width)?;
        positive("world.height", self.world.height)?;
        positive("tick_hz", self.tick_hz)?;
        positive("collision_hz", self.collision_hz)?;
        positive("ambient_color_hz", self.ambient_color_hz)?;
        positive("trigger_poll_hz", self.trigger_poll_hz)?;
        if self.capture_padding < 0 {
            return Err(invalid("capture_padding", "must not be negative"));
        }

        positive("body.width", self.body.width)?;
        positive("body.height", self.body.height)?;
        if self.body.width > self.world.width || self.body.height > self.world.height {
            return Err(invalid("body", "larger than the world"));
        }
        if self.step_height as f32 >= self.body.height {
            return Err(invalid("step_height", "must be smaller than the body height"));
        }

        let p = &self.physics;
        positive("physics.gravity", p.gravity)?;
        positive("physics.max_fall_speed", p.max_fall_speed)?;
        positive("physics.move_speed", p.move_speed)?;
        positive("physics.jump_velocity", p.jump_velocity)?;
        positive("physics.fly_speed", p.fly_speed)?;

        positive("timers.punch", self.timers.punch)?;
        non_negative("timers.channel", self.timers.channel)?;
        positive("timers.footstep", self.timers.footstep)?;

        positive("beam.length", self.beam.length)?;
        positive("beam.height", self.beam.height)?;
        positive("beam.impact_secs", self.beam.impact_secs)?;

        let c = &self.classifier;
        non_negative("classifier.thresholds.hue", c.thresholds.hue)?;
        non_negative("classifier.thresholds.lightness", c.thresholds.lightness)?;
        non_negative("classifier.thresholds.saturation", c.thresholds.saturation)?;
        non_negative("classifier.thresholds.gray_saturation", c.thresholds.gray_saturation)?;
        non_negative("classifier.cluster_distance", c.cluster_distance)?;
        if c.sample_stride == 0 {
            return Err(invalid("classifier.sample_stride", "must be at least 1"));
        }

        non_negative("trigger.rms_threshold", self.trigger.rms_threshold)?;
        Ok(())
    }

    /// Seconds per physics tick.
    pub fn tick_secs(&self) -> f32 {
        1.0 / self.tick_hz
    }

    /// Physics ticks between collision map refreshes, at least one.
    pub fn refresh_every(&self) -> u32 {
        (self.tick_hz / self.collision_hz).round().max(1.0) as u32
    }

    pub fn is_adaptive(&self) -> bool {
        self.classifier.reference == ReferenceSetting::Adaptive
    }
}
