//! Seams to the outside world: input, audio and drawing.
//!
//! The core only ever talks to these traits and value types; the Bevy
//! adapters live in the binary.

use std::sync::Arc;

use crate::capture::PixelBuffer;
use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

/// Latest intent flags, read once per tick.
///
/// `punch`, `toggle_fly` and `channel_beam` are edge requests: a provider
/// reports each press once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentFlags {
    pub move_left: bool,
    pub move_right: bool,
    pub ascend: bool,
    pub descend: bool,
    pub punch: Option<Direction>,
    pub toggle_fly: bool,
    pub channel_beam: bool,
}

pub trait InputProvider {
    fn intents(&mut self) -> IntentFlags;
}

impl InputProvider for IntentFlags {
    fn intents(&mut self) -> IntentFlags {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundKey {
    Jump,
    Punch,
    BeamFire,
    Impact,
    Footstep,
    FlyLoop,
}

impl SoundKey {
    pub const ALL: [SoundKey; 6] = [
        SoundKey::Jump,
        SoundKey::Punch,
        SoundKey::BeamFire,
        SoundKey::Impact,
        SoundKey::Footstep,
        SoundKey::FlyLoop,
    ];

    pub fn asset_path(self) -> &'static str {
        match self {
            SoundKey::Jump => "sounds/jump.wav",
            SoundKey::Punch => "sounds/punch.wav",
            SoundKey::BeamFire => "sounds/beam.wav",
            SoundKey::Impact => "sounds/impact.wav",
            SoundKey::Footstep => "sounds/footstep.wav",
            SoundKey::FlyLoop => "sounds/fly_loop.wav",
        }
    }
}

/// Handle to a playback whose busy state can be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Fire-and-forget sound playback. Completion is polled, never signalled.
pub trait AudioPlayer {
    /// Start `key`. With `wait` the caller intends to poll completion and
    /// gets a channel handle back; otherwise the player may return `None`.
    fn play(&mut self, key: SoundKey, wait: bool) -> Option<ChannelHandle>;

    fn is_busy(&self, channel: ChannelHandle) -> Result<bool, AudioError>;
}

/// Player that plays nothing; every channel is idle.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl AudioPlayer for Silent {
    fn play(&mut self, _key: SoundKey, _wait: bool) -> Option<ChannelHandle> {
        None
    }

    fn is_busy(&self, _channel: ChannelHandle) -> Result<bool, AudioError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpriteKey {
    Idle,
    Walk,
    Jump,
    Fly,
    Punch,
    Channel,
    Beam,
    Impact,
}

impl SpriteKey {
    pub const ALL: [SpriteKey; 8] = [
        SpriteKey::Idle,
        SpriteKey::Walk,
        SpriteKey::Jump,
        SpriteKey::Fly,
        SpriteKey::Punch,
        SpriteKey::Channel,
        SpriteKey::Beam,
        SpriteKey::Impact,
    ];

    pub fn asset_path(self) -> &'static str {
        match self {
            SpriteKey::Idle => "sprites/stickman_idle.png",
            SpriteKey::Walk => "sprites/stickman_walk.png",
            SpriteKey::Jump => "sprites/stickman_jump.png",
            SpriteKey::Fly => "sprites/stickman_fly.png",
            SpriteKey::Punch => "sprites/stickman_punch.png",
            SpriteKey::Channel => "sprites/stickman_channel.png",
            SpriteKey::Beam => "sprites/beam.png",
            SpriteKey::Impact => "sprites/impact.png",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawSource {
    Sprite(SpriteKey),
    Pixels(Arc<PixelBuffer>),
}

/// One entry of the per-tick draw list; `x`, `y` is the top-left in world pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawItem {
    pub source: DrawSource,
    pub x: i32,
    pub y: i32,
    /// Drawn size; sprites are stretched to it.
    pub width: u32,
    pub height: u32,
    pub flip_x: bool,
}
