//! A desktop stickman that walks on whatever is drawn on screen.
//!
//! The library holds everything that can run without a window: capture
//! sampling, background classification, the collision map, the physics
//! resolver, the action state machine and the background workers. The
//! binary plugs these into a Bevy app.

pub mod action;
pub mod capture;
pub mod classify;
pub mod collision;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod pet;
pub mod physics;
pub mod workers;

pub use action::{ActionMachine, ActionState};
pub use capture::{CaptureProvider, NoCapture, PixelBuffer};
pub use collision::CollisionMap;
pub use config::PetConfig;
pub use interfaces::{AudioPlayer, DrawItem, DrawSource, InputProvider, IntentFlags, SoundKey, SpriteKey};
pub use pet::{Pet, TickOutput};
