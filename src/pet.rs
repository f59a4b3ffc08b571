//! One physics tick of the stickman, start to finish.
//!
//! [`Pet::tick`] is the only place the components meet:
//!
//! 1. every `refresh_every` ticks, sample the desktop around the body and
//!    rebuild the collision map (failures keep or relax the old map);
//! 2. read intents and consume worker flags;
//! 3. start flight, beam and punch actions;
//! 4. step the physics resolver;
//! 5. advance action timers, apply the deferred beam impact;
//! 6. pick the active state and build the draw list.

use std::sync::Arc;

use bevy::log::{info, warn};
use bevy::math::{IRect, IVec2, Vec2};

use crate::action::{ActionMachine, ActionState};
use crate::capture::{CaptureProvider, FrameSampler, PixelBuffer};
use crate::classify::{classify, mask_to_rgba, permissive_for, BackgroundModel};
use crate::collision::CollisionMap;
use crate::config::PetConfig;
use crate::interfaces::{
    AudioPlayer, ChannelHandle, Direction, DrawItem, DrawSource, InputProvider, SoundKey,
    SpriteKey,
};
use crate::physics::{Body, Resolver, StepInput, StepReport};
use crate::workers::{Snapshot, Triggers};

/// Area hit by a finished beam, drawn until `remaining` runs out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impact {
    pub region: IRect,
    pub remaining: f32,
}

/// What the renderer and the rest of the app need after a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    pub position: Vec2,
    pub action: ActionState,
    pub sprite: SpriteKey,
    pub facing_right: bool,
    pub grounded: bool,
    /// Back to front.
    pub draw: Vec<DrawItem>,
}

pub struct Pet {
    config: PetConfig,
    body: Body,
    resolver: Resolver,
    machine: ActionMachine,
    sampler: FrameSampler,
    model: Snapshot<BackgroundModel>,
    triggers: Triggers,
    map: CollisionMap,
    mask: Option<Arc<PixelBuffer>>,
    refresh_every: u64,
    ticks: u64,
    capture_failing: bool,
    grounded: bool,
    footstep_left: f32,
    fly_loop: Option<ChannelHandle>,
    impacts: Vec<Impact>,
}

impl Pet {
    /// Build a pet from a validated config and the capture backend used for
    /// the collision map.
    pub fn new(config: PetConfig, capture: Box<dyn CaptureProvider>) -> Self {
        let body = Body::new(config.body.spawn(), config.body.size());
        let resolver = Resolver::new(config.physics, config.world, config.step_height);
        let sampler = FrameSampler::new(capture, config.capture_padding, config.world.rect());
        let model = Snapshot::new(BackgroundModel::from_config(&config.classifier));

        Self {
            body,
            resolver,
            machine: ActionMachine::new(config.timers),
            sampler,
            model,
            triggers: Triggers::default(),
            map: CollisionMap::empty(),
            mask: None,
            refresh_every: u64::from(config.refresh_every()),
            ticks: 0,
            capture_failing: false,
            grounded: false,
            footstep_left: 0.0,
            fly_loop: None,
            impacts: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &PetConfig {
        &self.config
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn action(&self) -> ActionState {
        self.machine.active()
    }

    pub fn machine(&self) -> &ActionMachine {
        &self.machine
    }

    pub fn collision_map(&self) -> &CollisionMap {
        &self.map
    }

    pub fn impacts(&self) -> &[Impact] {
        &self.impacts
    }

    /// Handle the ambient colour worker publishes into.
    pub fn background(&self) -> Snapshot<BackgroundModel> {
        self.model.clone()
    }

    /// Flags the trigger workers raise.
    pub fn triggers(&self) -> Triggers {
        self.triggers.clone()
    }

    /// Advance the pet by one fixed step.
    pub fn tick(&mut self, input: &mut dyn InputProvider, audio: &mut dyn AudioPlayer) -> TickOutput {
        let dt = self.config.tick_secs();

        if self.ticks % self.refresh_every == 0 {
            self.refresh_collision();
        }

        let intents = input.intents();
        // take both so neither request lingers into the next tick
        let toggle = self.triggers.flight.take() | intents.toggle_fly;
        let beam = self.triggers.beam.take() | intents.channel_beam;

        if toggle {
            let flying = self.machine.toggle_flight();
            info!("flight {}", if flying { "on" } else { "off" });
            if !flying {
                self.fly_loop = None;
            }
        }
        if self.machine.is_flying() {
            self.keep_fly_loop(audio);
        }

        if beam && !self.machine.is_channeling() {
            let sound = audio.play(SoundKey::BeamFire, true);
            self.machine.start_channel(sound);
        }

        if let Some(dir) = intents.punch {
            if self.machine.start_punch() {
                self.body.facing_right = dir == Direction::Right;
                audio.play(SoundKey::Punch, false);
            }
        }

        let flying = self.machine.is_flying();
        let step = StepInput {
            left: intents.move_left,
            right: intents.move_right,
            jump: intents.ascend && !flying,
            ascend: intents.ascend,
            descend: intents.descend,
            flying,
        };
        let report = self.resolver.step(&mut self.body, &step, &self.map, dt);
        self.grounded = report.grounded;
        if report.jumped {
            audio.play(SoundKey::Jump, false);
        }

        self.machine.set_moving(intents.move_left || intents.move_right);
        let jumping = self.jump_latch(flying, intents.ascend, &report);
        self.machine.set_jumping(jumping);

        self.expire_impacts(dt);
        if self.machine.advance(dt, audio).channel_finished {
            self.land_beam(audio);
        }

        let action = self.machine.resolve();
        self.footsteps(action, dt, audio);

        self.ticks += 1;
        TickOutput {
            position: self.body.pos,
            action,
            sprite: action.sprite(),
            facing_right: self.body.facing_right,
            grounded: self.grounded,
            draw: self.draw_list(action),
        }
    }

    fn refresh_collision(&mut self) {
        let aabb = self.body.aabb();
        let buffer = match self.sampler.sample(aabb) {
            Ok(buffer) => {
                if self.capture_failing {
                    info!("screen capture recovered");
                    self.capture_failing = false;
                }
                buffer
            }
            Err(e) => {
                if !self.capture_failing {
                    warn!("{e}; keeping the previous collision map");
                    self.capture_failing = true;
                }
                return;
            }
        };

        let model = self.model.load();
        self.map = classify(&buffer, &model, Some(aabb)).unwrap_or_else(|e| {
            warn!("{e}; treating the region as open space");
            permissive_for(&buffer)
        });

        if self.config.debug_mask {
            self.mask = Some(Arc::new(mask_to_rgba(&self.map)));
        }
    }

    /// Jumping holds from a grounded jump until the body lands, and while
    /// ascending in flight.
    fn jump_latch(&self, flying: bool, ascend: bool, report: &StepReport) -> bool {
        if flying {
            ascend
        } else if report.jumped {
            true
        } else if report.grounded {
            false
        } else {
            self.machine.conditions().jumping
        }
    }

    fn keep_fly_loop(&mut self, audio: &mut dyn AudioPlayer) {
        let busy = match self.fly_loop {
            Some(handle) => audio.is_busy(handle).unwrap_or(false),
            None => false,
        };
        if !busy {
            self.fly_loop = audio.play(SoundKey::FlyLoop, true);
        }
    }

    fn footsteps(&mut self, action: ActionState, dt: f32, audio: &mut dyn AudioPlayer) {
        if action != ActionState::Moving || !self.grounded || self.body.vel.x == 0.0 {
            self.footstep_left = 0.0;
            return;
        }
        self.footstep_left -= dt;
        if self.footstep_left <= 0.0 {
            audio.play(SoundKey::Footstep, false);
            self.footstep_left = self.machine.timers().footstep;
        }
    }

    /// Rectangle the beam covers in front of the body, clamped to the world.
    pub fn beam_region(&self) -> IRect {
        let beam = &self.config.beam;
        let top = self.body.pos.y + (self.body.size.y - beam.height) / 2.0;
        let left = if self.body.facing_right {
            self.body.pos.x + self.body.size.x
        } else {
            self.body.pos.x - beam.length
        };
        let min = IVec2::new(left.round() as i32, top.round() as i32);
        let max = min + IVec2::new(beam.length.round() as i32, beam.height.round() as i32);
        IRect::from_corners(min, max).intersect(self.config.world.rect())
    }

    fn land_beam(&mut self, audio: &mut dyn AudioPlayer) {
        let region = self.beam_region();
        if region.is_empty() {
            return;
        }
        self.impacts.push(Impact {
            region,
            remaining: self.config.beam.impact_secs,
        });
        audio.play(SoundKey::Impact, false);
    }

    fn expire_impacts(&mut self, dt: f32) {
        for impact in &mut self.impacts {
            impact.remaining -= dt;
        }
        self.impacts.retain(|i| i.remaining > 0.0);
    }

    fn draw_list(&self, action: ActionState) -> Vec<DrawItem> {
        let mut draw = Vec::with_capacity(3 + self.impacts.len());

        if let Some(mask) = &self.mask {
            draw.push(DrawItem {
                x: mask.origin.x,
                y: mask.origin.y,
                width: mask.width,
                height: mask.height,
                source: DrawSource::Pixels(Arc::clone(mask)),
                flip_x: false,
            });
        }

        for impact in &self.impacts {
            draw.push(sprite_at(SpriteKey::Impact, impact.region, false));
        }

        let body = self.body.aabb();
        draw.push(sprite_at(action.sprite(), body, !self.body.facing_right));

        if action == ActionState::Channeling {
            let region = self.beam_region();
            if !region.is_empty() {
                draw.push(sprite_at(SpriteKey::Beam, region, !self.body.facing_right));
            }
        }
        draw
    }
}

fn sprite_at(key: SpriteKey, rect: IRect, flip_x: bool) -> DrawItem {
    DrawItem {
        source: DrawSource::Sprite(key),
        x: rect.min.x,
        y: rect.min.y,
        width: rect.width() as u32,
        height: rect.height() as u32,
        flip_x,
    }
}
