use std::sync::Arc;
use std::time::Duration;

use bevy::asset::LoadState;
use bevy::audio::{AudioSink, AudioSinkPlayback, PlaybackSettings};
use bevy::prelude::*;
use bevy::render::render_asset::RenderAssetUsages;
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};
use bevy::sprite::Anchor;
use bevy::utils::HashMap;

use desktop_stickman::capture::{self, NoCapture, PixelBuffer};
use desktop_stickman::classify::BackgroundModel;
use desktop_stickman::error::{AudioError, WorkerError};
use desktop_stickman::interfaces::{
    AudioPlayer, ChannelHandle, Direction, DrawItem, DrawSource, InputProvider, IntentFlags,
    SoundKey, SpriteKey,
};
use desktop_stickman::workers::{poll_trigger, sample_ambient_color, Worker};
use desktop_stickman::{Pet, PetConfig};

use crate::mic::Microphone;

/// How long shutdown waits for each worker thread.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(750);

/// Finished channels kept around for late polls before being pruned.
const MAX_TRACKED_CHANNELS: usize = 64;

pub struct StickmanPlugin {
    pub config: PetConfig,
}

impl Plugin for StickmanPlugin {
    fn build(&self, app: &mut App) {
        let capture = capture::desktop().unwrap_or_else(|e| {
            warn!("{e}; running without obstacles");
            Box::new(NoCapture)
        });
        let pet = Pet::new(self.config.clone(), capture);
        let workers = start_workers(&self.config, &pet);

        app.insert_non_send_resource(PetRunner(pet))
            .insert_resource(Time::<Fixed>::from_hz(self.config.tick_hz as f64))
            .insert_resource(workers)
            .insert_resource(WorldSize(Vec2::new(
                self.config.world.width,
                self.config.world.height,
            )))
            .init_resource::<LatchedInput>()
            .init_resource::<BevyAudio>()
            .init_resource::<DrawFrame>()
            .init_resource::<MaskImage>()
            .add_systems(Startup, (setup_camera, load_assets))
            .add_systems(FixedUpdate, (poll_audio, tick_pet, spawn_audio).chain())
            .add_systems(Update, (latch_input, quit_on_z, sync_drawn))
            .add_systems(Last, stop_workers_on_exit);
    }
}

/// The pet is not `Send` (its capture backend may not be), so it lives in
/// the main-thread world.
struct PetRunner(Pet);

#[derive(Resource)]
struct WorldSize(Vec2);

#[derive(Resource, Default)]
struct Workers(Vec<Worker>);

impl Workers {
    fn shutdown_all(&mut self) {
        for worker in &mut self.0 {
            if worker.shutdown(WORKER_JOIN_TIMEOUT) {
                info!("worker {} joined", worker.name());
            }
        }
    }
}

fn start_workers(config: &PetConfig, pet: &Pet) -> Workers {
    let mut workers = Workers::default();

    if config.is_adaptive() {
        let base = BackgroundModel::from_config(&config.classifier);
        let out = pet.background();
        let world = config.world.rect();
        let period = Duration::from_secs_f32(1.0 / config.ambient_color_hz);
        let spawned = Worker::spawn("ambient-color", period, move || {
            let mut provider = capture::desktop()?;
            let (base, out) = (base.clone(), out.clone());
            Ok(move || sample_ambient_color(&mut provider, world, &base, &out))
        });
        match spawned {
            Ok(worker) => workers.0.push(worker),
            Err(e) => error!("cannot start ambient colour worker: {e}"),
        }
    }

    let beam = pet.triggers().beam;
    let threshold = config.trigger.rms_threshold;
    let period = Duration::from_secs_f32(1.0 / config.trigger_poll_hz);
    let spawned = Worker::spawn("loudness-trigger", period, move || {
        let mut mic = Microphone::open(threshold).map_err(WorkerError::from)?;
        let beam = beam.clone();
        Ok(move || poll_trigger(&mut mic, &beam))
    });
    match spawned {
        Ok(worker) => workers.0.push(worker),
        Err(e) => error!("cannot start trigger worker: {e}"),
    }

    workers
}

fn stop_workers_on_exit(mut exits: EventReader<AppExit>, mut workers: ResMut<Workers>) {
    if exits.read().next().is_some() {
        workers.shutdown_all();
    }
}

fn quit_on_z(keys: Res<ButtonInput<KeyCode>>, mut exit: EventWriter<AppExit>) {
    if keys.just_pressed(KeyCode::KeyZ) {
        info!("Z pressed, shutting down");
        exit.send(AppExit::Success);
    }
}

// ----------------- Input -----------------

/// Held keys are sampled every frame; presses are latched until the next
/// fixed tick consumes them.
#[derive(Resource, Default)]
struct LatchedInput {
    held: IntentFlags,
    punch: Option<Direction>,
    toggle_fly: bool,
    channel_beam: bool,
}

impl InputProvider for LatchedInput {
    fn intents(&mut self) -> IntentFlags {
        IntentFlags {
            punch: self.punch.take(),
            toggle_fly: std::mem::take(&mut self.toggle_fly),
            channel_beam: std::mem::take(&mut self.channel_beam),
            ..self.held
        }
    }
}

fn latch_input(keys: Res<ButtonInput<KeyCode>>, mut input: ResMut<LatchedInput>) {
    let any = |codes: &[KeyCode]| keys.any_pressed(codes.iter().copied());
    input.held = IntentFlags {
        move_left: any(&[KeyCode::ArrowLeft, KeyCode::KeyA]),
        move_right: any(&[KeyCode::ArrowRight, KeyCode::KeyD]),
        ascend: any(&[KeyCode::ArrowUp, KeyCode::KeyW, KeyCode::Space]),
        descend: any(&[KeyCode::ArrowDown, KeyCode::KeyS]),
        ..default()
    };

    if keys.just_pressed(KeyCode::KeyQ) {
        input.punch = Some(Direction::Left);
    }
    if keys.just_pressed(KeyCode::KeyE) {
        input.punch = Some(Direction::Right);
    }
    input.toggle_fly |= keys.just_pressed(KeyCode::KeyF);
    input.channel_beam |= keys.just_pressed(KeyCode::KeyB);
}

// ----------------- Audio -----------------

#[derive(Debug, Clone, PartialEq)]
enum ChannelStatus {
    Queued,
    Playing,
    Done,
    Failed(String),
}

/// Bridges the polled [`AudioPlayer`] interface onto Bevy audio entities.
///
/// `play` only queues; `spawn_audio` creates the entities after the tick
/// and `poll_audio` refreshes channel states before the next one.
#[derive(Resource, Default)]
struct BevyAudio {
    next_id: u64,
    pending: Vec<(SoundKey, Option<ChannelHandle>)>,
    channels: HashMap<ChannelHandle, ChannelStatus>,
}

impl AudioPlayer for BevyAudio {
    fn play(&mut self, key: SoundKey, wait: bool) -> Option<ChannelHandle> {
        let handle = wait.then(|| {
            self.next_id += 1;
            let handle = ChannelHandle(self.next_id);
            self.channels.insert(handle, ChannelStatus::Queued);
            handle
        });
        self.pending.push((key, handle));
        handle
    }

    fn is_busy(&self, channel: ChannelHandle) -> Result<bool, AudioError> {
        match self.channels.get(&channel) {
            Some(ChannelStatus::Queued | ChannelStatus::Playing) => Ok(true),
            Some(ChannelStatus::Done) => Ok(false),
            Some(ChannelStatus::Failed(reason)) => Err(AudioError::Query(reason.clone())),
            None => Err(AudioError::Query(format!("unknown channel {}", channel.0))),
        }
    }
}

#[derive(Component)]
struct SoundChannel(ChannelHandle);

#[derive(Resource, Default)]
struct SoundAssets(HashMap<SoundKey, Handle<AudioSource>>);

fn spawn_audio(
    mut commands: Commands,
    mut audio: ResMut<BevyAudio>,
    sounds: Res<SoundAssets>,
    asset_server: Res<AssetServer>,
) {
    let audio = &mut *audio;
    for (key, channel) in audio.pending.drain(..) {
        let Some(source) = sounds.0.get(&key).cloned() else {
            continue;
        };
        if let Some(LoadState::Failed(e)) = asset_server.get_load_state(&source) {
            if let Some(channel) = channel {
                audio
                    .channels
                    .insert(channel, ChannelStatus::Failed(format!("{key:?}: {e}")));
            }
            continue;
        }

        let mut entity = commands.spawn(AudioBundle {
            source,
            settings: PlaybackSettings::DESPAWN,
        });
        if let Some(channel) = channel {
            entity.insert(SoundChannel(channel));
            audio.channels.insert(channel, ChannelStatus::Playing);
        }
    }
}

fn poll_audio(
    mut audio: ResMut<BevyAudio>,
    playing: Query<(&SoundChannel, &Handle<AudioSource>, Option<&AudioSink>)>,
    asset_server: Res<AssetServer>,
) {
    let mut live: HashMap<ChannelHandle, ChannelStatus> = HashMap::default();
    for (channel, source, sink) in &playing {
        let status = match sink {
            Some(sink) if sink.empty() => ChannelStatus::Done,
            Some(_) => ChannelStatus::Playing,
            None => match asset_server.get_load_state(source) {
                Some(LoadState::Failed(e)) => ChannelStatus::Failed(e.to_string()),
                _ => ChannelStatus::Playing,
            },
        };
        live.insert(channel.0, status);
    }

    for (handle, status) in audio.channels.iter_mut() {
        if *status != ChannelStatus::Playing {
            continue;
        }
        // despawned entities finished playing
        *status = live.remove(handle).unwrap_or(ChannelStatus::Done);
    }

    if audio.channels.len() > MAX_TRACKED_CHANNELS {
        audio
            .channels
            .retain(|_, status| matches!(status, ChannelStatus::Queued | ChannelStatus::Playing));
    }
}

// ----------------- Tick -----------------

#[derive(Resource, Default)]
struct DrawFrame(Vec<DrawItem>);

fn tick_pet(
    mut pet: NonSendMut<PetRunner>,
    mut input: ResMut<LatchedInput>,
    mut audio: ResMut<BevyAudio>,
    mut frame: ResMut<DrawFrame>,
) {
    let out = pet.0.tick(&mut *input, &mut *audio);
    frame.0 = out.draw;
}

// ----------------- Rendering -----------------

#[derive(Resource, Default)]
struct SpriteAssets(HashMap<SpriteKey, Handle<Image>>);

/// Texture for the debug mask, rebuilt only when a new mask arrives.
#[derive(Resource, Default)]
struct MaskImage {
    source: Option<Arc<PixelBuffer>>,
    handle: Handle<Image>,
}

impl MaskImage {
    fn texture_for(&mut self, buffer: &Arc<PixelBuffer>, images: &mut Assets<Image>) -> Handle<Image> {
        let fresh = self
            .source
            .as_ref()
            .map_or(true, |current| !Arc::ptr_eq(current, buffer));
        if fresh {
            images.remove(&self.handle);
            self.handle = images.add(rgba_image(buffer));
            self.source = Some(Arc::clone(buffer));
        }
        self.handle.clone()
    }
}

fn rgba_image(buffer: &PixelBuffer) -> Image {
    Image::new(
        Extent3d {
            width: buffer.width,
            height: buffer.height,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        buffer.data.clone(),
        TextureFormat::Rgba8UnormSrgb,
        RenderAssetUsages::default(),
    )
}

#[derive(Component)]
struct Drawn;

fn setup_camera(mut commands: Commands) {
    commands.spawn(Camera2dBundle::default());
}

fn load_assets(mut commands: Commands, asset_server: Res<AssetServer>) {
    let sprites = SpriteKey::ALL
        .iter()
        .map(|key| (*key, asset_server.load(key.asset_path())))
        .collect();
    let sounds = SoundKey::ALL
        .iter()
        .map(|key| (*key, asset_server.load(key.asset_path())))
        .collect();
    commands.insert_resource(SpriteAssets(sprites));
    commands.insert_resource(SoundAssets(sounds));
}

/// Mirror the latest draw list as sprites. World coordinates have y down
/// from the top-left of the desktop; the camera is centred on it.
fn sync_drawn(
    mut commands: Commands,
    frame: Res<DrawFrame>,
    world: Res<WorldSize>,
    sprites: Option<Res<SpriteAssets>>,
    mut mask: ResMut<MaskImage>,
    mut images: ResMut<Assets<Image>>,
    drawn: Query<Entity, With<Drawn>>,
) {
    if !frame.is_changed() {
        return;
    }
    let Some(sprites) = sprites else {
        return;
    };
    for entity in &drawn {
        commands.entity(entity).despawn();
    }

    let half = world.0 / 2.0;
    for (layer, item) in frame.0.iter().enumerate() {
        let (texture, color) = match &item.source {
            DrawSource::Sprite(key) => (sprites.0.get(key).cloned().unwrap_or_default(), Color::WHITE),
            DrawSource::Pixels(buffer) => (
                mask.texture_for(buffer, &mut images),
                Color::srgba(1.0, 1.0, 1.0, 0.5),
            ),
        };
        commands.spawn((
            SpriteBundle {
                texture,
                sprite: Sprite {
                    color,
                    flip_x: item.flip_x,
                    anchor: Anchor::TopLeft,
                    custom_size: Some(Vec2::new(item.width as f32, item.height as f32)),
                    ..default()
                },
                transform: Transform::from_xyz(
                    item.x as f32 - half.x,
                    half.y - item.y as f32,
                    layer as f32,
                ),
                ..default()
            },
            Drawn,
        ));
    }
}
