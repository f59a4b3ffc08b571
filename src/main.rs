use std::process::ExitCode;

use bevy::asset::AssetPlugin;
use bevy::prelude::*;
use bevy::window::{Cursor, WindowLevel, WindowMode, WindowPosition, WindowResolution};

use desktop_stickman::PetConfig;

mod app;
mod mic;

use app::StickmanPlugin;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let Some(path) = args.get(i + 1) else {
                eprintln!("--config needs a path");
                return ExitCode::FAILURE;
            };
            match PetConfig::load(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("{path}: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        None => PetConfig::default(),
    };

    let mut app = App::new();
    app.add_plugins(
        DefaultPlugins
            .set(AssetPlugin {
                file_path: "assets".into(),
                ..default()
            })
            .set(WindowPlugin {
                primary_window: Some(Window {
                    title: "desktop-stickman".into(),
                    name: Some("desktop-stickman".into()),
                    // one logical pixel per desktop pixel
                    resolution: WindowResolution::new(config.world.width, config.world.height)
                        .with_scale_factor_override(1.0),
                    resizable: false,
                    decorations: false,
                    transparent: true,
                    window_level: WindowLevel::AlwaysOnTop,
                    position: WindowPosition::At(IVec2::ZERO),
                    mode: WindowMode::Windowed,
                    // clicks go to the desktop underneath
                    cursor: Cursor {
                        hit_test: false,
                        ..default()
                    },
                    ..default()
                }),
                ..default()
            }),
    )
    .insert_resource(ClearColor(Color::srgba(0.0, 0.0, 0.0, 0.0)));

    info!(
        "world {}x{}, {} Hz physics, collision map every {} ticks, ambient colour at {} Hz",
        config.world.width,
        config.world.height,
        config.tick_hz,
        config.refresh_every(),
        config.ambient_color_hz,
    );
    if !config.is_adaptive() {
        info!("fixed background colour, ambient sampling disabled");
    }

    app.add_plugins(StickmanPlugin { config });
    app.run();
    ExitCode::SUCCESS
}
