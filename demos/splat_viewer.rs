//! Orbit viewer for depth-sorted Gaussian splats
//!
//! Spawns two procedural clouds and renders them through the GPU sort pipeline.
//!
//! Usage:
//! ```bash
//! cargo run --example splat_viewer
//! ```

use bevy::prelude::*;
use rfs_gsplat_sort::{create_test_splats, GaussianSplatSortPlugin, SortDirection, SplatRenderConfig};

fn main() {
    App::new()
        .add_plugins((
            DefaultPlugins.set(WindowPlugin {
                primary_window: Some(Window {
                    title: "Gaussian Splat Viewer".to_string(),
                    resolution: (1280, 720).into(),
                    ..default()
                }),
                ..default()
            }),
            GaussianSplatSortPlugin,
        ))
        .add_systems(Startup, setup)
        .add_systems(Update, (rotate_camera, keyboard_input))
        .run();
}

fn setup(mut commands: Commands) {
    let near = create_test_splats(50_000);
    let mut far = create_test_splats(20_000);
    // clouds are rendered in world space, so offset the second one directly
    for mean in far.means.iter_mut() {
        *mean += Vec3::new(0.0, 0.0, -3.0);
    }

    let camera_distance = near.suggested_camera_distance().max(4.0);
    println!("🚀 Gaussian Splat Viewer");
    println!("  Cloud 1: {} splats", near.len());
    println!("  Cloud 2: {} splats", far.len());

    commands.spawn((
        Camera3d::default(),
        Transform::from_xyz(0.0, camera_distance * 0.3, camera_distance).looking_at(Vec3::ZERO, Vec3::Y),
        CameraController {
            distance: camera_distance,
            yaw: 0.0,
            pitch: 0.3,
            auto_rotate: true,
        },
    ));

    commands.spawn((Name::new("Near cloud"), near, Visibility::default()));
    commands.spawn((Name::new("Far cloud"), far, Visibility::default()));

    println!("\n=== Controls ===");
    println!("  Arrow Keys  - Rotate camera");
    println!("  Space       - Toggle auto-rotation");
    println!("  D           - Toggle sort direction");
    println!("  1-4         - SH degree 0-3");
    println!("  V           - Toggle splat rendering");
    println!("  ESC         - Exit");
}

#[derive(Component)]
struct CameraController {
    distance: f32,
    yaw: f32,
    pitch: f32,
    auto_rotate: bool,
}

fn rotate_camera(
    time: Res<Time>,
    keyboard: Res<ButtonInput<KeyCode>>,
    mut camera_q: Query<(&mut Transform, &mut CameraController)>,
) {
    let delta = time.delta_secs();
    let rotation_speed = 2.0;

    for (mut transform, mut controller) in &mut camera_q {
        if keyboard.just_pressed(KeyCode::Space) {
            controller.auto_rotate = !controller.auto_rotate;
        }
        if controller.auto_rotate {
            controller.yaw += 0.3 * delta;
        }
        if keyboard.pressed(KeyCode::ArrowLeft) {
            controller.yaw += rotation_speed * delta;
        }
        if keyboard.pressed(KeyCode::ArrowRight) {
            controller.yaw -= rotation_speed * delta;
        }
        if keyboard.pressed(KeyCode::ArrowUp) {
            controller.pitch = (controller.pitch + rotation_speed * delta).min(std::f32::consts::FRAC_PI_2 - 0.1);
        }
        if keyboard.pressed(KeyCode::ArrowDown) {
            controller.pitch = (controller.pitch - rotation_speed * delta).max(-std::f32::consts::FRAC_PI_2 + 0.1);
        }

        let horizontal_dist = controller.distance * controller.pitch.cos();
        transform.translation = Vec3::new(
            horizontal_dist * controller.yaw.sin(),
            controller.distance * controller.pitch.sin(),
            horizontal_dist * controller.yaw.cos(),
        );
        transform.look_at(Vec3::ZERO, Vec3::Y);
    }
}

fn keyboard_input(
    keyboard: Res<ButtonInput<KeyCode>>,
    mut config: ResMut<SplatRenderConfig>,
    mut exit: MessageWriter<bevy::app::AppExit>,
) {
    if keyboard.just_pressed(KeyCode::KeyD) {
        config.sort_direction = match config.sort_direction {
            SortDirection::BackToFront => SortDirection::FrontToBack,
            SortDirection::FrontToBack => SortDirection::BackToFront,
        };
        println!("Sort direction: {:?}", config.sort_direction);
    }
    if keyboard.just_pressed(KeyCode::KeyV) {
        config.enabled = !config.enabled;
        println!("Splat rendering: {}", if config.enabled { "ON" } else { "OFF" });
    }
    for (key, degree) in [
        (KeyCode::Digit1, 0),
        (KeyCode::Digit2, 1),
        (KeyCode::Digit3, 2),
        (KeyCode::Digit4, 3),
    ] {
        if keyboard.just_pressed(key) {
            config.sh_degree = degree;
            println!("SH degree: {}", degree);
        }
    }
    if keyboard.just_pressed(KeyCode::Escape) {
        println!("Exiting...");
        exit.write(bevy::app::AppExit::Success);
    }
}
