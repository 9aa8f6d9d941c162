// Frame sequencing tests
// RESET -> PREPROCESS -> SORT -> PROPAGATE_COUNT -> DRAW on host images of the counter buffers

mod common;

use bevy::math::{UVec2, Vec3, Vec4};
use common::{reference_sort, DeviceModel};
use rfs_gsplat_sort::{
    dispatch::{workgroups_for, DispatchIndirectArgs, DrawIndirectArgs},
    frame::{frame_schedule, FrameStage},
    preprocess::generate_sort_entries,
    radix_sort::{KEYS_PER_SORT_WORKGROUP, SORT_PASSES},
    CameraUniform, GaussianSplats, GpuGaussian, SortDirection, SplatRenderConfig,
};

fn camera() -> CameraUniform {
    CameraUniform::looking_at(
        Vec3::ZERO,
        Vec3::new(0.0, 0.0, -1.0),
        std::f32::consts::FRAC_PI_3,
        UVec2::new(800, 600),
    )
}

fn opaque_gaussian(position: Vec3) -> GpuGaussian {
    GpuGaussian {
        position_opacity: position.extend(0.9),
        rotation: Vec4::W,
        scale: Vec4::new(0.01, 0.01, 0.01, 0.0),
    }
}

/// Run one frame of the schedule on `model` and return the sorted indices the draw reads.
fn run_frame(model: &mut DeviceModel, config: &SplatRenderConfig, gaussians: &[GpuGaussian]) -> Vec<u32> {
    let settings = config.settings_uniform(gaussians.len() as u32);
    let camera = camera();
    for stage in frame_schedule(SORT_PASSES) {
        match stage {
            FrameStage::Reset => model.reset(),
            FrameStage::Preprocess => {
                model.append(&generate_sort_entries(&camera, &settings, gaussians))
            }
            FrameStage::Sort { pass } => model.sort_pass(pass),
            FrameStage::PropagateCount => model.propagate_count(),
            FrameStage::Draw => {}
        }
    }
    let instances = model.draw.instance_count as usize;
    model.values.output()[..instances].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_order() {
        let schedule = frame_schedule(SORT_PASSES);
        assert_eq!(schedule.len(), 3 + SORT_PASSES as usize + 1);
        assert_eq!(schedule[0], FrameStage::Reset);
        assert_eq!(schedule[1], FrameStage::Preprocess);
        for pass in 0..SORT_PASSES {
            assert_eq!(schedule[2 + pass as usize], FrameStage::Sort { pass });
        }
        assert_eq!(schedule[schedule.len() - 2], FrameStage::PropagateCount);
        assert_eq!(schedule[schedule.len() - 1], FrameStage::Draw);

        println!("✓ Frame schedule is reset, preprocess, sort passes, propagate, draw");
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut model = DeviceModel::new(16);
        model.sort_info.keys_size = 11;
        model.dispatch.x = 5;
        model.draw.instance_count = 11;

        model.reset();
        let once = (model.sort_info, model.dispatch);
        model.reset();
        assert_eq!((model.sort_info, model.dispatch), once);

        assert_eq!(model.sort_info.keys_size, 0);
        assert_eq!(model.sort_info.capacity, 16);
        assert_eq!(model.dispatch, DispatchIndirectArgs::default());
        // the draw count is only rewritten by the propagate copy
        assert_eq!(model.draw.instance_count, 11);

        println!("✓ Reset zeroes only the append counters");
    }

    #[test]
    fn test_propagate_copies_entry_count() {
        let mut model = DeviceModel::new(16);
        model.reset();
        model.sort_info.keys_size = 9;
        model.propagate_count();

        assert_eq!(
            model.draw,
            DrawIndirectArgs {
                instance_count: 9,
                ..Default::default()
            }
        );

        println!("✓ Propagate writes keys_size into instance_count");
    }

    #[test]
    fn test_depth_ordered_draw() {
        let gaussians: Vec<GpuGaussian> = [3.0f32, 1.0, 4.0, 1.5, 2.0]
            .iter()
            .map(|&depth| opaque_gaussian(Vec3::new(0.0, 0.0, -depth)))
            .collect();
        let mut model = DeviceModel::new(gaussians.len());

        let back_to_front = run_frame(&mut model, &SplatRenderConfig::default(), &gaussians);
        assert_eq!(back_to_front, vec![2, 0, 4, 3, 1]);

        let config = SplatRenderConfig {
            sort_direction: SortDirection::FrontToBack,
            ..Default::default()
        };
        let front_to_back = run_frame(&mut model, &config, &gaussians);
        assert_eq!(front_to_back, vec![1, 3, 4, 0, 2]);

        println!("✓ Draw order follows view depth");
    }

    #[test]
    fn test_everything_behind_camera_draws_nothing() {
        let gaussians: Vec<GpuGaussian> = (1..=10)
            .map(|i| opaque_gaussian(Vec3::new(0.0, 0.0, i as f32)))
            .collect();
        let mut model = DeviceModel::new(gaussians.len());

        let drawn = run_frame(&mut model, &SplatRenderConfig::default(), &gaussians);
        assert!(drawn.is_empty());
        assert_eq!(model.sort_info.keys_size, 0);
        assert_eq!(model.dispatch.x, 0);
        assert_eq!(model.draw.instance_count, 0);

        println!("✓ Fully culled frame draws zero instances");
    }

    #[test]
    fn test_counts_do_not_leak_between_frames() {
        let visible: Vec<GpuGaussian> = (0..50)
            .map(|i| opaque_gaussian(Vec3::new(0.0, 0.0, -1.0 - i as f32 * 0.1)))
            .collect();
        let mut model = DeviceModel::new(visible.len());
        assert_eq!(run_frame(&mut model, &SplatRenderConfig::default(), &visible).len(), 50);

        // second frame with most of the cloud behind the camera
        let mut moved = visible.clone();
        for gaussian in moved.iter_mut().skip(5) {
            gaussian.position_opacity.z = 5.0;
        }
        let drawn = run_frame(&mut model, &SplatRenderConfig::default(), &moved);
        assert_eq!(drawn.len(), 5);
        assert_eq!(model.dispatch.x, 1);

        println!("✓ Each frame starts from zeroed counters");
    }

    #[test]
    fn test_culling_rules() {
        let config = SplatRenderConfig::default();
        let mut transparent = opaque_gaussian(Vec3::new(0.0, 0.0, -2.0));
        transparent.position_opacity.w = 0.0;
        let gaussians = vec![
            opaque_gaussian(Vec3::new(0.0, 0.0, -2.0)),
            // closer than the near plane
            opaque_gaussian(Vec3::new(0.0, 0.0, -0.1)),
            // far outside the dilated frustum
            opaque_gaussian(Vec3::new(50.0, 0.0, -2.0)),
            transparent,
        ];

        let settings = config.settings_uniform(gaussians.len() as u32);
        let entries = generate_sort_entries(&camera(), &settings, &gaussians);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 0);

        println!("✓ Near plane, frustum and opacity culling");
    }

    #[test]
    fn test_test_cloud_matches_stable_reference() {
        let splats: GaussianSplats = rfs_gsplat_sort::create_test_splats(2000);
        let gaussians: Vec<GpuGaussian> = (0..splats.len())
            .map(|i| {
                let mut gaussian = splats.gpu_gaussian(i);
                // push the cloud in front of the camera
                gaussian.position_opacity.z -= 3.0;
                gaussian
            })
            .collect();
        let config = SplatRenderConfig::default();
        let settings = config.settings_uniform(gaussians.len() as u32);
        let entries = generate_sort_entries(&camera(), &settings, &gaussians);
        assert!(!entries.is_empty());

        let mut model = DeviceModel::new(gaussians.len());
        let drawn = run_frame(&mut model, &config, &gaussians);
        let (_, expected) = reference_sort(&entries);

        assert_eq!(drawn, expected);
        assert_eq!(
            model.dispatch.x,
            workgroups_for(entries.len() as u32, KEYS_PER_SORT_WORKGROUP)
        );

        println!("✓ Test cloud sorts like the host reference ({} visible)", entries.len());
    }
}
