// GPU Radix Sort Validation
// Runs the histogram/spine/scatter kernels on random keys and compares against a stable CPU sort
//
// Usage:
//   cargo run --example sort_validation

use bevy::{
    prelude::*,
    render::{
        render_resource::*,
        renderer::{RenderDevice, RenderQueue},
        Render, RenderApp, RenderSystems,
    },
};
use rand::Rng;
use rfs_gsplat_sort::{
    dispatch::{workgroups_for, DispatchIndirectArgs, DispatchSizer},
    radix_sort::*,
    GaussianSplatSortPlugin,
};

const TEST_CAPACITY: usize = 1_000_000;
// (label, entries actually sorted, random key bits)
const TEST_CASES: [(&str, usize, u32); 3] = [
    ("full capacity", TEST_CAPACITY, 32),
    ("partial last partition, many ties", 3 * KEYS_PER_SORT_WORKGROUP as usize + 17, 10),
    ("single entry", 1, 32),
];

fn main() {
    let mut app = App::new();
    app.add_plugins((
        DefaultPlugins.set(bevy::window::WindowPlugin {
            primary_window: Some(Window {
                title: "GPU Radix Sort Validation (Running...)".to_string(),
                resolution: (400, 100).into(),
                visible: false,
                ..default()
            }),
            ..default()
        }),
        GaussianSplatSortPlugin,
    ));

    println!("🧪 GPU Radix Sort Validation\n");
    println!("Capacity: {} entries", TEST_CAPACITY);

    let render_app = app.sub_app_mut(RenderApp);
    render_app.add_systems(Render, run_validation.in_set(RenderSystems::Render));

    app.run();
}

#[derive(Resource)]
struct ValidationExecuted;

fn run_validation(world: &mut World) {
    if world.contains_resource::<ValidationExecuted>() {
        return;
    }
    {
        let pipeline_cache = world.resource::<PipelineCache>();
        let pipelines = world.resource::<RadixSortPipelines>();
        if pipelines.ready(pipeline_cache).is_none() {
            // still compiling, try next frame
            return;
        }
    }
    world.insert_resource(ValidationExecuted);

    let render_device = world.resource::<RenderDevice>().clone();
    let render_queue = world.resource::<RenderQueue>().clone();
    let pipelines = world.resource::<RadixSortPipelines>().clone();
    let pipeline_cache = world.resource::<PipelineCache>();
    let Some(ready) = pipelines.ready(pipeline_cache) else {
        return;
    };

    let capacity = match SortCapacity::for_primitives(TEST_CAPACITY, &render_device.limits()) {
        Ok(capacity) => capacity,
        Err(err) => {
            println!("✗ Device cannot hold the test buffers: {err}");
            std::process::exit(1);
        }
    };
    println!("Max partitions: {}", capacity.max_partitions);

    let buffers = create_radix_sort_buffers(&render_device, capacity);
    let sizer = DispatchSizer::new(&render_device, capacity.max_entries);
    let bind_groups = create_radix_sort_bind_groups(
        &render_device,
        &pipelines.sort_bind_group_layout,
        &buffers,
        &sizer.sort_info,
    );

    let mut rng = rand::thread_rng();
    let mut passed = true;
    for (label, count, key_bits) in TEST_CASES {
        let keys: Vec<u32> = (0..count).map(|_| rng.gen::<u32>() >> (32 - key_bits)).collect();
        let values: Vec<u32> = (0..count as u32).collect();

        println!("\n=== {} ({} entries) ===", label, count);
        render_queue.write_buffer(buffers.keys.input(), 0, bytemuck::cast_slice(&keys));
        render_queue.write_buffer(buffers.values.input(), 0, bytemuck::cast_slice(&values));
        render_queue.write_buffer(
            &sizer.sort_info,
            0,
            bytemuck::bytes_of(&sort_info_for(count as u32, &capacity)),
        );
        render_queue.write_buffer(
            &sizer.sort_dispatch,
            0,
            bytemuck::bytes_of(&DispatchIndirectArgs {
                x: workgroups_for(count as u32, KEYS_PER_SORT_WORKGROUP),
                ..Default::default()
            }),
        );

        let mut encoder = render_device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("radix_sort_validation"),
        });
        for pass in 0..SORT_PASSES {
            record_sort_pass(&mut encoder, &ready, &bind_groups, &sizer.sort_dispatch, pass);
        }

        let bytes = (count * 4) as u64;
        let keys_readback = readback_buffer(&render_device, "readback_keys", bytes);
        let values_readback = readback_buffer(&render_device, "readback_values", bytes);
        encoder.copy_buffer_to_buffer(buffers.keys.output(), 0, &keys_readback, 0, bytes);
        encoder.copy_buffer_to_buffer(buffers.values.output(), 0, &values_readback, 0, bytes);
        render_queue.submit(std::iter::once(encoder.finish()));

        let mut expected: Vec<(u32, u32)> = keys.iter().copied().zip(values.iter().copied()).collect();
        expected.sort_by_key(|&(key, _)| key);

        let (Some(gpu_keys), Some(gpu_values)) = (
            read_back(&render_device, &keys_readback),
            read_back(&render_device, &values_readback),
        ) else {
            println!("✗ Buffer mapping failed");
            std::process::exit(1);
        };

        let first_error = expected
            .iter()
            .zip(gpu_keys.iter().zip(gpu_values.iter()))
            .position(|(&(key, value), (&gpu_key, &gpu_value))| key != gpu_key || value != gpu_value);

        match first_error {
            None => println!("✓ {} entries sorted, values stable", count),
            Some(idx) => {
                passed = false;
                println!("✗ First mismatch at index {}", idx);
                println!("  Expected (CPU): {:?}", expected[idx]);
                println!("  Got (GPU): ({}, {})", gpu_keys[idx], gpu_values[idx]);
                let start = idx.saturating_sub(5);
                let end = (idx + 5).min(count);
                println!("  CPU: {:?}", &expected[start..end]);
                println!("  GPU keys: {:?}", &gpu_keys[start..end]);
            }
        }
    }

    if passed {
        println!("\n🎉 GPU Radix Sort PASSED");
        std::process::exit(0);
    } else {
        println!("\n✗ GPU Radix Sort FAILED");
        std::process::exit(1);
    }
}

fn readback_buffer(render_device: &RenderDevice, label: &str, size: u64) -> Buffer {
    render_device.create_buffer(&BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

fn read_back(render_device: &RenderDevice, buffer: &Buffer) -> Option<Vec<u32>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();
    slice.map_async(MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    let _ = render_device.wgpu_device().poll(wgpu::PollType::Wait);
    pollster::block_on(receiver).ok()?.ok()?;

    let data = slice.get_mapped_range();
    let values = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    buffer.unmap();
    Some(values)
}
