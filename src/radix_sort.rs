// GPU radix sort of (depth key, primitive index) pairs
// LSD, 8 bits per pass, 4 passes over 32-bit keys. Each pass:
//   histogram - per-partition digit counts
//   spine     - prefix sums over partitions and digits (one workgroup)
//   scatter   - stable reorder into the other ping-pong slot
// Histogram and scatter are dispatched indirectly; the partition count is produced on the
// device by the preprocess kernel.

use bevy::{
    asset::load_embedded_asset,
    prelude::*,
    render::{
        render_resource::{binding_types::*, *},
        renderer::RenderDevice,
    },
};
use std::borrow::Cow;

use crate::{
    dispatch::SortInfo,
    error::ConfigurationError,
    gaussian_splats::{GpuGaussian, GpuSplat2d, SH_WORDS_PER_SPLAT},
};

pub const KEY_BITS: u32 = 32;
pub const RADIX_BITS: u32 = 8;
pub const RADIX: usize = 1 << RADIX_BITS;
pub const SORT_PASSES: u32 = KEY_BITS / RADIX_BITS;

/// Threads per sort workgroup. Must match `radix_sort.wgsl`.
pub const SORT_WORKGROUP_SIZE: u32 = 256;
/// Rows of keys each sort workgroup walks. Must match `radix_sort.wgsl`.
pub const SORT_BLOCK_ROWS: u32 = 15;
/// Keys covered by one sort workgroup (one partition).
pub const KEYS_PER_SORT_WORKGROUP: u32 = SORT_WORKGROUP_SIZE * SORT_BLOCK_ROWS;

/// One of the two halves of a ping-pong pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PingPongSlot {
    A,
    B,
}

impl PingPongSlot {
    pub fn other(self) -> Self {
        match self {
            PingPongSlot::A => PingPongSlot::B,
            PingPongSlot::B => PingPongSlot::A,
        }
    }

    /// Slot pass `pass` reads from. Even passes read A.
    pub fn source_for_pass(pass: u32) -> Self {
        if pass % 2 == 0 {
            PingPongSlot::A
        } else {
            PingPongSlot::B
        }
    }

    /// Slot holding the sorted data after `passes` passes.
    pub fn after_passes(passes: u32) -> Self {
        Self::source_for_pass(passes)
    }
}

/// Two buffers of identical shape, addressed by slot.
#[derive(Clone, Debug)]
pub struct PingPong<T> {
    pub a: T,
    pub b: T,
}

impl<T> PingPong<T> {
    pub fn get(&self, slot: PingPongSlot) -> &T {
        match slot {
            PingPongSlot::A => &self.a,
            PingPongSlot::B => &self.b,
        }
    }

    /// (source, destination) for one sort pass
    pub fn for_pass(&self, pass: u32) -> (&T, &T) {
        let source = PingPongSlot::source_for_pass(pass);
        (self.get(source), self.get(source.other()))
    }

    /// Buffer the preprocess kernel appends into.
    pub fn input(&self) -> &T {
        self.get(PingPongSlot::A)
    }

    /// Buffer holding the result of a full sort.
    pub fn output(&self) -> &T {
        self.get(PingPongSlot::after_passes(SORT_PASSES))
    }
}

/// Validated sizing for one point cloud's sort and preprocess buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SortCapacity {
    /// Entries the key and index arrays hold
    pub max_entries: u32,
    /// Upper bound on sort workgroups per pass
    pub max_partitions: u32,
}

impl SortCapacity {
    /// Check a primitive count against the device limits.
    pub fn for_primitives(count: usize, limits: &wgpu::Limits) -> Result<Self, ConfigurationError> {
        if count == 0 {
            return Err(ConfigurationError::EmptyPointCloud);
        }

        let workgroup_limit = limits.max_compute_workgroups_per_dimension as usize;
        // Both the preprocess dispatch and the sort partitions are one-dimensional.
        let limit = (workgroup_limit * crate::preprocess::PREPROCESS_WORKGROUP_SIZE as usize)
            .min(workgroup_limit * KEYS_PER_SORT_WORKGROUP as usize)
            .min(u32::MAX as usize);
        if count > limit {
            return Err(ConfigurationError::TooManyPrimitives { count, limit });
        }

        let capacity = Self {
            max_entries: count as u32,
            max_partitions: (count as u32).div_ceil(KEYS_PER_SORT_WORKGROUP),
        };

        let binding_limit = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        let count = count as u64;
        let buffers = [
            ("splat_gaussians", count * std::mem::size_of::<GpuGaussian>() as u64),
            ("splat_attributes", count * std::mem::size_of::<GpuSplat2d>() as u64),
            ("splat_sh", count * (SH_WORDS_PER_SPLAT * 4) as u64),
            ("radix_sort_keys", count * 4),
            ("radix_sort_partition_histogram", capacity.partition_histogram_size()),
        ];
        for (buffer, required) in buffers {
            if required > binding_limit {
                return Err(ConfigurationError::BufferTooLarge {
                    buffer,
                    required,
                    limit: binding_limit,
                });
            }
        }

        Ok(capacity)
    }

    pub fn partition_histogram_size(&self) -> u64 {
        u64::from(self.max_partitions) * RADIX as u64 * 4
    }

    /// Clamp a requested entry count to the allocation.
    pub fn clamp_entries(&self, requested: usize) -> u32 {
        debug_assert!(
            requested <= self.max_entries as usize,
            "{requested} sort entries exceed the allocated {}",
            self.max_entries
        );
        requested.min(self.max_entries as usize) as u32
    }
}

pub const HISTOGRAM_ENTRY_POINT: &str = "histogram";
pub const SPINE_ENTRY_POINT: &str = "spine";
pub const SCATTER_ENTRY_POINT: &str = "scatter";

/// Layout shared by all three sort kernels: params, sort_info, keys_in, values_in, keys_out,
/// values_out, partition_histogram, digit_offsets.
pub fn radix_sort_bind_group_layout(render_device: &RenderDevice) -> BindGroupLayout {
    render_device.create_bind_group_layout(
        Some("radix_sort_layout"),
        &BindGroupLayoutEntries::sequential(
            ShaderStages::COMPUTE,
            (
                uniform_buffer::<SortPassParams>(false),
                storage_buffer_read_only_sized(false, None),
                storage_buffer_read_only_sized(false, None),
                storage_buffer_read_only_sized(false, None),
                storage_buffer_sized(false, None),
                storage_buffer_sized(false, None),
                storage_buffer_sized(false, None),
                storage_buffer_sized(false, None),
            ),
        ),
    )
}

#[derive(Resource, Clone)]
pub struct RadixSortPipelines {
    pub histogram_pipeline: CachedComputePipelineId,
    pub spine_pipeline: CachedComputePipelineId,
    pub scatter_pipeline: CachedComputePipelineId,

    pub sort_bind_group_layout: BindGroupLayout,

    pub shader: Handle<Shader>,
}

impl FromWorld for RadixSortPipelines {
    fn from_world(world: &mut World) -> Self {
        let asset_server = world.resource::<AssetServer>();
        let render_device = world.resource::<RenderDevice>();
        let pipeline_cache = world.resource::<PipelineCache>();

        let shader = load_embedded_asset!(asset_server, "../assets/shaders/radix_sort.wgsl");

        let sort_bind_group_layout = radix_sort_bind_group_layout(render_device);

        let queue = |label: &'static str, entry_point: &'static str| {
            pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
                label: Some(Cow::from(label)),
                layout: vec![sort_bind_group_layout.clone()],
                push_constant_ranges: vec![],
                shader: shader.clone(),
                shader_defs: vec![],
                entry_point: Some(Cow::from(entry_point)),
                zero_initialize_workgroup_memory: false,
            })
        };

        let histogram_pipeline = queue("radix_sort_histogram", HISTOGRAM_ENTRY_POINT);
        let spine_pipeline = queue("radix_sort_spine", SPINE_ENTRY_POINT);
        let scatter_pipeline = queue("radix_sort_scatter", SCATTER_ENTRY_POINT);

        Self {
            histogram_pipeline,
            spine_pipeline,
            scatter_pipeline,
            sort_bind_group_layout,
            shader,
        }
    }
}

impl RadixSortPipelines {
    /// All three kernels, or `None` while any is still compiling.
    pub fn ready<'a>(&self, pipeline_cache: &'a PipelineCache) -> Option<ReadyRadixSort<'a>> {
        Some(ReadyRadixSort {
            histogram: pipeline_cache.get_compute_pipeline(self.histogram_pipeline)?,
            spine: pipeline_cache.get_compute_pipeline(self.spine_pipeline)?,
            scatter: pipeline_cache.get_compute_pipeline(self.scatter_pipeline)?,
        })
    }
}

pub struct ReadyRadixSort<'a> {
    pub histogram: &'a ComputePipeline,
    pub spine: &'a ComputePipeline,
    pub scatter: &'a ComputePipeline,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable, ShaderType)]
pub struct SortPassParams {
    pub bit_shift: u32,
    pub pass_index: u32,
    pub _padding: [u32; 2],
}

impl SortPassParams {
    pub fn for_pass(pass: u32) -> Self {
        Self {
            bit_shift: pass * RADIX_BITS,
            pass_index: pass,
            _padding: [0; 2],
        }
    }
}

/// Sort storage for one point cloud.
#[derive(Clone)]
pub struct RadixSortBuffers {
    pub keys: PingPong<Buffer>,
    pub values: PingPong<Buffer>,
    /// RADIX counters per partition, rewritten by every histogram dispatch
    pub partition_histogram: Buffer,
    /// RADIX global bucket offsets, rewritten by every spine dispatch
    pub digit_offsets: Buffer,
    pub pass_params: Vec<Buffer>,
    pub capacity: SortCapacity,
}

pub fn create_radix_sort_buffers(
    render_device: &RenderDevice,
    capacity: SortCapacity,
) -> RadixSortBuffers {
    let entry_bytes = u64::from(capacity.max_entries) * 4;
    let pair = |label: &str| {
        let usage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        PingPong {
            a: render_device.create_buffer(&BufferDescriptor {
                label: Some(&format!("{label}_a")),
                size: entry_bytes,
                usage,
                mapped_at_creation: false,
            }),
            b: render_device.create_buffer(&BufferDescriptor {
                label: Some(&format!("{label}_b")),
                size: entry_bytes,
                usage,
                mapped_at_creation: false,
            }),
        }
    };

    let partition_histogram = render_device.create_buffer(&BufferDescriptor {
        label: Some("radix_sort_partition_histogram"),
        size: capacity.partition_histogram_size(),
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let digit_offsets = render_device.create_buffer_with_data(&BufferInitDescriptor {
        label: Some("radix_sort_digit_offsets"),
        contents: bytemuck::cast_slice(&[0u32; RADIX]),
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
    });

    let pass_params = (0..SORT_PASSES)
        .map(|pass| {
            render_device.create_buffer_with_data(&BufferInitDescriptor {
                label: Some(&format!("radix_sort_params_p{pass}")),
                contents: bytemuck::bytes_of(&SortPassParams::for_pass(pass)),
                usage: BufferUsages::UNIFORM,
            })
        })
        .collect();

    RadixSortBuffers {
        keys: pair("radix_sort_keys"),
        values: pair("radix_sort_values"),
        partition_histogram,
        digit_offsets,
        pass_params,
        capacity,
    }
}

/// One bind group per pass, with the ping-pong direction baked in.
#[derive(Clone)]
pub struct RadixSortBindGroups {
    pub passes: Vec<BindGroup>,
}

pub fn create_radix_sort_bind_groups(
    render_device: &RenderDevice,
    layout: &BindGroupLayout,
    buffers: &RadixSortBuffers,
    sort_info: &Buffer,
) -> RadixSortBindGroups {
    let passes = (0..SORT_PASSES)
        .map(|pass| {
            let (keys_in, keys_out) = buffers.keys.for_pass(pass);
            let (values_in, values_out) = buffers.values.for_pass(pass);
            render_device.create_bind_group(
                Some(format!("radix_sort_bind_group_p{pass}").as_str()),
                layout,
                &BindGroupEntries::sequential((
                    buffers.pass_params[pass as usize].as_entire_binding(),
                    sort_info.as_entire_binding(),
                    keys_in.as_entire_binding(),
                    values_in.as_entire_binding(),
                    keys_out.as_entire_binding(),
                    values_out.as_entire_binding(),
                    buffers.partition_histogram.as_entire_binding(),
                    buffers.digit_offsets.as_entire_binding(),
                )),
            )
        })
        .collect();

    RadixSortBindGroups { passes }
}

/// Record one sort pass.
///
/// Each stage runs in its own compute pass so the next stage sees its writes.
pub fn record_sort_pass(
    encoder: &mut CommandEncoder,
    pipelines: &ReadyRadixSort,
    bind_groups: &RadixSortBindGroups,
    sort_dispatch: &Buffer,
    pass: u32,
) {
    let bind_group = &bind_groups.passes[pass as usize];

    {
        let mut compute_pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some(&format!("radix_histogram_p{pass}")),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(pipelines.histogram);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.dispatch_workgroups_indirect(sort_dispatch, 0);
    }

    {
        let mut compute_pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some(&format!("radix_spine_p{pass}")),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(pipelines.spine);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.dispatch_workgroups(1, 1, 1);
    }

    {
        let mut compute_pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some(&format!("radix_scatter_p{pass}")),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(pipelines.scatter);
        compute_pass.set_bind_group(0, bind_group, &[]);
        compute_pass.dispatch_workgroups_indirect(sort_dispatch, 0);
    }
}

/// Zero-filled info block for running the sort on externally filled keys.
pub fn sort_info_for(count: u32, capacity: &SortCapacity) -> SortInfo {
    SortInfo {
        keys_size: capacity.clamp_entries(count as usize),
        capacity: capacity.max_entries,
        _padding: [0; 2],
    }
}
