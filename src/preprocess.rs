// Preprocess kernel: projection, culling and sort key generation

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
    dispatch::DispatchSizer,
    gaussian_splats::GpuGaussian,
    radix_sort::RadixSortBuffers,
    render_settings::{CameraUniform, RenderSettingsUniform, SortDirection},
};

/// Threads per preprocess workgroup. Must match `preprocess.wgsl`.
pub const PREPROCESS_WORKGROUP_SIZE: u32 = 256;
pub const PREPROCESS_ENTRY_POINT: &str = "preprocess";

/// Workgroups needed to visit every primitive once.
pub fn preprocess_workgroups(num_primitives: u32) -> u32 {
    num_primitives.div_ceil(PREPROCESS_WORKGROUP_SIZE)
}

/// Map an f32 to a u32 whose unsigned order matches the float order.
///
/// Negative floats have all bits flipped, non-negative floats get the sign bit set.
pub fn sortable_key(value: f32) -> u32 {
    let bits = value.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Sort key for a view depth. Back-to-front inverts the key so that ascending key order
/// visits the farthest splat first.
pub fn depth_sort_key(depth: f32, direction: SortDirection) -> u32 {
    match direction {
        SortDirection::BackToFront => !sortable_key(depth),
        SortDirection::FrontToBack => sortable_key(depth),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SortEntry {
    pub key: u32,
    pub index: u32,
}

/// View depth of a world-space point, positive in front of the camera.
pub fn view_depth(camera: &CameraUniform, position: Vec3) -> f32 {
    -(camera.view * position.extend(1.0)).z
}

/// Sort key for one primitive, or `None` when the preprocess kernel culls it.
pub fn project_for_sort(
    camera: &CameraUniform,
    settings: &RenderSettingsUniform,
    gaussian: &GpuGaussian,
) -> Option<u32> {
    let view_position = camera.view * gaussian.position_opacity.truncate().extend(1.0);
    let depth = -view_position.z;
    if depth < settings.near_plane {
        return None;
    }

    let clip = camera.proj * view_position;
    let ndc = clip.truncate().truncate() / clip.w;
    let limit = 1.0 + settings.frustum_dilation;
    if ndc.abs().max_element() > limit {
        return None;
    }

    if gaussian.position_opacity.w < settings.alpha_cull_threshold {
        return None;
    }

    let direction = if settings.sort_descending != 0 {
        SortDirection::BackToFront
    } else {
        SortDirection::FrontToBack
    };
    Some(depth_sort_key(depth, direction))
}

/// The entries the preprocess kernel appends for `gaussians`, in index order.
/// The kernel appends in whatever order its atomic counter hands out slots.
pub fn generate_sort_entries(
    camera: &CameraUniform,
    settings: &RenderSettingsUniform,
    gaussians: &[GpuGaussian],
) -> Vec<SortEntry> {
    gaussians
        .iter()
        .enumerate()
        .filter_map(|(index, gaussian)| {
            project_for_sort(camera, settings, gaussian).map(|key| SortEntry {
                key,
                index: index as u32,
            })
        })
        .collect()
}

/// Binding sets of the preprocess kernel. The camera set is shared with the draw pipeline.
#[derive(Clone)]
pub struct PreprocessLayouts {
    /// group 0
    pub camera: BindGroupLayout,
    /// group 1: primitives, splat output, render settings, SH
    pub cloud: BindGroupLayout,
    /// group 2: sort info, keys, indices, sort dispatch args
    pub sort_input: BindGroupLayout,
}

impl PreprocessLayouts {
    pub fn new(render_device: &RenderDevice) -> Self {
        let camera = render_device.create_bind_group_layout(
            Some("splat_camera_layout"),
            &BindGroupLayoutEntries::single(
                ShaderStages::COMPUTE | ShaderStages::VERTEX_FRAGMENT,
                uniform_buffer::<CameraUniform>(false),
            ),
        );

        let cloud = render_device.create_bind_group_layout(
            Some("splat_cloud_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::COMPUTE,
                (
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_sized(false, None),
                    uniform_buffer::<RenderSettingsUniform>(false),
                    storage_buffer_read_only_sized(false, None),
                ),
            ),
        );

        let sort_input = render_device.create_bind_group_layout(
            Some("splat_sort_input_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::COMPUTE,
                (
                    storage_buffer_sized(false, None),
                    storage_buffer_sized(false, None),
                    storage_buffer_sized(false, None),
                    storage_buffer_sized(false, None),
                ),
            ),
        );

        Self {
            camera,
            cloud,
            sort_input,
        }
    }

    pub fn all(&self) -> Vec<BindGroupLayout> {
        vec![self.camera.clone(), self.cloud.clone(), self.sort_input.clone()]
    }

    pub fn camera_bind_group(&self, render_device: &RenderDevice, camera: &Buffer) -> BindGroup {
        render_device.create_bind_group(
            Some("splat_camera_bind_group"),
            &self.camera,
            &BindGroupEntries::single(camera.as_entire_binding()),
        )
    }

    pub fn cloud_bind_group(
        &self,
        render_device: &RenderDevice,
        gaussians: &Buffer,
        splats: &Buffer,
        settings: &Buffer,
        sh_coefficients: &Buffer,
    ) -> BindGroup {
        render_device.create_bind_group(
            Some("splat_cloud_bind_group"),
            &self.cloud,
            &BindGroupEntries::sequential((
                gaussians.as_entire_binding(),
                splats.as_entire_binding(),
                settings.as_entire_binding(),
                sh_coefficients.as_entire_binding(),
            )),
        )
    }

    /// Appends go to the input slot of the sort's ping-pong pairs.
    pub fn sort_input_bind_group(
        &self,
        render_device: &RenderDevice,
        dispatch: &DispatchSizer,
        sort: &RadixSortBuffers,
    ) -> BindGroup {
        render_device.create_bind_group(
            Some("splat_sort_input_bind_group"),
            &self.sort_input,
            &BindGroupEntries::sequential((
                dispatch.sort_info.as_entire_binding(),
                sort.keys.input().as_entire_binding(),
                sort.values.input().as_entire_binding(),
                dispatch.sort_dispatch.as_entire_binding(),
            )),
        )
    }
}

#[derive(Resource, Clone)]
pub struct PreprocessPipeline {
    pub pipeline: CachedComputePipelineId,
    pub layouts: PreprocessLayouts,
    pub shader: Handle<Shader>,
}

impl FromWorld for PreprocessPipeline {
    fn from_world(world: &mut World) -> Self {
        let asset_server = world.resource::<AssetServer>();
        let render_device = world.resource::<RenderDevice>();
        let pipeline_cache = world.resource::<PipelineCache>();

        let shader = load_embedded_asset!(asset_server, "../assets/shaders/preprocess.wgsl");
        let layouts = PreprocessLayouts::new(render_device);

        let pipeline = pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
            label: Some(Cow::from("splat_preprocess")),
            layout: layouts.all(),
            push_constant_ranges: vec![],
            shader: shader.clone(),
            shader_defs: vec![],
            entry_point: Some(Cow::from(PREPROCESS_ENTRY_POINT)),
            zero_initialize_workgroup_memory: false,
        });

        Self {
            pipeline,
            layouts,
            shader,
        }
    }
}

pub fn record_preprocess(
    encoder: &mut CommandEncoder,
    pipeline: &ComputePipeline,
    camera_bind_group: &BindGroup,
    cloud_bind_group: &BindGroup,
    sort_input_bind_group: &BindGroup,
    workgroups: u32,
) {
    let mut compute_pass = encoder.begin_compute_pass(&ComputePassDescriptor {
        label: Some("splat_preprocess"),
        timestamp_writes: None,
    });
    compute_pass.set_pipeline(pipeline);
    compute_pass.set_bind_group(0, camera_bind_group, &[]);
    compute_pass.set_bind_group(1, cloud_bind_group, &[]);
    compute_pass.set_bind_group(2, sort_input_bind_group, &[]);
    compute_pass.dispatch_workgroups(workgroups, 1, 1);
}
