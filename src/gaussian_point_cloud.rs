use bevy::{
    asset::load_embedded_asset,
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        extract_resource::ExtractResourcePlugin,
        render_graph::{NodeRunError, RenderGraphContext, RenderGraphExt, RenderLabel, ViewNode, ViewNodeRunner},
        render_resource::{
            binding_types::storage_buffer_read_only_sized,
            BindGroup, BindGroupEntries, BindGroupLayout, BindGroupLayoutEntries, BlendComponent,
            BlendFactor, BlendOperation, BlendState, Buffer, BufferDescriptor, BufferInitDescriptor,
            BufferUsages, CachedRenderPipelineId, ColorTargetState, ColorWrites, FragmentState,
            LoadOp, MultisampleState, Operations, PipelineCache, PrimitiveState, PrimitiveTopology,
            RenderPipelineDescriptor, ShaderStages, SpecializedRenderPipeline,
            SpecializedRenderPipelines, StoreOp, TextureFormat, VertexState,
        },
        renderer::{RenderContext, RenderDevice, RenderQueue},
        view::{ExtractedView, Msaa, ViewTarget},
        Extract, ExtractSchedule, Render, RenderApp, RenderSystems,
    },
};
use std::sync::{Arc, Mutex};

use crate::{
    dispatch::DispatchSizer,
    error::{SplatRenderError, SplatResult},
    frame::{record_splat_frame, FrameBindings, FramePipelines, FrameTarget},
    gaussian_splats::{GaussianSplats, GpuSplat2d},
    preprocess::{preprocess_workgroups, PreprocessPipeline},
    radix_sort::{
        create_radix_sort_bind_groups, create_radix_sort_buffers, RadixSortBindGroups,
        RadixSortBuffers, RadixSortPipelines, SortCapacity,
    },
    render_settings::{CameraUniform, SplatRenderConfig},
};

/// Sorted Gaussian splat rendering plugin
pub struct GaussianSplatSortPlugin;

impl Plugin for GaussianSplatSortPlugin {
    fn build(&self, app: &mut App) {
        // Shaders are registered in the main app so the render app's asset server sees them
        crate::EmbeddedShadersPlugin.build(app);

        app.init_resource::<SplatRenderConfig>()
            .register_type::<SplatRenderConfig>()
            .register_type::<GaussianSplats>()
            .add_plugins(ExtractResourcePlugin::<SplatRenderConfig>::default());

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<SpecializedRenderPipelines<SplatDrawPipeline>>()
            .init_resource::<PreparedSplatClouds>()
            .add_systems(ExtractSchedule, extract_gaussian_splats)
            .add_systems(
                Render,
                (track_device_loss, prepare_splat_draw_pipelines).in_set(RenderSystems::Prepare),
            )
            .add_systems(
                Render,
                (prepare_splat_cloud_buffers, prepare_splat_view_cameras)
                    .in_set(RenderSystems::PrepareResources),
            )
            .add_systems(
                Render,
                update_splat_settings
                    .in_set(RenderSystems::PrepareResources)
                    .after(prepare_splat_cloud_buffers),
            )
            .add_systems(
                Render,
                (prepare_splat_bind_groups, queue_prepared_splat_clouds)
                    .chain()
                    .in_set(RenderSystems::PrepareBindGroups),
            )
            .add_render_graph_node::<ViewNodeRunner<GaussianSplatSortNode>>(Core3d, GaussianSplatSortLabel)
            .add_render_graph_edges(
                Core3d,
                (Node3d::EndMainPass, GaussianSplatSortLabel, Node3d::StartMainPassPostProcessing),
            );
    }

    fn finish(&self, app: &mut App) {
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        // The draw pipeline borrows the camera layout from the preprocess pipeline
        render_app
            .init_resource::<DeviceLossMonitor>()
            .init_resource::<PreprocessPipeline>()
            .init_resource::<RadixSortPipelines>()
            .init_resource::<SplatDrawPipeline>();
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct GaussianSplatSortLabel;

/// Records GPU device loss reported by wgpu.
#[derive(Resource, Clone)]
pub struct DeviceLossMonitor {
    lost: Arc<Mutex<Option<String>>>,
    reported: bool,
}

impl DeviceLossMonitor {
    pub fn install(render_device: &RenderDevice) -> Self {
        let lost = Arc::new(Mutex::new(None));
        let slot = lost.clone();
        render_device
            .wgpu_device()
            .set_device_lost_callback(move |reason, message| {
                let reason = format!("{reason:?}: {message}");
                match slot.lock() {
                    Ok(mut guard) => *guard = Some(reason),
                    Err(poisoned) => *poisoned.into_inner() = Some(reason),
                }
            });
        Self { lost, reported: false }
    }

    pub fn status(&self) -> SplatResult<()> {
        let lost = match self.lost.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match lost {
            Some(reason) => Err(SplatRenderError::DeviceLost(reason)),
            None => Ok(()),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.status().is_err()
    }
}

impl FromWorld for DeviceLossMonitor {
    fn from_world(world: &mut World) -> Self {
        Self::install(world.resource::<RenderDevice>())
    }
}

/// Cloud that failed validation; no GPU state is built for it until its data changes.
#[derive(Component)]
pub struct SplatCloudRejected;

/// Primitive data and per-cloud uniforms on the GPU.
#[derive(Component, Clone)]
pub struct SplatCloudGpu {
    pub gaussians: Buffer,
    pub sh_coefficients: Buffer,
    /// Screen-space splats, rewritten by every preprocess dispatch
    pub splats: Buffer,
    pub settings: Buffer,
    pub num_primitives: u32,
    pub capacity: SortCapacity,
}

/// Sort storage and counters for one cloud.
#[derive(Component, Clone)]
pub struct SplatSortState {
    pub sort: RadixSortBuffers,
    pub dispatch: DispatchSizer,
}

#[derive(Component, Clone)]
pub struct SplatCloudBindGroups {
    pub cloud: BindGroup,
    pub sort_input: BindGroup,
    pub sort_passes: RadixSortBindGroups,
    pub draw: BindGroup,
}

#[derive(Component)]
pub struct SplatViewCamera {
    pub buffer: Buffer,
    pub bind_group: BindGroup,
}

#[derive(Component)]
pub struct SplatDrawPipelineId(pub CachedRenderPipelineId);

/// Everything the render node needs for one cloud this frame.
#[derive(Clone)]
pub struct PreparedSplatCloud {
    pub bind_groups: SplatCloudBindGroups,
    pub dispatch: DispatchSizer,
    pub num_primitives: u32,
}

#[derive(Resource, Default)]
pub struct PreparedSplatClouds(pub Vec<PreparedSplatCloud>);

/// Clone point clouds into the render world once, and again whenever their data changes.
fn extract_gaussian_splats(
    mut commands: Commands,
    mut extracted_entities: Local<std::collections::HashMap<Entity, Entity>>,
    main_world_splats: Extract<Query<(Entity, Ref<GaussianSplats>, Option<&InheritedVisibility>)>>,
) {
    let visible: std::collections::HashSet<Entity> = main_world_splats
        .iter()
        .filter(|(_, _, visibility)| visibility.map(|v| v.get()).unwrap_or(true))
        .map(|(entity, _, _)| entity)
        .collect();

    extracted_entities.retain(|main_entity, render_entity| {
        let keep = visible.contains(main_entity);
        if !keep {
            commands.entity(*render_entity).despawn();
            debug!("released splat cloud {:?}", main_entity);
        }
        keep
    });

    for (main_entity, splats, _) in main_world_splats.iter() {
        if !visible.contains(&main_entity) {
            continue;
        }

        match extracted_entities.get(&main_entity) {
            Some(&render_entity) => {
                if splats.is_changed() {
                    commands
                        .entity(render_entity)
                        .remove::<(SplatCloudGpu, SplatSortState, SplatCloudBindGroups, SplatCloudRejected)>()
                        .insert(GaussianSplats::clone(&splats));
                    debug!("splat cloud {:?} changed, rebuilding GPU state", main_entity);
                }
            }
            None => {
                let render_entity = commands.spawn(GaussianSplats::clone(&splats)).id();
                extracted_entities.insert(main_entity, render_entity);
            }
        }
    }
}

/// Drop per-cloud GPU state while the device is lost, and re-arm the monitor once a new
/// device is installed so the prepare systems rebuild everything.
fn track_device_loss(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    mut monitor: ResMut<DeviceLossMonitor>,
    clouds: Query<Entity, With<SplatCloudGpu>>,
) {
    if render_device.is_changed() && !render_device.is_added() {
        *monitor = DeviceLossMonitor::install(&render_device);
        info!("render device replaced, splat GPU state will be rebuilt");
    }

    if let Err(err) = monitor.status() {
        if !monitor.reported {
            error!("{err}; abandoning splat frames");
            monitor.reported = true;
        }
        for entity in &clouds {
            commands
                .entity(entity)
                .remove::<(SplatCloudGpu, SplatSortState, SplatCloudBindGroups)>();
        }
    }
}

fn prepare_splat_cloud_buffers(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    monitor: Res<DeviceLossMonitor>,
    config: Res<SplatRenderConfig>,
    clouds: Query<(Entity, &GaussianSplats), (Without<SplatCloudGpu>, Without<SplatCloudRejected>)>,
) {
    if monitor.is_lost() {
        return;
    }

    for (entity, splats) in &clouds {
        let capacity = match SortCapacity::for_primitives(splats.len(), &render_device.limits()) {
            Ok(capacity) => capacity,
            Err(err) => {
                let err = SplatRenderError::from(err);
                error!("splat cloud {:?} rejected: {}", entity, err);
                commands.entity(entity).insert(SplatCloudRejected);
                continue;
            }
        };

        let num_primitives = capacity.clamp_entries(splats.len());
        let gaussians = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_gaussians"),
            contents: bytemuck::cast_slice(&splats.pack_gaussians()),
            usage: BufferUsages::STORAGE,
        });
        let sh_coefficients = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_sh"),
            contents: bytemuck::cast_slice(&splats.pack_sh_coefficients()),
            usage: BufferUsages::STORAGE,
        });
        let splat_attributes = render_device.create_buffer(&BufferDescriptor {
            label: Some("splat_attributes"),
            size: u64::from(num_primitives) * std::mem::size_of::<GpuSplat2d>() as u64,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let settings = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_render_settings"),
            contents: bytemuck::bytes_of(&config.settings_uniform(num_primitives)),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
        });

        let sort = create_radix_sort_buffers(&render_device, capacity);
        let dispatch = DispatchSizer::new(&render_device, capacity.max_entries);

        info!(
            "uploaded splat cloud {:?}: {} primitives, {} sort partitions, SH degree {}",
            entity,
            num_primitives,
            capacity.max_partitions,
            splats.sh_degree()
        );

        commands.entity(entity).insert((
            SplatCloudGpu {
                gaussians,
                sh_coefficients,
                splats: splat_attributes,
                settings,
                num_primitives,
                capacity,
            },
            SplatSortState { sort, dispatch },
        ));
    }
}

fn update_splat_settings(
    config: Res<SplatRenderConfig>,
    render_queue: Res<RenderQueue>,
    clouds: Query<&SplatCloudGpu>,
) {
    if !config.is_changed() {
        return;
    }
    for cloud in &clouds {
        let settings = config.settings_uniform(cloud.num_primitives);
        render_queue.write_buffer(&cloud.settings, 0, bytemuck::bytes_of(&settings));
    }
}

fn prepare_splat_view_cameras(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    preprocess: Res<PreprocessPipeline>,
    views: Query<(Entity, &ExtractedView, Option<&SplatViewCamera>), With<ViewTarget>>,
) {
    for (entity, view, camera) in &views {
        let uniform = CameraUniform::new(
            view.world_from_view.to_matrix(),
            view.clip_from_view,
            UVec2::new(view.viewport.z, view.viewport.w),
        );

        match camera {
            Some(camera) => {
                render_queue.write_buffer(&camera.buffer, 0, bytemuck::bytes_of(&uniform));
            }
            None => {
                let buffer = render_device.create_buffer_with_data(&BufferInitDescriptor {
                    label: Some("splat_camera"),
                    contents: bytemuck::bytes_of(&uniform),
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                });
                let bind_group = preprocess.layouts.camera_bind_group(&render_device, &buffer);
                commands.entity(entity).insert(SplatViewCamera { buffer, bind_group });
            }
        }
    }
}

fn prepare_splat_draw_pipelines(
    mut commands: Commands,
    pipeline_cache: Res<PipelineCache>,
    mut pipelines: ResMut<SpecializedRenderPipelines<SplatDrawPipeline>>,
    pipeline: Res<SplatDrawPipeline>,
    views: Query<(Entity, &ViewTarget, &Msaa)>,
) {
    for (entity, target, msaa) in &views {
        let key = SplatDrawPipelineKey {
            format: target.main_texture_format(),
            msaa_samples: msaa.samples(),
        };
        let id = pipelines.specialize(&pipeline_cache, &pipeline, key);
        commands.entity(entity).insert(SplatDrawPipelineId(id));
    }
}

fn prepare_splat_bind_groups(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    preprocess: Res<PreprocessPipeline>,
    sort_pipelines: Res<RadixSortPipelines>,
    draw_pipeline: Res<SplatDrawPipeline>,
    clouds: Query<(Entity, &SplatCloudGpu, &SplatSortState), Without<SplatCloudBindGroups>>,
) {
    for (entity, cloud, state) in &clouds {
        let cloud_bind_group = preprocess.layouts.cloud_bind_group(
            &render_device,
            &cloud.gaussians,
            &cloud.splats,
            &cloud.settings,
            &cloud.sh_coefficients,
        );
        let sort_input = preprocess
            .layouts
            .sort_input_bind_group(&render_device, &state.dispatch, &state.sort);
        let sort_passes = create_radix_sort_bind_groups(
            &render_device,
            &sort_pipelines.sort_bind_group_layout,
            &state.sort,
            &state.dispatch.sort_info,
        );

        let draw = render_device.create_bind_group(
            Some("splat_draw_bind_group"),
            &draw_pipeline.cloud_layout,
            &BindGroupEntries::sequential((
                cloud.splats.as_entire_binding(),
                state.sort.values.output().as_entire_binding(),
            )),
        );

        commands.entity(entity).insert(SplatCloudBindGroups {
            cloud: cloud_bind_group,
            sort_input,
            sort_passes,
            draw,
        });
    }
}

fn queue_prepared_splat_clouds(
    mut prepared: ResMut<PreparedSplatClouds>,
    clouds: Query<(&SplatCloudGpu, &SplatSortState, &SplatCloudBindGroups)>,
) {
    prepared.0.clear();
    prepared
        .0
        .extend(clouds.iter().map(|(cloud, state, bind_groups)| PreparedSplatCloud {
            bind_groups: bind_groups.clone(),
            dispatch: state.dispatch.clone(),
            num_primitives: cloud.num_primitives,
        }));
}

/// Instanced quad pipeline reading sorted indices
#[derive(Resource)]
pub struct SplatDrawPipeline {
    pub camera_layout: BindGroupLayout,
    /// splat attributes, sorted indices
    pub cloud_layout: BindGroupLayout,
    pub shader: Handle<Shader>,
}

impl FromWorld for SplatDrawPipeline {
    fn from_world(world: &mut World) -> Self {
        let asset_server = world.resource::<AssetServer>();
        let render_device = world.resource::<RenderDevice>();
        let camera_layout = world.resource::<PreprocessPipeline>().layouts.camera.clone();

        let cloud_layout = render_device.create_bind_group_layout(
            Some("splat_draw_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::VERTEX,
                (
                    storage_buffer_read_only_sized(false, None),
                    storage_buffer_read_only_sized(false, None),
                ),
            ),
        );

        let shader = load_embedded_asset!(asset_server, "../assets/shaders/gaussian_splat.wgsl");

        Self {
            camera_layout,
            cloud_layout,
            shader,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone)]
pub struct SplatDrawPipelineKey {
    pub format: TextureFormat,
    pub msaa_samples: u32,
}

impl SpecializedRenderPipeline for SplatDrawPipeline {
    type Key = SplatDrawPipelineKey;

    fn specialize(&self, key: Self::Key) -> RenderPipelineDescriptor {
        // Premultiplied "over": the fragment shader outputs vec4(color * alpha, alpha)
        let over = BlendComponent {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOperation::Add,
        };

        RenderPipelineDescriptor {
            label: Some("splat_draw_pipeline".into()),
            layout: vec![self.camera_layout.clone(), self.cloud_layout.clone()],
            vertex: VertexState {
                shader: self.shader.clone(),
                shader_defs: vec![],
                entry_point: Some("vertex".into()),
                buffers: vec![],
            },
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleStrip,
                cull_mode: None,
                ..default()
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: key.msaa_samples,
                ..Default::default()
            },
            fragment: Some(FragmentState {
                shader: self.shader.clone(),
                shader_defs: vec![],
                entry_point: Some("fragment".into()),
                targets: vec![Some(ColorTargetState {
                    format: key.format,
                    blend: Some(BlendState {
                        color: over,
                        alpha: over,
                    }),
                    write_mask: ColorWrites::ALL,
                })],
                ..default()
            }),
            ..default()
        }
    }
}

/// Runs the full preprocess, sort and draw sequence for every cloud
#[derive(Default)]
pub struct GaussianSplatSortNode;

impl ViewNode for GaussianSplatSortNode {
    type ViewQuery = (
        &'static ExtractedView,
        &'static ViewTarget,
        Option<&'static SplatViewCamera>,
        Option<&'static SplatDrawPipelineId>,
    );

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (view, target, camera, draw_pipeline_id): bevy::ecs::query::QueryItem<'w, 'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let config = world.resource::<SplatRenderConfig>();
        let clouds = world.resource::<PreparedSplatClouds>();
        if !config.enabled || clouds.0.is_empty() {
            return Ok(());
        }
        let (Some(camera), Some(draw_pipeline_id)) = (camera, draw_pipeline_id) else {
            return Ok(());
        };
        if world.resource::<DeviceLossMonitor>().is_lost() {
            return Ok(());
        }

        let pipeline_cache = world.resource::<PipelineCache>();
        let Some(pipelines) = FramePipelines::resolve(
            pipeline_cache,
            world.resource::<PreprocessPipeline>(),
            world.resource::<RadixSortPipelines>(),
            draw_pipeline_id.0,
        ) else {
            trace!("splat pipelines still compiling, skipping frame");
            return Ok(());
        };

        let encoder = render_context.command_encoder();
        for (i, cloud) in clouds.0.iter().enumerate() {
            let load = if i == 0 && config.clear_target {
                LoadOp::Clear(wgpu::Color::BLACK)
            } else {
                LoadOp::Load
            };
            let mut color_attachment = target.get_color_attachment();
            color_attachment.ops = Operations {
                load,
                store: StoreOp::Store,
            };

            let bind_groups = &cloud.bind_groups;
            record_splat_frame(
                encoder,
                &pipelines,
                &FrameBindings {
                    camera: &camera.bind_group,
                    cloud: &bind_groups.cloud,
                    sort_input: &bind_groups.sort_input,
                    sort_passes: &bind_groups.sort_passes,
                    draw: &bind_groups.draw,
                    dispatch: &cloud.dispatch,
                    preprocess_workgroups: preprocess_workgroups(cloud.num_primitives),
                },
                FrameTarget {
                    color_attachment,
                    viewport: Some(view.viewport),
                },
            );
        }

        Ok(())
    }
}
