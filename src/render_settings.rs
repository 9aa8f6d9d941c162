// Render configuration and the small uniform blocks shared by the kernels

use bevy::{
    prelude::*,
    render::{extract_resource::ExtractResource, render_resource::ShaderType},
};

/// Highest SH degree the preprocess kernel evaluates.
pub const MAX_SH_DEGREE: u32 = 3;

/// Order in which splats are composited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Reflect)]
pub enum SortDirection {
    /// Farthest first, for premultiplied "over" blending.
    #[default]
    BackToFront,
    /// Nearest first.
    FrontToBack,
}

/// Global splat rendering configuration, extracted to the render world every frame.
#[derive(Resource, Clone, Debug, ExtractResource, Reflect)]
#[reflect(Resource)]
pub struct SplatRenderConfig {
    pub enabled: bool,
    pub sort_direction: SortDirection,
    /// Clamped to `MAX_SH_DEGREE`
    pub sh_degree: u32,
    /// Multiplier on every splat's scale
    pub splat_scale: f32,
    /// Extra NDC margin kept around the frustum so large splats near the edge are not culled
    pub frustum_dilation: f32,
    /// Splats closer than this view depth are culled
    pub near_plane: f32,
    /// Splats with a lower opacity are culled
    pub alpha_cull_threshold: f32,
    /// Clear the view target before drawing the first cloud
    pub clear_target: bool,
}

impl Default for SplatRenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sort_direction: SortDirection::BackToFront,
            sh_degree: MAX_SH_DEGREE,
            splat_scale: 1.0,
            frustum_dilation: 0.2,
            near_plane: 0.2,
            alpha_cull_threshold: 1.0 / 255.0,
            clear_target: true,
        }
    }
}

impl SplatRenderConfig {
    pub fn settings_uniform(&self, num_primitives: u32) -> RenderSettingsUniform {
        RenderSettingsUniform {
            splat_scale: self.splat_scale.max(0.0),
            sh_degree: self.sh_degree.min(MAX_SH_DEGREE),
            sort_descending: u32::from(self.sort_direction == SortDirection::BackToFront),
            num_primitives,
            frustum_dilation: self.frustum_dilation.max(0.0),
            near_plane: self.near_plane,
            alpha_cull_threshold: self.alpha_cull_threshold,
            _padding: 0,
        }
    }
}

/// Per-cloud scalar settings read by the preprocess kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable, ShaderType)]
pub struct RenderSettingsUniform {
    pub splat_scale: f32,
    pub sh_degree: u32,
    /// 1 when the key is bit-inverted so ascending order is back-to-front
    pub sort_descending: u32,
    pub num_primitives: u32,
    pub frustum_dilation: f32,
    pub near_plane: f32,
    pub alpha_cull_threshold: f32,
    pub _padding: u32,
}

/// Camera block bound at group 0 by both the preprocess and the draw pipeline.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable, ShaderType)]
pub struct CameraUniform {
    pub view: Mat4,
    pub proj: Mat4,
    /// World-space camera position, w = 1
    pub position: Vec4,
    /// Viewport size in pixels
    pub viewport: Vec2,
    /// Focal lengths in pixels
    pub focal: Vec2,
}

impl CameraUniform {
    pub fn new(world_from_view: Mat4, clip_from_view: Mat4, viewport: UVec2) -> Self {
        let viewport = viewport.max(UVec2::ONE).as_vec2();
        let focal = Vec2::new(
            clip_from_view.x_axis.x * viewport.x * 0.5,
            clip_from_view.y_axis.y * viewport.y * 0.5,
        );
        Self {
            view: world_from_view.inverse(),
            proj: clip_from_view,
            position: world_from_view.w_axis,
            viewport,
            focal,
        }
    }

    /// Camera looking from `eye` towards `target` with a perspective projection, handy for
    /// tests and tools that don't run a Bevy camera.
    pub fn looking_at(eye: Vec3, target: Vec3, fov_y: f32, viewport: UVec2) -> Self {
        let world_from_view = Mat4::look_at_rh(eye, target, Vec3::Y).inverse();
        let aspect = viewport.x.max(1) as f32 / viewport.y.max(1) as f32;
        let clip_from_view = Mat4::perspective_infinite_reverse_rh(fov_y, aspect, 0.1);
        Self::new(world_from_view, clip_from_view, viewport)
    }
}
