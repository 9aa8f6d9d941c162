// One frame of splat rendering, recorded into a single command encoder:
// RESET -> PREPROCESS -> SORT(0..passes) -> PROPAGATE_COUNT -> DRAW

use bevy::{
    prelude::*,
    render::render_resource::{
        BindGroup, CachedRenderPipelineId, CommandEncoder, ComputePipeline, PipelineCache,
        RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline,
    },
};

use crate::{
    dispatch::DispatchSizer,
    preprocess::{record_preprocess, PreprocessPipeline},
    radix_sort::{record_sort_pass, RadixSortBindGroups, RadixSortPipelines, ReadyRadixSort, SORT_PASSES},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStage {
    Reset,
    Preprocess,
    Sort { pass: u32 },
    PropagateCount,
    Draw,
}

/// Stages of one frame, in recording order.
pub fn frame_schedule(passes: u32) -> Vec<FrameStage> {
    let mut stages = vec![FrameStage::Reset, FrameStage::Preprocess];
    stages.extend((0..passes).map(|pass| FrameStage::Sort { pass }));
    stages.extend([FrameStage::PropagateCount, FrameStage::Draw]);
    stages
}

/// Every pipeline a frame needs, resolved from the cache.
pub struct FramePipelines<'a> {
    pub preprocess: &'a ComputePipeline,
    pub sort: ReadyRadixSort<'a>,
    pub draw: &'a RenderPipeline,
}

impl<'a> FramePipelines<'a> {
    /// `None` until every pipeline has compiled. A frame is never recorded partially.
    pub fn resolve(
        pipeline_cache: &'a PipelineCache,
        preprocess: &PreprocessPipeline,
        sort: &RadixSortPipelines,
        draw: CachedRenderPipelineId,
    ) -> Option<Self> {
        Some(Self {
            preprocess: pipeline_cache.get_compute_pipeline(preprocess.pipeline)?,
            sort: sort.ready(pipeline_cache)?,
            draw: pipeline_cache.get_render_pipeline(draw)?,
        })
    }
}

/// Bind groups and buffers for one cloud seen from one view.
pub struct FrameBindings<'a> {
    pub camera: &'a BindGroup,
    pub cloud: &'a BindGroup,
    pub sort_input: &'a BindGroup,
    pub sort_passes: &'a RadixSortBindGroups,
    pub draw: &'a BindGroup,
    pub dispatch: &'a DispatchSizer,
    pub preprocess_workgroups: u32,
}

pub struct FrameTarget<'a> {
    pub color_attachment: RenderPassColorAttachment<'a>,
    /// x, y, width, height in pixels
    pub viewport: Option<UVec4>,
}

pub fn record_splat_frame(
    encoder: &mut CommandEncoder,
    pipelines: &FramePipelines,
    bindings: &FrameBindings,
    target: FrameTarget,
) {
    let mut target = Some(target);

    for stage in frame_schedule(SORT_PASSES) {
        trace!(?stage, workgroups = bindings.preprocess_workgroups, "recording splat stage");
        match stage {
            FrameStage::Reset => bindings.dispatch.record_reset(encoder),
            FrameStage::Preprocess => record_preprocess(
                encoder,
                pipelines.preprocess,
                bindings.camera,
                bindings.cloud,
                bindings.sort_input,
                bindings.preprocess_workgroups,
            ),
            FrameStage::Sort { pass } => record_sort_pass(
                encoder,
                &pipelines.sort,
                bindings.sort_passes,
                &bindings.dispatch.sort_dispatch,
                pass,
            ),
            FrameStage::PropagateCount => bindings.dispatch.record_propagate_count(encoder),
            FrameStage::Draw => {
                if let Some(target) = target.take() {
                    record_draw(encoder, pipelines.draw, bindings, target);
                }
            }
        }
    }
}

fn record_draw(
    encoder: &mut CommandEncoder,
    pipeline: &RenderPipeline,
    bindings: &FrameBindings,
    target: FrameTarget,
) {
    let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some("splat_draw"),
        color_attachments: &[Some(target.color_attachment)],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    if let Some(viewport) = target.viewport {
        render_pass.set_viewport(
            viewport.x as f32,
            viewport.y as f32,
            viewport.z as f32,
            viewport.w as f32,
            0.0,
            1.0,
        );
    }

    render_pass.set_pipeline(pipeline);
    render_pass.set_bind_group(0, bindings.camera, &[]);
    render_pass.set_bind_group(1, bindings.draw, &[]);
    render_pass.draw_indirect(&bindings.dispatch.draw_indirect, 0);
}
