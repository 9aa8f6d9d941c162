// Device-side counters and indirect arguments.
//
// The preprocess kernel bumps `SortInfo::keys_size` once per visible primitive and
// `DispatchIndirectArgs::x` once per started sort workgroup. Everything downstream reads
// those values on the device: the sort passes through indirect dispatch, the draw through a
// buffer-to-buffer copy into its instance count. The host never reads them back.

use bevy::render::{
    render_resource::{Buffer, BufferInitDescriptor, BufferUsages, CommandEncoder},
    renderer::RenderDevice,
};
use std::mem::{offset_of, size_of};

/// Vertices per splat quad, drawn as a triangle strip.
pub const QUAD_VERTICES: u32 = 4;

/// Per-frame sort bookkeeping shared by the preprocess and sort kernels.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SortInfo {
    /// Number of valid entries appended this frame
    pub keys_size: u32,
    /// Length of the key and index arrays
    pub capacity: u32,
    pub _padding: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Default for DispatchIndirectArgs {
    fn default() -> Self {
        Self { x: 0, y: 1, z: 1 }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl Default for DrawIndirectArgs {
    fn default() -> Self {
        Self {
            vertex_count: QUAD_VERTICES,
            instance_count: 0,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}

/// A 4-byte field inside one of the sizer's buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CounterField {
    /// Four zero bytes, never written
    Zero,
    KeysSize,
    DispatchX,
    InstanceCount,
}

impl CounterField {
    pub const fn offset(self) -> u64 {
        match self {
            CounterField::Zero => 0,
            CounterField::KeysSize => offset_of!(SortInfo, keys_size) as u64,
            CounterField::DispatchX => offset_of!(DispatchIndirectArgs, x) as u64,
            CounterField::InstanceCount => offset_of!(DrawIndirectArgs, instance_count) as u64,
        }
    }
}

/// One device-to-device counter copy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CounterCopy {
    pub source: CounterField,
    pub destination: CounterField,
}

impl CounterCopy {
    pub const SIZE: u64 = size_of::<u32>() as u64;
}

/// Zeroes the per-frame counters before the preprocess kernel appends to them.
pub const RESET_COPIES: [CounterCopy; 2] = [
    CounterCopy {
        source: CounterField::Zero,
        destination: CounterField::KeysSize,
    },
    CounterCopy {
        source: CounterField::Zero,
        destination: CounterField::DispatchX,
    },
];

/// Forwards the valid entry count into the draw's instance count.
pub const PROPAGATE_COPY: CounterCopy = CounterCopy {
    source: CounterField::KeysSize,
    destination: CounterField::InstanceCount,
};

/// Workgroups the sort kernels need for `count` entries with `keys_per_workgroup` keys each.
/// This is the value the preprocess kernel leaves in `DispatchIndirectArgs::x`.
pub fn workgroups_for(count: u32, keys_per_workgroup: u32) -> u32 {
    count.div_ceil(keys_per_workgroup)
}

/// Counter and indirect-argument buffers for one point cloud.
#[derive(Clone)]
pub struct DispatchSizer {
    pub sort_info: Buffer,
    pub sort_dispatch: Buffer,
    pub draw_indirect: Buffer,
    zero_source: Buffer,
}

impl DispatchSizer {
    pub fn new(render_device: &RenderDevice, capacity: u32) -> Self {
        let sort_info = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_sort_info"),
            contents: bytemuck::bytes_of(&SortInfo {
                capacity,
                ..Default::default()
            }),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        });

        let sort_dispatch = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_sort_dispatch"),
            contents: bytemuck::bytes_of(&DispatchIndirectArgs::default()),
            usage: BufferUsages::STORAGE | BufferUsages::INDIRECT | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        });

        let draw_indirect = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_draw_indirect"),
            contents: bytemuck::bytes_of(&DrawIndirectArgs::default()),
            usage: BufferUsages::INDIRECT | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        });

        let zero_source = render_device.create_buffer_with_data(&BufferInitDescriptor {
            label: Some("splat_counter_zero"),
            contents: bytemuck::bytes_of(&0u32),
            usage: BufferUsages::COPY_SRC,
        });

        Self {
            sort_info,
            sort_dispatch,
            draw_indirect,
            zero_source,
        }
    }

    fn buffer(&self, field: CounterField) -> &Buffer {
        match field {
            CounterField::Zero => &self.zero_source,
            CounterField::KeysSize => &self.sort_info,
            CounterField::DispatchX => &self.sort_dispatch,
            CounterField::InstanceCount => &self.draw_indirect,
        }
    }

    fn record_copy(&self, encoder: &mut CommandEncoder, copy: CounterCopy) {
        encoder.copy_buffer_to_buffer(
            self.buffer(copy.source),
            copy.source.offset(),
            self.buffer(copy.destination),
            copy.destination.offset(),
            CounterCopy::SIZE,
        );
    }

    pub fn record_reset(&self, encoder: &mut CommandEncoder) {
        for copy in RESET_COPIES {
            self.record_copy(encoder, copy);
        }
    }

    pub fn record_propagate_count(&self, encoder: &mut CommandEncoder) {
        self.record_copy(encoder, PROPAGATE_COPY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layouts_match_indirect_formats() {
        assert_eq!(size_of::<SortInfo>(), 16);
        assert_eq!(size_of::<DispatchIndirectArgs>(), 12);
        assert_eq!(size_of::<DrawIndirectArgs>(), 16);
    }

    #[test]
    fn counter_copies_are_copy_aligned() {
        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        for copy in RESET_COPIES.iter().chain(std::iter::once(&PROPAGATE_COPY)) {
            assert_eq!(copy.source.offset() % align, 0);
            assert_eq!(copy.destination.offset() % align, 0);
        }
        assert_eq!(CounterCopy::SIZE % align, 0);
    }

    #[test]
    fn propagate_targets_instance_count() {
        assert_eq!(PROPAGATE_COPY.source.offset(), 0);
        assert_eq!(PROPAGATE_COPY.destination.offset(), 4);
    }

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroups_for(0, 3840), 0);
        assert_eq!(workgroups_for(1, 3840), 1);
        assert_eq!(workgroups_for(3840, 3840), 1);
        assert_eq!(workgroups_for(3841, 3840), 2);
    }
}
