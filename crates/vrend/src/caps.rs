//! Capability set 2, the blob a client reads before creating anything.

use bytemuck::{Pod, Zeroable};
use serde::Serialize;

use crate::backend::BackendLimits;
use crate::format::{self, FormatDesc, FormatKind};
use crate::object::{MAX_SO_BUFFERS, MAX_VIEWPORTS};
use crate::resource::TextureLimits;

pub const CAPS_MAX_VERSION: u32 = 2;
pub const HOST_FEATURE_CHECK_VERSION: u32 = 3;

pub const CAP_SET_MIN_SAMPLES: u32 = 1 << 2;
pub const CAP_MEMORY_BARRIER: u32 = 1 << 6;
pub const CAP_COMPUTE_SHADER: u32 = 1 << 7;
pub const CAP_FB_NO_ATTACH: u32 = 1 << 8;
pub const CAP_TEXTURE_BARRIER: u32 = 1 << 12;
pub const CAP_QBO: u32 = 1 << 16;
pub const CAP_TRANSFER: u32 = 1 << 17;
pub const CAP_BIND_COMMAND_ARGS: u32 = 1 << 20;
pub const CAP_COPY_TRANSFER: u32 = 1 << 26;

/// Bits of the boolean feature word, in wire order.
mod bset {
    pub const INDEP_BLEND_ENABLE: u32 = 1 << 0;
    pub const INDEP_BLEND_FUNC: u32 = 1 << 1;
    pub const CUBE_MAP_ARRAY: u32 = 1 << 2;
    pub const CONDITIONAL_RENDER: u32 = 1 << 4;
    pub const START_INSTANCE: u32 = 1 << 5;
    pub const PRIMITIVE_RESTART: u32 = 1 << 6;
    pub const BLEND_EQ_SEP: u32 = 1 << 7;
    pub const INSTANCEID: u32 = 1 << 8;
    pub const VERTEX_ELEMENT_INSTANCE_DIVISOR: u32 = 1 << 9;
    pub const SEAMLESS_CUBE_MAP: u32 = 1 << 10;
    pub const OCCLUSION_QUERY: u32 = 1 << 11;
    pub const TEXTURE_MULTISAMPLE: u32 = 1 << 14;
    pub const FRAGMENT_COORD_CONVENTIONS: u32 = 1 << 15;
    pub const DEPTH_CLIP_DISABLE: u32 = 1 << 16;
    pub const SEAMLESS_CUBE_MAP_PER_TEXTURE: u32 = 1 << 17;
    pub const UBO: u32 = 1 << 18;
    pub const HAS_INDIRECT_DRAW: u32 = 1 << 25;
    pub const HAS_SAMPLE_SHADING: u32 = 1 << 26;
    pub const HAS_CULL: u32 = 1 << 27;
    pub const CONDITIONAL_RENDER_INVERTED: u32 = 1 << 28;
}

/// One bit per format id.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable, Serialize)]
pub struct FormatMask {
    pub bitmask: [u32; 16],
}

impl FormatMask {
    fn from_formats(formats: impl Iterator<Item = FormatDesc>) -> Self {
        let mut mask = Self::default();
        for desc in formats {
            let (word, bit) = ((desc.id / 32) as usize, desc.id % 32);
            if let Some(slot) = mask.bitmask.get_mut(word) {
                *slot |= 1 << bit;
            }
        }
        mask
    }

    pub fn contains(&self, format: u32) -> bool {
        self.bitmask
            .get((format / 32) as usize)
            .is_some_and(|word| word & (1 << (format % 32)) != 0)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable, Serialize)]
pub struct CapsV1 {
    pub max_version: u32,
    pub sampler: FormatMask,
    pub render: FormatMask,
    pub depthstencil: FormatMask,
    pub vertexbuffer: FormatMask,
    pub bset: u32,
    pub glsl_level: u32,
    pub max_texture_array_layers: u32,
    pub max_streamout_buffers: u32,
    pub max_dual_source_render_targets: u32,
    pub max_render_targets: u32,
    pub max_samples: u32,
    pub prim_mask: u32,
    pub max_tbo_size: u32,
    pub max_uniform_blocks: u32,
    pub max_viewports: u32,
    pub max_texture_gather_components: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, Serialize)]
pub struct CapsSet {
    pub v1: CapsV1,
    pub min_aliased_point_size: f32,
    pub max_aliased_point_size: f32,
    pub min_smooth_point_size: f32,
    pub max_smooth_point_size: f32,
    pub min_aliased_line_width: f32,
    pub max_aliased_line_width: f32,
    pub min_smooth_line_width: f32,
    pub max_smooth_line_width: f32,
    pub max_texture_lod_bias: f32,
    pub max_geom_output_vertices: u32,
    pub max_geom_total_output_components: u32,
    pub max_vertex_outputs: u32,
    pub max_vertex_attribs: u32,
    pub max_shader_patch_varyings: u32,
    pub min_texel_offset: i32,
    pub max_texel_offset: i32,
    pub min_texture_gather_offset: i32,
    pub max_texture_gather_offset: i32,
    pub texture_buffer_offset_alignment: u32,
    pub uniform_buffer_offset_alignment: u32,
    pub shader_buffer_offset_alignment: u32,
    pub capability_bits: u32,
    pub sample_locations: [u32; 8],
    pub max_vertex_attrib_stride: u32,
    pub max_shader_buffer_frag_compute: u32,
    pub max_shader_buffer_other_stages: u32,
    pub max_shader_image_frag_compute: u32,
    pub max_shader_image_other_stages: u32,
    pub max_image_samples: u32,
    pub max_compute_work_group_invocations: u32,
    pub max_compute_shared_memory_size: u32,
    pub max_compute_grid_size: [u32; 3],
    pub max_compute_block_size: [u32; 3],
    pub max_texture_2d_size: u32,
    pub max_texture_3d_size: u32,
    pub max_texture_cube_size: u32,
    pub max_combined_shader_buffers: u32,
    pub max_atomic_counters: [u32; 6],
    pub max_atomic_counter_buffers: [u32; 6],
    pub max_combined_atomic_counters: u32,
    pub max_combined_atomic_counter_buffers: u32,
    pub host_feature_check_version: u32,
    pub supported_readback_formats: FormatMask,
    pub scanout: FormatMask,
}

impl CapsSet {
    /// The blob as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn wire_size() -> usize {
        std::mem::size_of::<Self>()
    }
}

fn renderable(desc: &FormatDesc) -> bool {
    desc.kind == FormatKind::Color
}

fn depth_stencil(desc: &FormatDesc) -> bool {
    desc.is_depth() || desc.is_stencil()
}

fn vertex_fetchable(desc: &FormatDesc) -> bool {
    desc.kind == FormatKind::Color && !desc.srgb
}

fn scanout(desc: &FormatDesc) -> bool {
    matches!(
        desc.id,
        format::B8G8R8A8_UNORM
            | format::B8G8R8X8_UNORM
            | format::R8G8B8A8_UNORM
            | format::R8G8B8X8_UNORM
    )
}

/// Primitive types every backend can draw: points through triangle fans,
/// plus the adjacency variants.
const PRIM_MASK: u32 = 0x7f | (0xf << 10);

/// Fills capability set 2 from backend limits and the format table.
pub fn build(limits: &BackendLimits, textures: &TextureLimits) -> CapsSet {
    let formats = || format::known_formats();
    let v1 = CapsV1 {
        max_version: CAPS_MAX_VERSION,
        sampler: FormatMask::from_formats(formats()),
        render: FormatMask::from_formats(formats().filter(renderable)),
        depthstencil: FormatMask::from_formats(formats().filter(depth_stencil)),
        vertexbuffer: FormatMask::from_formats(formats().filter(vertex_fetchable)),
        bset: bset::INDEP_BLEND_ENABLE
            | bset::INDEP_BLEND_FUNC
            | bset::CUBE_MAP_ARRAY
            | bset::CONDITIONAL_RENDER
            | bset::START_INSTANCE
            | bset::PRIMITIVE_RESTART
            | bset::BLEND_EQ_SEP
            | bset::INSTANCEID
            | bset::VERTEX_ELEMENT_INSTANCE_DIVISOR
            | bset::SEAMLESS_CUBE_MAP
            | bset::OCCLUSION_QUERY
            | bset::TEXTURE_MULTISAMPLE
            | bset::FRAGMENT_COORD_CONVENTIONS
            | bset::DEPTH_CLIP_DISABLE
            | bset::SEAMLESS_CUBE_MAP_PER_TEXTURE
            | bset::UBO
            | bset::HAS_INDIRECT_DRAW
            | bset::HAS_SAMPLE_SHADING
            | bset::HAS_CULL
            | bset::CONDITIONAL_RENDER_INVERTED,
        glsl_level: 430,
        max_texture_array_layers: limits.max_texture_array_layers,
        max_streamout_buffers: MAX_SO_BUFFERS as u32,
        max_dual_source_render_targets: 1,
        max_render_targets: limits.max_render_targets,
        max_samples: limits.max_samples,
        prim_mask: PRIM_MASK,
        max_tbo_size: 1 << 27,
        max_uniform_blocks: limits.max_uniform_blocks,
        max_viewports: limits.max_viewports.min(MAX_VIEWPORTS as u32),
        max_texture_gather_components: 4,
    };

    CapsSet {
        v1,
        min_aliased_point_size: 1.0,
        max_aliased_point_size: 255.0,
        min_smooth_point_size: 1.0,
        max_smooth_point_size: 255.0,
        min_aliased_line_width: 1.0,
        max_aliased_line_width: 1.0,
        min_smooth_line_width: 1.0,
        max_smooth_line_width: 1.0,
        max_texture_lod_bias: 16.0,
        max_geom_output_vertices: 256,
        max_geom_total_output_components: 1024,
        max_vertex_outputs: 32,
        max_vertex_attribs: limits.max_vertex_attribs,
        max_shader_patch_varyings: 30,
        min_texel_offset: -8,
        max_texel_offset: 7,
        min_texture_gather_offset: -8,
        max_texture_gather_offset: 7,
        texture_buffer_offset_alignment: limits.storage_buffer_alignment,
        uniform_buffer_offset_alignment: limits.uniform_buffer_alignment,
        shader_buffer_offset_alignment: limits.storage_buffer_alignment,
        capability_bits: CAP_SET_MIN_SAMPLES
            | CAP_MEMORY_BARRIER
            | CAP_COMPUTE_SHADER
            | CAP_FB_NO_ATTACH
            | CAP_TEXTURE_BARRIER
            | CAP_QBO
            | CAP_TRANSFER
            | CAP_BIND_COMMAND_ARGS
            | CAP_COPY_TRANSFER,
        sample_locations: [0; 8],
        max_vertex_attrib_stride: 2048,
        max_shader_buffer_frag_compute: limits.max_storage_buffers,
        max_shader_buffer_other_stages: limits.max_storage_buffers,
        max_shader_image_frag_compute: limits.max_storage_textures,
        max_shader_image_other_stages: limits.max_storage_textures,
        max_image_samples: 1,
        max_compute_work_group_invocations: limits.max_compute_workgroup_invocations,
        max_compute_shared_memory_size: limits.max_compute_shared_memory,
        max_compute_grid_size: limits.max_compute_grid_size,
        max_compute_block_size: limits.max_compute_workgroup_size,
        max_texture_2d_size: limits.max_texture_2d.min(textures.max_2d),
        max_texture_3d_size: limits.max_texture_3d.min(textures.max_3d),
        max_texture_cube_size: limits.max_texture_cube.min(textures.max_cube),
        max_combined_shader_buffers: limits.max_storage_buffers,
        max_atomic_counters: [0; 6],
        max_atomic_counter_buffers: [0; 6],
        max_combined_atomic_counters: 0,
        max_combined_atomic_counter_buffers: 0,
        host_feature_check_version: HOST_FEATURE_CHECK_VERSION,
        supported_readback_formats: FormatMask::from_formats(formats().filter(renderable)),
        scanout: FormatMask::from_formats(formats().filter(scanout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_starts_with_version_two() {
        let caps = build(&BackendLimits::default(), &TextureLimits::default());
        let bytes = caps.as_bytes();
        assert_eq!(bytes.len(), CapsSet::wire_size());
        assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 2);
    }

    #[test]
    fn layout_matches_wire_sizes() {
        assert_eq!(std::mem::size_of::<CapsV1>(), 308);
        assert_eq!(std::mem::size_of::<CapsSet>(), 688);
    }

    #[test]
    fn texture_sizes_take_the_tighter_limit() {
        let textures = TextureLimits {
            max_2d: 4096,
            ..TextureLimits::default()
        };
        let caps = build(&BackendLimits::default(), &textures);
        assert_eq!(caps.max_texture_2d_size, 4096);
        assert_eq!(caps.max_texture_3d_size, 2048);
    }

    #[test]
    fn masks_follow_format_classes() {
        let caps = build(&BackendLimits::default(), &TextureLimits::default());
        assert!(caps.v1.sampler.contains(format::DXT1_RGB));
        assert!(!caps.v1.render.contains(format::DXT1_RGB));
        assert!(caps.v1.depthstencil.contains(format::Z24_UNORM_S8_UINT));
        assert!(!caps.v1.depthstencil.contains(format::R8_UNORM));
        assert!(caps.scanout.contains(format::B8G8R8X8_UNORM));
        assert!(!caps.v1.vertexbuffer.contains(format::R8G8B8A8_SRGB));
    }
}
