//! Typed per-context objects and the decoded state they carry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::backend::{NativeQuery, QueryKind};
use crate::registry::{ReleaseQueue, ResourceRef};
use crate::shader::Shader;
use crate::transfer::TransferBox;

pub const PIPE_SHADER_TYPES: usize = 6;
pub const MAX_COLOR_BUFS: usize = 8;
pub const MAX_ATTRIBS: usize = 32;
pub const MAX_SAMPLER_VIEWS: usize = 32;
pub const MAX_SAMPLERS: usize = 32;
pub const MAX_CONSTANT_BUFFERS: usize = 32;
pub const MAX_SHADER_BUFFERS: usize = 32;
pub const MAX_SHADER_IMAGES: usize = 32;
pub const MAX_ATOMIC_BUFFERS: usize = 32;
pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_SO_BUFFERS: usize = 4;
pub const MAX_SO_OUTPUTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blend,
    Rasterizer,
    DepthStencil,
    Shader,
    VertexElements,
    SamplerView,
    SamplerState,
    Surface,
    Query,
    StreamoutTarget,
}

impl ObjectKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => ObjectKind::Blend,
            2 => ObjectKind::Rasterizer,
            3 => ObjectKind::DepthStencil,
            4 => ObjectKind::Shader,
            5 => ObjectKind::VertexElements,
            6 => ObjectKind::SamplerView,
            7 => ObjectKind::SamplerState,
            8 => ObjectKind::Surface,
            9 => ObjectKind::Query,
            10 => ObjectKind::StreamoutTarget,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlendTarget {
    pub blend_enable: bool,
    pub rgb_func: u8,
    pub rgb_src_factor: u8,
    pub rgb_dst_factor: u8,
    pub alpha_func: u8,
    pub alpha_src_factor: u8,
    pub alpha_dst_factor: u8,
    pub colormask: u8,
}

impl BlendTarget {
    pub fn from_word(word: u32) -> Self {
        Self {
            blend_enable: word & 1 != 0,
            rgb_func: ((word >> 1) & 0x7) as u8,
            rgb_src_factor: ((word >> 4) & 0x1f) as u8,
            rgb_dst_factor: ((word >> 9) & 0x1f) as u8,
            alpha_func: ((word >> 14) & 0x7) as u8,
            alpha_src_factor: ((word >> 17) & 0x1f) as u8,
            alpha_dst_factor: ((word >> 22) & 0x1f) as u8,
            colormask: ((word >> 27) & 0xf) as u8,
        }
    }
}

pub const BLENDFACTOR_ONE: u8 = 0x01;
pub const BLENDFACTOR_DST_ALPHA: u8 = 0x04;
pub const BLENDFACTOR_ZERO: u8 = 0x11;
pub const BLENDFACTOR_INV_DST_ALPHA: u8 = 0x14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlendState {
    pub independent_blend_enable: bool,
    pub logicop_enable: bool,
    pub dither: bool,
    pub alpha_to_coverage: bool,
    pub alpha_to_one: bool,
    pub logicop_func: u8,
    pub rt: [BlendTarget; MAX_COLOR_BUFS],
}

impl BlendState {
    /// Copy of the state with destination-alpha factors replaced for a render
    /// target that has no alpha channel.
    pub fn without_dst_alpha(&self, target: usize) -> Self {
        fn patch(factor: u8) -> u8 {
            match factor {
                BLENDFACTOR_DST_ALPHA => BLENDFACTOR_ONE,
                BLENDFACTOR_INV_DST_ALPHA => BLENDFACTOR_ZERO,
                other => other,
            }
        }
        let mut patched = *self;
        if let Some(rt) = patched.rt.get_mut(target) {
            rt.rgb_src_factor = patch(rt.rgb_src_factor);
            rt.rgb_dst_factor = patch(rt.rgb_dst_factor);
            rt.alpha_src_factor = patch(rt.alpha_src_factor);
            rt.alpha_dst_factor = patch(rt.alpha_dst_factor);
        }
        patched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StencilState {
    pub enabled: bool,
    pub func: u8,
    pub fail_op: u8,
    pub zpass_op: u8,
    pub zfail_op: u8,
    pub valuemask: u8,
    pub writemask: u8,
}

impl StencilState {
    pub fn from_word(word: u32) -> Self {
        Self {
            enabled: word & 1 != 0,
            func: ((word >> 1) & 0x7) as u8,
            fail_op: ((word >> 4) & 0x7) as u8,
            zpass_op: ((word >> 7) & 0x7) as u8,
            zfail_op: ((word >> 10) & 0x7) as u8,
            valuemask: ((word >> 13) & 0xff) as u8,
            writemask: ((word >> 21) & 0xff) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthStencilState {
    pub depth_enabled: bool,
    pub depth_writemask: bool,
    pub depth_func: u8,
    pub stencil: [StencilState; 2],
    pub alpha_enabled: bool,
    pub alpha_func: u8,
    pub alpha_ref: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterizerState {
    pub flatshade: bool,
    pub depth_clip: bool,
    pub clip_halfz: bool,
    pub rasterizer_discard: bool,
    pub flatshade_first: bool,
    pub light_twoside: bool,
    pub sprite_coord_mode: bool,
    pub point_quad_rasterization: bool,
    pub cull_face: u8,
    pub fill_front: u8,
    pub fill_back: u8,
    pub scissor: bool,
    pub front_ccw: bool,
    pub clamp_vertex_color: bool,
    pub clamp_fragment_color: bool,
    pub offset_line: bool,
    pub offset_point: bool,
    pub offset_tri: bool,
    pub poly_smooth: bool,
    pub poly_stipple_enable: bool,
    pub point_smooth: bool,
    pub point_size_per_vertex: bool,
    pub multisample: bool,
    pub line_smooth: bool,
    pub line_stipple_enable: bool,
    pub line_last_pixel: bool,
    pub half_pixel_center: bool,
    pub bottom_edge_rule: bool,
    pub force_persample_interp: bool,
    pub point_size: f32,
    pub sprite_coord_enable: u32,
    pub line_stipple_pattern: u16,
    pub line_stipple_factor: u8,
    pub clip_plane_enable: u8,
    pub line_width: f32,
    pub offset_units: f32,
    pub offset_scale: f32,
    pub offset_clamp: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplerState {
    pub wrap_s: u8,
    pub wrap_t: u8,
    pub wrap_r: u8,
    pub min_img_filter: u8,
    pub min_mip_filter: u8,
    pub mag_img_filter: u8,
    pub compare_mode: bool,
    pub compare_func: u8,
    pub seamless_cube_map: bool,
    pub lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: [u32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexElement {
    pub src_offset: u32,
    pub instance_divisor: u32,
    pub vertex_buffer_index: u32,
    pub src_format: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VertexElements {
    pub elements: Vec<VertexElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scale: [f32; 3],
    pub translate: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scissor {
    pub minx: u16,
    pub miny: u16,
    pub maxx: u16,
    pub maxy: u16,
}

impl Scissor {
    pub fn from_words(min: u32, max: u32) -> Self {
        Self {
            minx: (min & 0xffff) as u16,
            miny: (min >> 16) as u16,
            maxx: (max & 0xffff) as u16,
            maxy: (max >> 16) as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawInfo {
    pub start: u32,
    pub count: u32,
    pub mode: u32,
    pub indexed: bool,
    pub instance_count: u32,
    pub index_bias: i32,
    pub start_instance: u32,
    pub primitive_restart: bool,
    pub restart_index: u32,
    pub min_index: u32,
    pub max_index: u32,
    pub count_from_so: u32,
    pub vertices_per_patch: u32,
    pub drawid: u32,
    pub indirect: Option<IndirectDraw>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndirectDraw {
    pub handle: u32,
    pub offset: u32,
    pub stride: u32,
    pub draw_count: u32,
    pub draw_count_offset: u32,
    pub draw_count_handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GridInfo {
    pub block: [u32; 3],
    pub grid: [u32; 3],
    pub indirect_handle: u32,
    pub indirect_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlitSide {
    pub handle: u32,
    pub level: u32,
    pub format: u32,
    pub area: TransferBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlitInfo {
    pub mask: u8,
    pub filter: u8,
    pub scissor_enable: bool,
    pub render_condition_enable: bool,
    pub alpha_blend: bool,
    pub scissor: Scissor,
    pub dst: BlitSide,
    pub src: BlitSide,
}

/// A view of one resource level/layer range used as a render target.
#[derive(Debug)]
pub struct Surface {
    pub resource: ResourceRef,
    pub format: u32,
    pub val0: u32,
    pub val1: u32,
}

impl Surface {
    pub fn level(&self) -> u32 {
        self.val0
    }

    pub fn first_layer(&self) -> u32 {
        self.val1 & 0xffff
    }

    pub fn last_layer(&self) -> u32 {
        (self.val1 >> 16) & 0xffff
    }
}

#[derive(Debug)]
pub struct SamplerView {
    pub resource: ResourceRef,
    pub format: u32,
    pub target: u32,
    pub val0: u32,
    pub val1: u32,
    pub swizzle: [u8; 4],
}

/// A query and the host-memory resource its result is written to.
#[derive(Debug)]
pub struct Query {
    pub kind: QueryKind,
    pub index: u32,
    pub resource: ResourceRef,
    pub native: NativeQuery,
    /// Occlusion counters are answered by a predicate and scaled.
    pub fake_samples_passed: bool,
    pub active: Cell<bool>,
    release: ReleaseQueue,
}

impl Query {
    pub fn new(
        kind: QueryKind,
        index: u32,
        resource: ResourceRef,
        native: NativeQuery,
        fake_samples_passed: bool,
        release: ReleaseQueue,
    ) -> Self {
        Self {
            kind,
            index,
            resource,
            native,
            fake_samples_passed,
            active: Cell::new(false),
            release,
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.release.push_query(self.native);
    }
}

#[derive(Debug)]
pub struct StreamoutTarget {
    pub resource: ResourceRef,
    pub offset: u32,
    pub size: u32,
}

/// An entry of a context's object table.
#[derive(Debug, Clone)]
pub enum Object {
    Blend(Rc<BlendState>),
    Rasterizer(Rc<RasterizerState>),
    DepthStencil(Rc<DepthStencilState>),
    Shader(Rc<RefCell<Shader>>),
    VertexElements(Rc<VertexElements>),
    SamplerView(Rc<SamplerView>),
    SamplerState(Rc<SamplerState>),
    Surface(Rc<Surface>),
    Query(Rc<Query>),
    StreamoutTarget(Rc<StreamoutTarget>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blend(_) => ObjectKind::Blend,
            Object::Rasterizer(_) => ObjectKind::Rasterizer,
            Object::DepthStencil(_) => ObjectKind::DepthStencil,
            Object::Shader(_) => ObjectKind::Shader,
            Object::VertexElements(_) => ObjectKind::VertexElements,
            Object::SamplerView(_) => ObjectKind::SamplerView,
            Object::SamplerState(_) => ObjectKind::SamplerState,
            Object::Surface(_) => ObjectKind::Surface,
            Object::Query(_) => ObjectKind::Query,
            Object::StreamoutTarget(_) => ObjectKind::StreamoutTarget,
        }
    }
}
