//! Seam between the renderer core and a graphics API.
//!
//! The core owns every handle table and all validation. A [`Backend`] only sees
//! native ids and already-checked arguments.

use serde::Serialize;

use crate::error::Result;
use crate::format::FormatDesc;
use crate::object::{
    BlendState, BlitInfo, DepthStencilState, DrawInfo, GridInfo, RasterizerState, Scissor,
    Viewport,
};
use crate::resource::Target;
use crate::transfer::TransferBox;

macro_rules! native_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

native_id!(
    /// A graphics-API context a sub-context renders through.
    NativeContext,
    /// Buffer or texture storage owned by the backend.
    NativeStorage,
    NativeFence,
    NativeQuery,
);

/// How an API buffer will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    Index,
    StreamOutput,
    Vertex,
    Uniform,
    Indirect,
    Storage,
    Texel,
}

/// Everything a backend needs to allocate storage for a resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageDesc {
    pub handle: u32,
    pub target: Target,
    pub format: FormatDesc,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub samples: u32,
    /// Set for API buffers, `None` for textures.
    pub buffer: Option<BufferKind>,
}

impl StorageDesc {
    pub fn is_buffer(&self) -> bool {
        self.buffer.is_some()
    }
}

/// One mip level region of a texture. `z` is a depth slice for 3D targets and
/// a layer otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub level: u32,
    pub origin: [u32; 3],
    pub extent: [u32; 3],
}

impl TextureRegion {
    pub fn from_box(level: u32, bx: &TransferBox) -> Self {
        Self {
            level,
            origin: [bx.x as u32, bx.y as u32, bx.z as u32],
            extent: [bx.width as u32, bx.height as u32, bx.depth as u32],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Answers whether any sample passed.
    Predicate,
    PredicateConservative,
    TimestampDisjoint,
    PrimitivesGenerated,
    PrimitivesEmitted,
    StreamoutStatistics,
}

/// A colour or depth attachment resolved to native storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceTarget {
    pub storage: NativeStorage,
    pub format: u32,
    pub level: u32,
    pub first_layer: u32,
    pub last_layer: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferTargets {
    pub colors: Vec<Option<SurfaceTarget>>,
    pub depth: Option<SurfaceTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub storage: NativeStorage,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub storage: NativeStorage,
    pub stride: u32,
    pub offset: u32,
}

/// Pipeline state materialized right before a draw, clear or dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Blend(BlendState),
    DepthStencil(DepthStencilState),
    Rasterizer(RasterizerState),
    Viewports { start: u32, viewports: Vec<Viewport> },
    Scissors { start: u32, scissors: Vec<Scissor> },
    StencilRef([u8; 2]),
    BlendColor([f32; 4]),
    VertexBuffers(Vec<Option<VertexBufferBinding>>),
    IndexBuffer { binding: Option<BufferBinding>, index_size: u32 },
    SamplerViews { shader: u32, count: u32 },
    ShaderBuffers { shader: u32, bindings: Vec<Option<BufferBinding>> },
    ConstantBuffers { shader: u32, bindings: Vec<Option<BufferBinding>> },
}

/// A rendering command after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    State(StateUpdate),
    Clear {
        targets: FramebufferTargets,
        buffers: u32,
        color: [f32; 4],
        depth: f64,
        stencil: u32,
    },
    Draw {
        targets: FramebufferTargets,
        info: DrawInfo,
        indirect: Option<BufferBinding>,
    },
    LaunchGrid {
        info: GridInfo,
        indirect: Option<BufferBinding>,
    },
    CopyRegion {
        src: NativeStorage,
        src_level: u32,
        src_box: TransferBox,
        dst: NativeStorage,
        dst_level: u32,
        dst_origin: [u32; 3],
        buffer: bool,
    },
    Blit {
        src: NativeStorage,
        dst: NativeStorage,
        info: BlitInfo,
    },
    BeginQuery(NativeQuery),
    EndQuery(NativeQuery),
    MemoryBarrier(u32),
    TextureBarrier(u32),
    RenderCondition {
        query: Option<NativeQuery>,
        condition: bool,
        mode: u32,
    },
}

/// Limits a backend reports for capability negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendLimits {
    pub max_texture_2d: u32,
    pub max_texture_3d: u32,
    pub max_texture_cube: u32,
    pub max_texture_array_layers: u32,
    pub max_render_targets: u32,
    pub max_samples: u32,
    pub max_vertex_attribs: u32,
    pub max_uniform_blocks: u32,
    pub max_viewports: u32,
    pub max_compute_workgroup_invocations: u32,
    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_grid_size: [u32; 3],
    pub max_compute_shared_memory: u32,
    pub max_storage_buffers: u32,
    pub max_storage_textures: u32,
    pub uniform_buffer_alignment: u32,
    pub storage_buffer_alignment: u32,
}

impl Default for BackendLimits {
    fn default() -> Self {
        Self {
            max_texture_2d: 16384,
            max_texture_3d: 2048,
            max_texture_cube: 16384,
            max_texture_array_layers: 2048,
            max_render_targets: 8,
            max_samples: 4,
            max_vertex_attribs: 16,
            max_uniform_blocks: 12,
            max_viewports: 16,
            max_compute_workgroup_invocations: 256,
            max_compute_workgroup_size: [256, 256, 64],
            max_compute_grid_size: [65535, 65535, 65535],
            max_compute_shared_memory: 16384,
            max_storage_buffers: 8,
            max_storage_textures: 4,
            uniform_buffer_alignment: 256,
            storage_buffer_alignment: 256,
        }
    }
}

/// A graphics API the renderer drives.
///
/// All methods run on the connection thread. Failures are reported as
/// [`RenderError::Driver`](crate::RenderError::Driver) and never retried.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn limits(&self) -> BackendLimits;

    fn create_context(&mut self, ctx_id: u32, sub_ctx_id: u32) -> Result<NativeContext>;

    fn destroy_context(&mut self, context: NativeContext);

    fn make_current(&mut self, context: NativeContext) -> Result<()>;

    fn create_storage(&mut self, desc: &StorageDesc) -> Result<NativeStorage>;

    fn release_storage(&mut self, storage: NativeStorage);

    fn write_buffer(&mut self, storage: NativeStorage, offset: u64, data: &[u8]) -> Result<()>;

    fn read_buffer(&mut self, storage: NativeStorage, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Uploads tightly packed rows into `region`.
    fn write_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        data: &[u8],
    ) -> Result<()>;

    /// Reads `region` back as tightly packed rows.
    fn read_texture(
        &mut self,
        storage: NativeStorage,
        region: &TextureRegion,
        out: &mut [u8],
    ) -> Result<()>;

    /// Fence covering all work submitted so far.
    fn create_fence(&mut self) -> Result<NativeFence>;

    fn fence_signaled(&mut self, fence: NativeFence) -> bool;

    fn release_fence(&mut self, fence: NativeFence);

    fn create_query(&mut self, kind: QueryKind) -> Result<NativeQuery>;

    /// Result of a finished query, `None` while it is still pending.
    fn query_result(&mut self, query: NativeQuery, wait: bool) -> Result<Option<u64>>;

    fn release_query(&mut self, query: NativeQuery);

    fn execute(&mut self, call: NativeCall) -> Result<()>;
}
