//! Command-buffer decoding.
//!
//! A batch is a sequence of sub-commands, each a header word followed by
//! `len` argument words. The header packs the opcode in bits 0..8, an object
//! type in bits 8..16 and `len` in bits 16..32. Sub-commands are parsed into a
//! borrowed [`Command`] and applied one at a time, so a failure part way
//! through leaves everything before it in effect.

mod objects;
mod state;

use crate::context::NoAttachFramebuffer;
use crate::error::{RenderError, Result};
use crate::object::{
    BlendState, BlitInfo, DepthStencilState, DrawInfo, GridInfo, ObjectKind, RasterizerState,
    SamplerState, Scissor, VertexElements, Viewport,
};
use crate::renderer::Renderer;
use crate::shader::{ShaderChunk, ShaderType};
use crate::transfer::{TransferBox, TransferDirection, TransferInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    CreateObject,
    BindObject,
    DestroyObject,
    SetViewportState,
    SetFramebufferState,
    SetVertexBuffers,
    Clear,
    DrawVbo,
    ResourceInlineWrite,
    SetSamplerViews,
    SetIndexBuffer,
    SetConstantBuffer,
    SetStencilRef,
    SetBlendColor,
    SetScissorState,
    Blit,
    ResourceCopyRegion,
    BindSamplerStates,
    BeginQuery,
    EndQuery,
    GetQueryResult,
    SetPolygonStipple,
    SetClipState,
    SetSampleMask,
    SetStreamoutTargets,
    SetRenderCondition,
    SetUniformBuffer,
    SetSubCtx,
    CreateSubCtx,
    DestroySubCtx,
    BindShader,
    SetTessState,
    SetMinSamples,
    SetShaderBuffers,
    SetShaderImages,
    MemoryBarrier,
    LaunchGrid,
    SetFramebufferStateNoAttach,
    TextureBarrier,
    SetAtomicBuffers,
    SetDebugFlags,
    GetQueryResultQbo,
    Transfer3d,
    EndTransfers,
    CopyTransfer3d,
    SetTweaks,
}

impl Opcode {
    const ALL: [Opcode; 47] = [
        Opcode::Nop,
        Opcode::CreateObject,
        Opcode::BindObject,
        Opcode::DestroyObject,
        Opcode::SetViewportState,
        Opcode::SetFramebufferState,
        Opcode::SetVertexBuffers,
        Opcode::Clear,
        Opcode::DrawVbo,
        Opcode::ResourceInlineWrite,
        Opcode::SetSamplerViews,
        Opcode::SetIndexBuffer,
        Opcode::SetConstantBuffer,
        Opcode::SetStencilRef,
        Opcode::SetBlendColor,
        Opcode::SetScissorState,
        Opcode::Blit,
        Opcode::ResourceCopyRegion,
        Opcode::BindSamplerStates,
        Opcode::BeginQuery,
        Opcode::EndQuery,
        Opcode::GetQueryResult,
        Opcode::SetPolygonStipple,
        Opcode::SetClipState,
        Opcode::SetSampleMask,
        Opcode::SetStreamoutTargets,
        Opcode::SetRenderCondition,
        Opcode::SetUniformBuffer,
        Opcode::SetSubCtx,
        Opcode::CreateSubCtx,
        Opcode::DestroySubCtx,
        Opcode::BindShader,
        Opcode::SetTessState,
        Opcode::SetMinSamples,
        Opcode::SetShaderBuffers,
        Opcode::SetShaderImages,
        Opcode::MemoryBarrier,
        Opcode::LaunchGrid,
        Opcode::SetFramebufferStateNoAttach,
        Opcode::TextureBarrier,
        Opcode::SetAtomicBuffers,
        Opcode::SetDebugFlags,
        Opcode::GetQueryResultQbo,
        Opcode::Transfer3d,
        Opcode::EndTransfers,
        Opcode::CopyTransfer3d,
        Opcode::SetTweaks,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn raw(self) -> u32 {
        self as u32
    }
}

/// Builds a sub-command header word.
pub fn command_header(opcode: Opcode, object_type: u32, len: u16) -> u32 {
    opcode.raw() | ((object_type & 0xff) << 8) | ((len as u32) << 16)
}

/// Argument words of one sub-command, indexed the way the wire numbers them:
/// index 0 is the header, 1 the first argument.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Args<'a> {
    words: &'a [u32],
}

impl<'a> Args<'a> {
    pub(crate) fn new(words: &'a [u32]) -> Self {
        Self { words }
    }

    /// Declared argument count.
    pub(crate) fn len(&self) -> usize {
        self.words.len().saturating_sub(1)
    }

    pub(crate) fn header(&self) -> u32 {
        self.get(0)
    }

    pub(crate) fn get(&self, index: usize) -> u32 {
        self.words.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn float(&self, index: usize) -> f32 {
        f32::from_bits(self.get(index))
    }

    /// Words from `index` to the end of the sub-command.
    pub(crate) fn tail(&self, index: usize) -> &'a [u32] {
        self.words.get(index..).unwrap_or(&[])
    }

    pub(crate) fn range(&self, index: usize, count: usize) -> &'a [u32] {
        self.words.get(index..index + count).unwrap_or(&[])
    }

    pub(crate) fn bytes_from(&self, index: usize) -> &'a [u8] {
        bytemuck::cast_slice(self.tail(index))
    }
}

pub(crate) fn bad_length(opcode: Opcode, len: usize) -> RenderError {
    RenderError::invalid(format!("{opcode:?} with {len} argument words"))
}

/// Object payload of CREATE_OBJECT.
#[derive(Debug, Clone)]
pub enum NewObject<'a> {
    Blend(BlendState),
    DepthStencil(DepthStencilState),
    Rasterizer(RasterizerState),
    Shader(ShaderChunk<'a>),
    VertexElements(VertexElements),
    SamplerView {
        resource: u32,
        format: u32,
        val0: u32,
        val1: u32,
        swizzle: u32,
    },
    SamplerState(SamplerState),
    Surface {
        resource: u32,
        format: u32,
        val0: u32,
        val1: u32,
    },
    Query {
        query_type: u32,
        index: u32,
        offset: u32,
        resource: u32,
    },
    StreamoutTarget {
        resource: u32,
        offset: u32,
        size: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferDesc {
    pub stride: u32,
    pub offset: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub offset: u32,
    pub length: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: u32,
    pub access: u32,
    pub layer_offset: u32,
    pub level_size: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub dst_handle: u32,
    pub dst_level: u32,
    pub dst_origin: [u32; 3],
    pub src_handle: u32,
    pub src_level: u32,
    pub src_box: TransferBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBufferWrite {
    pub handle: u32,
    pub qbo_handle: u32,
    pub wait: bool,
    pub result_type: u32,
    pub offset: u32,
    pub index: i32,
}

/// A decoded sub-command. Handle lists borrow the batch.
#[derive(Debug, Clone)]
pub enum Command<'a> {
    Nop,
    CreateObject { handle: u32, object: NewObject<'a> },
    BindObject { kind: ObjectKind, handle: u32 },
    DestroyObject { handle: u32 },
    SetViewports { start: u32, viewports: Vec<Viewport> },
    SetFramebuffer { zsurf: u32, cbufs: &'a [u32] },
    SetFramebufferNoAttach(NoAttachFramebuffer),
    SetVertexBuffers(Vec<VertexBufferDesc>),
    Clear {
        buffers: u32,
        color: [f32; 4],
        depth: f64,
        stencil: u32,
    },
    DrawVbo(DrawInfo),
    InlineWrite { info: TransferInfo, data: &'a [u8] },
    SetSamplerViews {
        shader: ShaderType,
        start: u32,
        handles: &'a [u32],
    },
    SetIndexBuffer {
        handle: u32,
        index_size: u32,
        offset: u32,
    },
    SetConstantBuffer { shader: ShaderType, values: &'a [u32] },
    SetStencilRef([u8; 2]),
    SetBlendColor([f32; 4]),
    SetScissors { start: u32, scissors: Vec<Scissor> },
    Blit(BlitInfo),
    CopyRegion(CopyRegion),
    BindSamplerStates {
        shader: ShaderType,
        start: u32,
        handles: &'a [u32],
    },
    BeginQuery(u32),
    EndQuery(u32),
    GetQueryResult { handle: u32, wait: bool },
    GetQueryResultQbo(QueryBufferWrite),
    SetPolygonStipple([u32; 32]),
    SetClipState([[f32; 4]; 8]),
    SetSampleMask(u32),
    SetMinSamples(u32),
    SetStreamoutTargets { append_bitmask: u32, handles: &'a [u32] },
    SetRenderCondition { handle: u32, condition: bool, mode: u32 },
    SetUniformBuffer {
        shader: ShaderType,
        index: u32,
        offset: u32,
        length: u32,
        handle: u32,
    },
    SetSubCtx(u32),
    CreateSubCtx(u32),
    DestroySubCtx(u32),
    /// `ty` stays raw; out-of-range stages are ignored when applied.
    BindShader { handle: u32, ty: u32 },
    SetTessState([f32; 6]),
    SetShaderBuffers {
        shader: ShaderType,
        start: u32,
        buffers: Vec<BufferDesc>,
    },
    SetShaderImages {
        shader: ShaderType,
        start: u32,
        images: Vec<ImageDesc>,
    },
    SetAtomicBuffers { start: u32, buffers: Vec<BufferDesc> },
    MemoryBarrier(u32),
    LaunchGrid(GridInfo),
    TextureBarrier(u32),
    Transfer3d {
        info: TransferInfo,
        direction: TransferDirection,
    },
    CopyTransfer3d { info: TransferInfo, src_handle: u32 },
    /// Accepted and dropped: END_TRANSFERS, SET_TWEAKS, SET_DEBUG_FLAGS.
    Ignored(Opcode),
}

/// Parses one sub-command. `words` covers the header and exactly `len`
/// argument words. `ctx_id` is the submitting context.
pub fn parse(words: &[u32], ctx_id: u32) -> Result<Command<'_>> {
    let args = Args::new(words);
    let raw = args.header() & 0xff;
    let opcode = Opcode::from_raw(raw)
        .ok_or_else(|| RenderError::invalid(format!("unknown sub-command {raw}")))?;
    match opcode {
        Opcode::Nop => Ok(Command::Nop),
        Opcode::CreateObject => objects::create(args),
        Opcode::BindObject => objects::bind(args),
        Opcode::DestroyObject => objects::destroy(args),
        Opcode::EndTransfers | Opcode::SetTweaks | Opcode::SetDebugFlags => {
            Ok(Command::Ignored(opcode))
        }
        _ => state::parse(opcode, args, ctx_id),
    }
}

/// Decodes and applies a command batch for `ctx_id`.
///
/// Returns `Err` when the context cannot be made current or a sub-command
/// fails in a way that stops the batch, including a header that claims more
/// words than remain. Sub-commands before the failing one stay applied.
pub fn decode_block(renderer: &mut Renderer, ctx_id: u32, words: &[u32]) -> Result<()> {
    renderer.switch_context(ctx_id)?;

    let total = words.len();
    let mut offset = 0;
    while offset < total {
        let header = words[offset];
        let len = (header >> 16) as usize;
        if offset + len + 1 > total {
            tracing::warn!(ctx_id, offset, len, total, "sub-command overruns batch");
            return Err(RenderError::invalid(format!(
                "sub-command at word {offset} overruns batch of {total} words"
            )));
        }
        let sub = &words[offset..offset + len + 1];
        let result = parse(sub, ctx_id).and_then(|command| renderer.apply(ctx_id, command));
        if let Err(err) = result {
            if err.aborts_batch() {
                tracing::warn!(ctx_id, opcode = header & 0xff, %err, "sub-command failed, batch aborted");
                return Err(err);
            }
            tracing::error!(ctx_id, opcode = header & 0xff, %err, "sub-command failed");
        }
        offset += len + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(opcode: Opcode, object: u32, args: &[u32]) -> Vec<u32> {
        let mut out = vec![command_header(opcode, object, args.len() as u16)];
        out.extend_from_slice(args);
        out
    }

    #[test]
    fn opcodes_cover_the_wire_range() {
        assert_eq!(Opcode::from_raw(0), Some(Opcode::Nop));
        assert_eq!(Opcode::from_raw(8), Some(Opcode::DrawVbo));
        assert_eq!(Opcode::from_raw(43), Some(Opcode::Transfer3d));
        assert_eq!(Opcode::from_raw(46), Some(Opcode::SetTweaks));
        assert_eq!(Opcode::from_raw(47), None);
        for (raw, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.raw(), raw as u32);
        }
    }

    #[test]
    fn header_packs_fields() {
        let header = command_header(Opcode::CreateObject, 4, 9);
        assert_eq!(header & 0xff, 1);
        assert_eq!((header >> 8) & 0xff, 4);
        assert_eq!(header >> 16, 9);
    }

    #[test]
    fn unknown_opcode_is_invalid() {
        let err = parse(&[200], 1).unwrap_err();
        assert!(err.aborts_batch());
    }

    #[test]
    fn args_read_zero_past_the_end() {
        let w = [0u32, 7, 8];
        let args = Args::new(&w);
        assert_eq!(args.len(), 2);
        assert_eq!(args.get(2), 8);
        assert_eq!(args.get(3), 0);
        assert!(args.tail(5).is_empty());
        assert_eq!(args.range(1, 2), &[7, 8]);
    }

    #[test]
    fn accepted_no_ops() {
        assert!(matches!(
            parse(&words(Opcode::SetTweaks, 0, &[1, 2]), 1).unwrap(),
            Command::Ignored(Opcode::SetTweaks)
        ));
        assert!(matches!(
            parse(&words(Opcode::EndTransfers, 0, &[]), 1).unwrap(),
            Command::Ignored(Opcode::EndTransfers)
        ));
        assert!(matches!(parse(&words(Opcode::Nop, 0, &[]), 1).unwrap(), Command::Nop));
    }
}
