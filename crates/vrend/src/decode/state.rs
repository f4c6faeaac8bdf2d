//! State-setting, draw, query and transfer sub-commands.

use super::{
    bad_length, Args, BufferDesc, Command, CopyRegion, ImageDesc, Opcode, QueryBufferWrite,
    VertexBufferDesc,
};
use crate::context::NoAttachFramebuffer;
use crate::error::{RenderError, Result};
use crate::object::{
    BlitInfo, BlitSide, DrawInfo, GridInfo, IndirectDraw, Scissor, Viewport, MAX_ATOMIC_BUFFERS,
    MAX_ATTRIBS, MAX_COLOR_BUFS, MAX_CONSTANT_BUFFERS, MAX_SAMPLER_VIEWS, MAX_SHADER_BUFFERS, MAX_SHADER_IMAGES,
    MAX_VIEWPORTS,
};
use crate::shader::ShaderType;
use crate::transfer::{TransferBox, TransferDirection, TransferInfo};

const DRAW_VBO_SIZE: usize = 12;
const DRAW_VBO_SIZE_TESS: usize = 14;
const DRAW_VBO_SIZE_INDIRECT: usize = 20;
const INLINE_WRITE_DATA: usize = 12;
const TRANSFER3D_SIZE: usize = 13;
const COPY_TRANSFER3D_SIZE: usize = 14;
const MAX_SO_TARGETS: usize = 16;

pub(super) fn parse(opcode: Opcode, args: Args<'_>, ctx_id: u32) -> Result<Command<'_>> {
    let len = args.len();
    let exact = |want: usize| -> Result<()> {
        if len == want {
            Ok(())
        } else {
            Err(bad_length(opcode, len))
        }
    };

    let command = match opcode {
        Opcode::SetViewportState => viewports(&args)?,
        Opcode::SetFramebufferState => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            let nr_cbufs = args.get(1) as usize;
            if len != 2 + nr_cbufs {
                return Err(bad_length(opcode, len));
            }
            if nr_cbufs > MAX_COLOR_BUFS {
                return Err(RenderError::invalid(format!("{nr_cbufs} colour buffers")));
            }
            Command::SetFramebuffer {
                zsurf: args.get(2),
                cbufs: args.range(3, nr_cbufs),
            }
        }
        Opcode::SetFramebufferStateNoAttach => {
            exact(2)?;
            let size = args.get(1);
            let layers_samples = args.get(2);
            Command::SetFramebufferNoAttach(NoAttachFramebuffer {
                width: size & 0xffff,
                height: (size >> 16) & 0xffff,
                layers: layers_samples & 0xffff,
                samples: (layers_samples >> 16) & 0xff,
            })
        }
        Opcode::SetVertexBuffers => {
            if len % 3 != 0 || len / 3 > MAX_ATTRIBS {
                return Err(bad_length(opcode, len));
            }
            Command::SetVertexBuffers(
                (0..len / 3)
                    .map(|i| VertexBufferDesc {
                        stride: args.get(1 + 3 * i),
                        offset: args.get(2 + 3 * i),
                        handle: args.get(3 + 3 * i),
                    })
                    .collect(),
            )
        }
        Opcode::Clear => {
            exact(8)?;
            let depth = f64::from_bits(u64::from(args.get(6)) | (u64::from(args.get(7)) << 32));
            Command::Clear {
                buffers: args.get(1),
                color: [args.float(2), args.float(3), args.float(4), args.float(5)],
                depth,
                stencil: args.get(8),
            }
        }
        Opcode::DrawVbo => Command::DrawVbo(draw(&args)?),
        Opcode::ResourceInlineWrite => {
            if len < INLINE_WRITE_DATA {
                return Err(bad_length(opcode, len));
            }
            let info = TransferInfo {
                ctx_id: 0,
                offset: 0,
                ..transfer_common(&args)
            };
            Command::InlineWrite {
                info,
                data: args.bytes_from(INLINE_WRITE_DATA),
            }
        }
        Opcode::SetSamplerViews => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            let shader = shader_type(args.get(1))?;
            let start = args.get(2);
            let count = len - 2;
            check_slots(start, count, MAX_SAMPLER_VIEWS)?;
            Command::SetSamplerViews {
                shader,
                start,
                handles: args.range(3, count),
            }
        }
        Opcode::SetIndexBuffer => {
            if len != 1 && len != 3 {
                return Err(bad_length(opcode, len));
            }
            Command::SetIndexBuffer {
                handle: args.get(1),
                index_size: if len == 3 { args.get(2) } else { 0 },
                offset: if len == 3 { args.get(3) } else { 0 },
            }
        }
        Opcode::SetConstantBuffer => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            Command::SetConstantBuffer {
                shader: shader_type(args.get(1))?,
                values: args.range(3, len - 2),
            }
        }
        Opcode::SetUniformBuffer => {
            exact(5)?;
            let shader = shader_type(args.get(1))?;
            let index = args.get(2);
            if index as usize >= MAX_CONSTANT_BUFFERS {
                return Err(RenderError::invalid(format!("uniform buffer index {index}")));
            }
            Command::SetUniformBuffer {
                shader,
                index,
                offset: args.get(3),
                length: args.get(4),
                handle: args.get(5),
            }
        }
        Opcode::SetStencilRef => {
            exact(1)?;
            let refs = args.get(1);
            Command::SetStencilRef([(refs & 0xff) as u8, ((refs >> 8) & 0xff) as u8])
        }
        Opcode::SetBlendColor => {
            exact(4)?;
            Command::SetBlendColor([args.float(1), args.float(2), args.float(3), args.float(4)])
        }
        Opcode::SetScissorState => {
            if len < 1 || (len - 1) % 2 != 0 {
                return Err(bad_length(opcode, len));
            }
            let count = (len - 1) / 2;
            let start = args.get(1);
            check_slots(start, count, MAX_VIEWPORTS)?;
            Command::SetScissors {
                start,
                scissors: (0..count)
                    .map(|i| Scissor::from_words(args.get(2 + 2 * i), args.get(3 + 2 * i)))
                    .collect(),
            }
        }
        Opcode::Blit => {
            exact(21)?;
            Command::Blit(blit(&args))
        }
        Opcode::ResourceCopyRegion => {
            exact(13)?;
            Command::CopyRegion(CopyRegion {
                dst_handle: args.get(1),
                dst_level: args.get(2),
                dst_origin: [args.get(3), args.get(4), args.get(5)],
                src_handle: args.get(6),
                src_level: args.get(7),
                src_box: box_at(&args, 8),
            })
        }
        Opcode::BindSamplerStates => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            Command::BindSamplerStates {
                shader: shader_type(args.get(1))?,
                start: args.get(2),
                handles: args.range(3, len - 2),
            }
        }
        Opcode::BeginQuery => {
            exact(1)?;
            Command::BeginQuery(args.get(1))
        }
        Opcode::EndQuery => {
            exact(1)?;
            Command::EndQuery(args.get(1))
        }
        Opcode::GetQueryResult => {
            exact(2)?;
            Command::GetQueryResult {
                handle: args.get(1),
                wait: args.get(2) != 0,
            }
        }
        Opcode::GetQueryResultQbo => {
            exact(6)?;
            Command::GetQueryResultQbo(QueryBufferWrite {
                handle: args.get(1),
                qbo_handle: args.get(2),
                wait: args.get(3) != 0,
                result_type: args.get(4),
                offset: args.get(5),
                index: args.get(6) as i32,
            })
        }
        Opcode::SetPolygonStipple => {
            exact(32)?;
            let mut stipple = [0u32; 32];
            stipple.copy_from_slice(args.range(1, 32));
            Command::SetPolygonStipple(stipple)
        }
        Opcode::SetClipState => {
            exact(32)?;
            let mut planes = [[0f32; 4]; 8];
            for (p, plane) in planes.iter_mut().enumerate() {
                for (c, value) in plane.iter_mut().enumerate() {
                    *value = args.float(1 + 4 * p + c);
                }
            }
            Command::SetClipState(planes)
        }
        Opcode::SetSampleMask => {
            exact(1)?;
            Command::SetSampleMask(args.get(1))
        }
        Opcode::SetMinSamples => {
            exact(1)?;
            Command::SetMinSamples(args.get(1))
        }
        Opcode::SetStreamoutTargets => {
            if len < 1 || len - 1 > MAX_SO_TARGETS {
                return Err(bad_length(opcode, len));
            }
            Command::SetStreamoutTargets {
                append_bitmask: args.get(1),
                handles: args.range(2, len - 1),
            }
        }
        Opcode::SetRenderCondition => {
            exact(3)?;
            Command::SetRenderCondition {
                handle: args.get(1),
                condition: args.get(2) != 0,
                mode: args.get(3),
            }
        }
        Opcode::SetSubCtx => {
            exact(1)?;
            Command::SetSubCtx(args.get(1))
        }
        Opcode::CreateSubCtx => {
            exact(1)?;
            Command::CreateSubCtx(args.get(1))
        }
        Opcode::DestroySubCtx => {
            exact(1)?;
            Command::DestroySubCtx(args.get(1))
        }
        Opcode::BindShader => {
            exact(2)?;
            Command::BindShader {
                handle: args.get(1),
                ty: args.get(2),
            }
        }
        Opcode::SetTessState => {
            exact(6)?;
            let mut levels = [0f32; 6];
            for (i, level) in levels.iter_mut().enumerate() {
                *level = args.float(1 + i);
            }
            Command::SetTessState(levels)
        }
        Opcode::SetShaderBuffers => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            let shader = shader_type(args.get(1))?;
            let start = args.get(2);
            let count = (len - 2) / 3;
            if count > 0 {
                check_slots(start, count, MAX_SHADER_BUFFERS)?;
            }
            Command::SetShaderBuffers {
                shader,
                start,
                buffers: buffer_descs(&args, 3, count),
            }
        }
        Opcode::SetShaderImages => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            let shader = shader_type(args.get(1))?;
            let start = args.get(2);
            let count = (len - 2) / 5;
            if count > 0 {
                check_slots(start, count, MAX_SHADER_IMAGES)?;
            }
            Command::SetShaderImages {
                shader,
                start,
                images: (0..count)
                    .map(|i| {
                        let base = 3 + 5 * i;
                        ImageDesc {
                            format: args.get(base),
                            access: args.get(base + 1),
                            layer_offset: args.get(base + 2),
                            level_size: args.get(base + 3),
                            handle: args.get(base + 4),
                        }
                    })
                    .collect(),
            }
        }
        Opcode::SetAtomicBuffers => {
            if len < 2 {
                return Err(bad_length(opcode, len));
            }
            let start = args.get(1);
            let count = (len - 1) / 3;
            if count > 0 {
                check_slots(start, count, MAX_ATOMIC_BUFFERS)?;
            }
            Command::SetAtomicBuffers {
                start,
                buffers: buffer_descs(&args, 2, count),
            }
        }
        Opcode::MemoryBarrier => {
            exact(1)?;
            Command::MemoryBarrier(args.get(1))
        }
        Opcode::TextureBarrier => {
            exact(1)?;
            Command::TextureBarrier(args.get(1))
        }
        Opcode::LaunchGrid => {
            exact(8)?;
            Command::LaunchGrid(GridInfo {
                block: [args.get(1), args.get(2), args.get(3)],
                grid: [args.get(4), args.get(5), args.get(6)],
                indirect_handle: args.get(7),
                indirect_offset: args.get(8),
            })
        }
        Opcode::Transfer3d => {
            if len < TRANSFER3D_SIZE {
                return Err(bad_length(opcode, len));
            }
            let raw = args.get(13);
            let direction = TransferDirection::from_raw(raw)
                .ok_or_else(|| RenderError::invalid(format!("transfer direction {raw}")))?;
            let info = TransferInfo {
                ctx_id,
                offset: u64::from(args.get(12)),
                context0: false,
                ..transfer_common(&args)
            };
            Command::Transfer3d { info, direction }
        }
        Opcode::CopyTransfer3d => {
            exact(COPY_TRANSFER3D_SIZE)?;
            let info = TransferInfo {
                ctx_id,
                offset: u64::from(args.get(13)),
                synchronized: args.get(14) != 0,
                context0: false,
                ..transfer_common(&args)
            };
            Command::CopyTransfer3d {
                info,
                src_handle: args.get(12),
            }
        }
        Opcode::Nop
        | Opcode::CreateObject
        | Opcode::BindObject
        | Opcode::DestroyObject
        | Opcode::EndTransfers
        | Opcode::SetTweaks
        | Opcode::SetDebugFlags => {
            return Err(RenderError::invalid(format!("{opcode:?} routed to state parser")))
        }
    };
    Ok(command)
}

fn shader_type(raw: u32) -> Result<ShaderType> {
    ShaderType::from_raw(raw).ok_or_else(|| RenderError::invalid(format!("shader type {raw}")))
}

fn check_slots(start: u32, count: usize, max: usize) -> Result<()> {
    if count > max || start as usize > max - count {
        return Err(RenderError::invalid(format!(
            "slots {start}+{count} exceed {max}"
        )));
    }
    Ok(())
}

fn viewports(args: &Args<'_>) -> Result<Command<'static>> {
    let len = args.len();
    if len < 1 || (len - 1) % 6 != 0 {
        return Err(bad_length(Opcode::SetViewportState, len));
    }
    let count = (len - 1) / 6;
    let start = args.get(1);
    check_slots(start, count, MAX_VIEWPORTS)?;
    let viewports = (0..count)
        .map(|v| {
            let base = 2 + 6 * v;
            Viewport {
                scale: [args.float(base), args.float(base + 1), args.float(base + 2)],
                translate: [args.float(base + 3), args.float(base + 4), args.float(base + 5)],
            }
        })
        .collect();
    Ok(Command::SetViewports { start, viewports })
}

fn draw(args: &Args<'_>) -> Result<DrawInfo> {
    let len = args.len();
    if !matches!(len, DRAW_VBO_SIZE | DRAW_VBO_SIZE_TESS | DRAW_VBO_SIZE_INDIRECT) {
        return Err(bad_length(Opcode::DrawVbo, len));
    }
    let mut info = DrawInfo {
        start: args.get(1),
        count: args.get(2),
        mode: args.get(3),
        indexed: args.get(4) != 0,
        instance_count: args.get(5),
        index_bias: args.get(6) as i32,
        start_instance: args.get(7),
        primitive_restart: args.get(8) != 0,
        restart_index: args.get(9),
        min_index: args.get(10),
        max_index: args.get(11),
        count_from_so: args.get(12),
        ..DrawInfo::default()
    };
    if len >= DRAW_VBO_SIZE_TESS {
        info.vertices_per_patch = args.get(13);
        info.drawid = args.get(14);
    }
    if len == DRAW_VBO_SIZE_INDIRECT {
        info.indirect = Some(IndirectDraw {
            handle: args.get(15),
            offset: args.get(16),
            stride: args.get(17),
            draw_count: args.get(18),
            draw_count_offset: args.get(19),
            draw_count_handle: args.get(20),
        });
    }
    Ok(info)
}

fn box_at(args: &Args<'_>, at: usize) -> TransferBox {
    TransferBox {
        x: args.get(at) as i32,
        y: args.get(at + 1) as i32,
        z: args.get(at + 2) as i32,
        width: args.get(at + 3) as i32,
        height: args.get(at + 4) as i32,
        depth: args.get(at + 5) as i32,
    }
}

/// Handle, level, pitches and box shared by inline writes and transfers.
fn transfer_common(args: &Args<'_>) -> TransferInfo {
    TransferInfo {
        handle: args.get(1),
        level: args.get(2),
        stride: args.get(4),
        layer_stride: args.get(5),
        area: box_at(args, 6),
        ..TransferInfo::default()
    }
}

fn buffer_descs(args: &Args<'_>, first: usize, count: usize) -> Vec<BufferDesc> {
    (0..count)
        .map(|i| {
            let base = first + 3 * i;
            BufferDesc {
                offset: args.get(base),
                length: args.get(base + 1),
                handle: args.get(base + 2),
            }
        })
        .collect()
}

fn blit(args: &Args<'_>) -> BlitInfo {
    let s0 = args.get(1);
    let side = |at: usize| BlitSide {
        handle: args.get(at),
        level: args.get(at + 1),
        format: args.get(at + 2),
        area: box_at(args, at + 3),
    };
    BlitInfo {
        mask: (s0 & 0xff) as u8,
        filter: ((s0 >> 8) & 0x3) as u8,
        scissor_enable: (s0 >> 10) & 1 != 0,
        render_condition_enable: (s0 >> 11) & 1 != 0,
        alpha_blend: (s0 >> 12) & 1 != 0,
        scissor: Scissor::from_words(args.get(2), args.get(3)),
        dst: side(4),
        src: side(13),
    }
}
