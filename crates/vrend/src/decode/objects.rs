//! CREATE_OBJECT, BIND_OBJECT and DESTROY_OBJECT.

use super::{bad_length, Args, Command, NewObject, Opcode};
use crate::error::{RenderError, Result};
use crate::object::{
    BlendState, BlendTarget, DepthStencilState, ObjectKind, RasterizerState, SamplerState,
    StencilState, VertexElement, VertexElements, MAX_ATTRIBS, MAX_SO_OUTPUTS,
};
use crate::shader::{ShaderChunk, ShaderType, StreamOutput, StreamOutputInfo};

const BLEND_SIZE: usize = 11;
const DSA_SIZE: usize = 5;
const RASTERIZER_SIZE: usize = 9;
const SURFACE_SIZE: usize = 5;
const SAMPLER_VIEW_SIZE: usize = 6;
const SAMPLER_STATE_SIZE: usize = 9;
const QUERY_SIZE: usize = 4;
const STREAMOUT_SIZE: usize = 4;

const MIPFILTER_NEAREST: u8 = 0;
const MIPFILTER_LINEAR: u8 = 1;
const MIPFILTER_NONE: u8 = 2;

fn object_kind(args: &Args<'_>) -> Option<ObjectKind> {
    ObjectKind::from_raw((args.header() >> 8) & 0xff)
}

fn expect_len(args: &Args<'_>, want: usize) -> Result<()> {
    if args.len() != want {
        return Err(bad_length(Opcode::CreateObject, args.len()));
    }
    Ok(())
}

pub(super) fn create(args: Args<'_>) -> Result<Command<'_>> {
    if args.len() < 1 {
        return Err(bad_length(Opcode::CreateObject, args.len()));
    }
    let handle = args.get(1);
    if handle == 0 {
        return Err(RenderError::invalid("object handle 0"));
    }
    let kind = object_kind(&args).ok_or_else(|| {
        RenderError::invalid(format!("unknown object type {}", (args.header() >> 8) & 0xff))
    })?;
    let object = match kind {
        ObjectKind::Blend => NewObject::Blend(blend(&args)?),
        ObjectKind::DepthStencil => NewObject::DepthStencil(depth_stencil(&args)?),
        ObjectKind::Rasterizer => NewObject::Rasterizer(rasterizer(&args)?),
        ObjectKind::Shader => NewObject::Shader(shader(handle, &args)?),
        ObjectKind::VertexElements => NewObject::VertexElements(vertex_elements(&args)?),
        ObjectKind::Surface => {
            expect_len(&args, SURFACE_SIZE)?;
            NewObject::Surface {
                resource: args.get(2),
                format: args.get(3),
                val0: args.get(4),
                val1: args.get(5),
            }
        }
        ObjectKind::SamplerView => {
            expect_len(&args, SAMPLER_VIEW_SIZE)?;
            NewObject::SamplerView {
                resource: args.get(2),
                format: args.get(3),
                val0: args.get(4),
                val1: args.get(5),
                swizzle: args.get(6),
            }
        }
        ObjectKind::SamplerState => NewObject::SamplerState(sampler_state(&args)?),
        ObjectKind::Query => {
            expect_len(&args, QUERY_SIZE)?;
            let type_index = args.get(2);
            NewObject::Query {
                query_type: type_index & 0xffff,
                index: (type_index >> 16) & 0xffff,
                offset: args.get(3),
                resource: args.get(4),
            }
        }
        ObjectKind::StreamoutTarget => {
            expect_len(&args, STREAMOUT_SIZE)?;
            NewObject::StreamoutTarget {
                resource: args.get(2),
                offset: args.get(3),
                size: args.get(4),
            }
        }
    };
    Ok(Command::CreateObject { handle, object })
}

pub(super) fn bind(args: Args<'_>) -> Result<Command<'_>> {
    if args.len() != 1 {
        return Err(bad_length(Opcode::BindObject, args.len()));
    }
    match object_kind(&args) {
        Some(
            kind @ (ObjectKind::Blend
            | ObjectKind::DepthStencil
            | ObjectKind::Rasterizer
            | ObjectKind::VertexElements),
        ) => Ok(Command::BindObject {
            kind,
            handle: args.get(1),
        }),
        _ => Err(RenderError::invalid(format!(
            "object type {} cannot be bound",
            (args.header() >> 8) & 0xff
        ))),
    }
}

pub(super) fn destroy(args: Args<'_>) -> Result<Command<'_>> {
    if args.len() != 1 {
        return Err(bad_length(Opcode::DestroyObject, args.len()));
    }
    Ok(Command::DestroyObject {
        handle: args.get(1),
    })
}

fn blend(args: &Args<'_>) -> Result<BlendState> {
    expect_len(args, BLEND_SIZE)?;
    let s0 = args.get(2);
    let mut state = BlendState {
        independent_blend_enable: s0 & 1 != 0,
        logicop_enable: (s0 >> 1) & 1 != 0,
        dither: (s0 >> 2) & 1 != 0,
        alpha_to_coverage: (s0 >> 3) & 1 != 0,
        alpha_to_one: (s0 >> 4) & 1 != 0,
        logicop_func: (args.get(3) & 0xf) as u8,
        ..BlendState::default()
    };
    for (i, rt) in state.rt.iter_mut().enumerate() {
        *rt = BlendTarget::from_word(args.get(4 + i));
    }
    Ok(state)
}

fn depth_stencil(args: &Args<'_>) -> Result<DepthStencilState> {
    expect_len(args, DSA_SIZE)?;
    let s0 = args.get(2);
    Ok(DepthStencilState {
        depth_enabled: s0 & 1 != 0,
        depth_writemask: (s0 >> 1) & 1 != 0,
        depth_func: ((s0 >> 2) & 0x7) as u8,
        alpha_enabled: (s0 >> 8) & 1 != 0,
        alpha_func: ((s0 >> 9) & 0x7) as u8,
        stencil: [StencilState::from_word(args.get(3)), StencilState::from_word(args.get(4))],
        alpha_ref: args.float(5),
    })
}

fn rasterizer(args: &Args<'_>) -> Result<RasterizerState> {
    expect_len(args, RASTERIZER_SIZE)?;
    let s0 = args.get(2);
    let bit = |n: u32| (s0 >> n) & 1 != 0;
    let s3 = args.get(5);
    Ok(RasterizerState {
        flatshade: bit(0),
        depth_clip: bit(1),
        clip_halfz: bit(2),
        rasterizer_discard: bit(3),
        flatshade_first: bit(4),
        light_twoside: bit(5),
        sprite_coord_mode: bit(6),
        point_quad_rasterization: bit(7),
        cull_face: ((s0 >> 8) & 0x3) as u8,
        fill_front: ((s0 >> 10) & 0x3) as u8,
        fill_back: ((s0 >> 12) & 0x3) as u8,
        scissor: bit(14),
        front_ccw: bit(15),
        clamp_vertex_color: bit(16),
        clamp_fragment_color: bit(17),
        offset_line: bit(18),
        offset_point: bit(19),
        offset_tri: bit(20),
        poly_smooth: bit(21),
        poly_stipple_enable: bit(22),
        point_smooth: bit(23),
        point_size_per_vertex: bit(24),
        multisample: bit(25),
        line_smooth: bit(26),
        line_stipple_enable: bit(27),
        line_last_pixel: bit(28),
        half_pixel_center: bit(29),
        bottom_edge_rule: bit(30),
        force_persample_interp: bit(31),
        point_size: args.float(3),
        sprite_coord_enable: args.get(4),
        line_stipple_pattern: (s3 & 0xffff) as u16,
        line_stipple_factor: ((s3 >> 16) & 0xff) as u8,
        clip_plane_enable: ((s3 >> 24) & 0xff) as u8,
        line_width: args.float(6),
        offset_units: args.float(7),
        offset_scale: args.float(8),
        offset_clamp: args.float(9),
    })
}

fn sampler_state(args: &Args<'_>) -> Result<SamplerState> {
    expect_len(args, SAMPLER_STATE_SIZE)?;
    let s0 = args.get(2);
    let state = SamplerState {
        wrap_s: (s0 & 0x7) as u8,
        wrap_t: ((s0 >> 3) & 0x7) as u8,
        wrap_r: ((s0 >> 6) & 0x7) as u8,
        min_img_filter: ((s0 >> 9) & 0x3) as u8,
        min_mip_filter: ((s0 >> 11) & 0x3) as u8,
        mag_img_filter: ((s0 >> 13) & 0x3) as u8,
        compare_mode: (s0 >> 15) & 1 != 0,
        compare_func: ((s0 >> 16) & 0x7) as u8,
        seamless_cube_map: (s0 >> 19) & 1 != 0,
        lod_bias: args.float(3),
        min_lod: args.float(4),
        max_lod: args.float(5),
        border_color: [args.get(6), args.get(7), args.get(8), args.get(9)],
    };
    if !matches!(
        state.min_mip_filter,
        MIPFILTER_NEAREST | MIPFILTER_LINEAR | MIPFILTER_NONE
    ) {
        return Err(RenderError::invalid(format!(
            "mip filter {}",
            state.min_mip_filter
        )));
    }
    Ok(state)
}

fn vertex_elements(args: &Args<'_>) -> Result<VertexElements> {
    let len = args.len();
    if len < 1 || (len - 1) % 4 != 0 {
        return Err(bad_length(Opcode::CreateObject, len));
    }
    let count = (len - 1) / 4;
    let mut elements = Vec::with_capacity(count);
    for i in 0..count {
        let base = 2 + 4 * i;
        let element = VertexElement {
            src_offset: args.get(base),
            instance_divisor: args.get(base + 1),
            vertex_buffer_index: args.get(base + 2),
            src_format: args.get(base + 3),
        };
        if element.vertex_buffer_index as usize >= MAX_ATTRIBS {
            return Err(RenderError::invalid(format!(
                "vertex buffer index {}",
                element.vertex_buffer_index
            )));
        }
        elements.push(element);
    }
    Ok(VertexElements { elements })
}

fn shader<'a>(handle: u32, args: &Args<'a>) -> Result<ShaderChunk<'a>> {
    let len = args.len();
    if len < 5 {
        return Err(bad_length(Opcode::CreateObject, len));
    }
    let raw_type = args.get(2);
    let ty = ShaderType::from_raw(raw_type)
        .ok_or_else(|| RenderError::invalid(format!("shader type {raw_type}")))?;
    let offlen = args.get(3);
    let num_tokens = args.get(4);

    let (req_local_mem, outputs) = if ty == ShaderType::Compute {
        (args.get(5), 0)
    } else {
        let outputs = args.get(5) as usize;
        if outputs > 0 && len < 5 + 4 + 2 * outputs {
            return Err(bad_length(Opcode::CreateObject, len));
        }
        if outputs > MAX_SO_OUTPUTS {
            return Err(RenderError::invalid(format!("{outputs} stream outputs")));
        }
        (0, outputs)
    };

    let mut stream_output = StreamOutputInfo::default();
    let mut payload_at = 6;
    if outputs > 0 {
        for (i, stride) in stream_output.strides.iter_mut().enumerate() {
            *stride = args.get(6 + i);
        }
        stream_output.outputs = (0..outputs)
            .map(|i| StreamOutput::from_words(args.get(10 + 2 * i), args.get(11 + 2 * i)))
            .collect();
        payload_at += 4 + 2 * outputs;
    }

    Ok(ShaderChunk {
        handle,
        ty,
        offlen,
        num_tokens,
        req_local_mem,
        stream_output,
        payload: args.bytes_from(payload_at),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{command_header, parse};
    use super::*;

    fn create_words(kind: u32, args: &[u32]) -> Vec<u32> {
        let mut out = vec![command_header(Opcode::CreateObject, kind, args.len() as u16)];
        out.extend_from_slice(args);
        out
    }

    #[test]
    fn handle_zero_and_unknown_type_rejected() {
        assert!(parse(&create_words(1, &[0; 11]), 1).is_err());
        let mut words = create_words(42, &[5, 0, 0]);
        assert!(parse(&words, 1).is_err());
        words[0] = command_header(Opcode::CreateObject, 1, 0);
        assert!(parse(&words[..1], 1).is_err());
    }

    #[test]
    fn blend_requires_exact_length() {
        let mut args = vec![7u32; 11];
        args[0] = 3;
        assert!(matches!(
            parse(&create_words(1, &args), 1).unwrap(),
            Command::CreateObject {
                handle: 3,
                object: NewObject::Blend(_)
            }
        ));
        args.pop();
        assert!(parse(&create_words(1, &args), 1).is_err());
    }

    #[test]
    fn depth_stencil_fields() {
        // depth on, writemask, func 3, alpha on with func 2
        let s0 = 1 | (1 << 1) | (3 << 2) | (1 << 8) | (2 << 9);
        let words = create_words(3, &[9, s0, 1, 0, 0.5f32.to_bits()]);
        let Command::CreateObject {
            object: NewObject::DepthStencil(dsa),
            ..
        } = parse(&words, 1).unwrap()
        else {
            panic!("expected depth/stencil state");
        };
        assert!(dsa.depth_enabled && dsa.depth_writemask && dsa.alpha_enabled);
        assert_eq!(dsa.depth_func, 3);
        assert_eq!(dsa.alpha_func, 2);
        assert!(dsa.stencil[0].enabled);
        assert!(!dsa.stencil[1].enabled);
        assert_eq!(dsa.alpha_ref, 0.5);
    }

    #[test]
    fn vertex_elements_length_and_index() {
        let ok = create_words(5, &[2, 0, 0, 1, 31]);
        let Command::CreateObject {
            object: NewObject::VertexElements(ve),
            ..
        } = parse(&ok, 1).unwrap()
        else {
            panic!("expected vertex elements");
        };
        assert_eq!(ve.elements.len(), 1);
        assert_eq!(ve.elements[0].src_format, 31);

        assert!(parse(&create_words(5, &[2, 0, 0]), 1).is_err());
        assert!(parse(&create_words(5, &[2, 0, 0, 32, 31]), 1).is_err());
    }

    #[test]
    fn sampler_state_rejects_bad_mip_filter() {
        let mut args = vec![0u32; 9];
        args[0] = 4;
        args[1] = 3 << 11;
        assert!(parse(&create_words(7, &args), 1).is_err());
        args[1] = 1 << 11;
        assert!(parse(&create_words(7, &args), 1).is_ok());
    }

    #[test]
    fn shader_payload_follows_stream_outputs() {
        let text = u32::from_le_bytes(*b"TGSI");
        // vertex shader, one stream output
        let args = [8, 0, 8, 12, 1, 16, 0, 0, 0, 0x0401, 0, text, 0];
        let buf = create_words(4, &args);
        let Command::CreateObject {
            object: NewObject::Shader(chunk),
            ..
        } = parse(&buf, 1).unwrap()
        else {
            panic!("expected shader");
        };
        assert_eq!(chunk.ty, ShaderType::Vertex);
        assert_eq!(chunk.stream_output.strides[0], 16);
        assert_eq!(chunk.stream_output.outputs.len(), 1);
        assert_eq!(chunk.stream_output.outputs[0].register_index, 1);
        assert_eq!(chunk.payload, b"TGSI\0\0\0\0");

        // compute reuses the output count word for local memory
        let args = [8, 5, 8, 12, 4096, text, 0];
        let buf = create_words(4, &args);
        let Command::CreateObject {
            object: NewObject::Shader(chunk),
            ..
        } = parse(&buf, 1).unwrap()
        else {
            panic!("expected shader");
        };
        assert_eq!(chunk.req_local_mem, 4096);
        assert!(chunk.stream_output.outputs.is_empty());
        assert_eq!(chunk.payload.len(), 8);
    }

    #[test]
    fn shader_header_too_short_for_outputs() {
        assert!(parse(&create_words(4, &[8, 0, 8, 12, 2, 0, 0]), 1).is_err());
        assert!(parse(&create_words(4, &[8, 9, 8, 12, 0]), 1).is_err());
    }

    #[test]
    fn only_state_objects_bind() {
        let words = [command_header(Opcode::BindObject, 1, 1), 4];
        assert!(matches!(
            parse(&words, 1).unwrap(),
            Command::BindObject {
                kind: ObjectKind::Blend,
                handle: 4
            }
        ));
        let words = [command_header(Opcode::BindObject, 4, 1), 4];
        assert!(parse(&words, 1).is_err());
        let words = [command_header(Opcode::DestroyObject, 0, 2), 4, 5];
        assert!(parse(&words, 1).is_err());
    }
}
