//! Shader objects and chunked shader upload.
//!
//! A shader whose text does not fit in one sub-command arrives in pieces. The
//! first piece declares the total length; continuations carry the byte offset
//! they resume at with [`SHADER_OFFSET_CONT`] set. Only one shader per stage can
//! be in flight in a sub-context at a time.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{RenderError, Result};
use crate::object::{Object, ObjectKind, PIPE_SHADER_TYPES};
use crate::registry::ObjectTable;

pub const SHADER_OFFSET_CONT: u32 = 1 << 31;

/// Largest shader text a first chunk may announce.
pub const MAX_SHADER_TEXT: usize = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Fragment,
    Geometry,
    TessCtrl,
    TessEval,
    Compute,
}

impl ShaderType {
    pub const ALL: [ShaderType; PIPE_SHADER_TYPES] = [
        ShaderType::Vertex,
        ShaderType::Fragment,
        ShaderType::Geometry,
        ShaderType::TessCtrl,
        ShaderType::TessEval,
        ShaderType::Compute,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOutput {
    pub register_index: u8,
    pub start_component: u8,
    pub num_components: u8,
    pub output_buffer: u8,
    pub dst_offset: u16,
    pub stream: u8,
}

impl StreamOutput {
    pub fn from_words(output: u32, stream: u32) -> Self {
        Self {
            register_index: (output & 0xff) as u8,
            start_component: ((output >> 8) & 0x3) as u8,
            num_components: ((output >> 10) & 0x7) as u8,
            output_buffer: ((output >> 13) & 0x7) as u8,
            dst_offset: (output >> 16) as u16,
            stream: (stream & 0x3) as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamOutputInfo {
    pub strides: [u32; 4],
    pub outputs: Vec<StreamOutput>,
}

/// Upload state of a shader's text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShaderSource {
    #[default]
    Empty,
    Accumulating { buffer: Vec<u8>, offset: usize },
    Complete(Vec<u8>),
}

#[derive(Debug)]
pub struct Shader {
    pub ty: ShaderType,
    pub num_tokens: u32,
    pub req_local_mem: u32,
    pub stream_output: StreamOutputInfo,
    pub source: ShaderSource,
}

impl Shader {
    pub fn is_complete(&self) -> bool {
        matches!(self.source, ShaderSource::Complete(_))
    }

    /// Shader text up to its terminator, once fully received.
    pub fn text(&self) -> Option<&[u8]> {
        match &self.source {
            ShaderSource::Complete(bytes) => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Some(&bytes[..end])
            }
            _ => None,
        }
    }
}

/// One CREATE_OBJECT(SHADER) sub-command.
#[derive(Debug, Clone)]
pub struct ShaderChunk<'a> {
    pub handle: u32,
    pub ty: ShaderType,
    pub offlen: u32,
    pub num_tokens: u32,
    pub req_local_mem: u32,
    pub stream_output: StreamOutputInfo,
    pub payload: &'a [u8],
}

/// Handles of the shader being accumulated per stage, 0 when idle.
pub type InProgress = [u32; PIPE_SHADER_TYPES];

fn check_terminated(text: &[u8]) -> Result<()> {
    let len = text.len();
    if len < 4 || !text[len - 4..].contains(&0) {
        return Err(RenderError::invalid("shader text is not terminated"));
    }
    Ok(())
}

/// Applies one shader chunk to `objects`.
pub fn create_shader(
    objects: &mut ObjectTable,
    sub_ctx: u32,
    in_progress: &mut InProgress,
    chunk: ShaderChunk<'_>,
) -> Result<()> {
    let slot = chunk.ty.index();
    let continuation = chunk.offlen & SHADER_OFFSET_CONT != 0;

    if in_progress[slot] != 0 && (!continuation || chunk.handle != in_progress[slot]) {
        return Err(RenderError::invalid(format!(
            "shader {} already being uploaded for this stage",
            in_progress[slot]
        )));
    }

    if continuation {
        let result = continue_shader(objects, in_progress, &chunk);
        if result.is_err() {
            objects.remove(chunk.handle);
            if in_progress[slot] == chunk.handle {
                in_progress[slot] = 0;
            }
        }
        return result;
    }

    let total = (chunk.offlen as usize).div_ceil(4) * 4;
    let long = total > chunk.payload.len();
    let source = if long {
        if total > MAX_SHADER_TEXT {
            return Err(RenderError::OutOfMemory(format!(
                "shader {} announces {total} bytes of text",
                chunk.handle
            )));
        }
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(total).map_err(|_| {
            RenderError::OutOfMemory(format!("{total} bytes for shader {}", chunk.handle))
        })?;
        buffer.resize(total, 0);
        buffer[..chunk.payload.len()].copy_from_slice(chunk.payload);
        ShaderSource::Accumulating {
            buffer,
            offset: chunk.payload.len(),
        }
    } else {
        check_terminated(chunk.payload)?;
        ShaderSource::Complete(chunk.payload.to_vec())
    };

    let shader = Shader {
        ty: chunk.ty,
        num_tokens: chunk.num_tokens,
        req_local_mem: chunk.req_local_mem,
        stream_output: chunk.stream_output,
        source,
    };
    objects.insert(chunk.handle, sub_ctx, Object::Shader(Rc::new(RefCell::new(shader))))?;
    if long {
        in_progress[slot] = chunk.handle;
    }
    Ok(())
}

fn continue_shader(
    objects: &mut ObjectTable,
    in_progress: &mut InProgress,
    chunk: &ShaderChunk<'_>,
) -> Result<()> {
    let Some(Object::Shader(shader)) = objects.lookup(chunk.handle, ObjectKind::Shader) else {
        return Err(RenderError::not_found("shader", chunk.handle));
    };
    let mut shader = shader.borrow_mut();
    let resume_at = (chunk.offlen & !SHADER_OFFSET_CONT) as usize;

    let ShaderSource::Accumulating { buffer, offset } = &mut shader.source else {
        return Err(RenderError::invalid(format!(
            "shader {} is not being uploaded",
            chunk.handle
        )));
    };
    if resume_at != *offset {
        return Err(RenderError::invalid(format!(
            "shader chunk resumes at {resume_at}, expected {offset}"
        )));
    }
    let end = offset
        .checked_add(chunk.payload.len())
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| RenderError::invalid("shader chunk overruns declared length"))?;
    buffer[*offset..end].copy_from_slice(chunk.payload);
    *offset = end;

    if end >= buffer.len() {
        check_terminated(&buffer[..end])?;
        let text = std::mem::take(buffer);
        shader.source = ShaderSource::Complete(text);
        in_progress[chunk.ty.index()] = 0;
    }
    Ok(())
}
