//! Rendering contexts and their sub-contexts.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bitflags::bitflags;

use crate::backend::{Backend, NativeContext};
use crate::error::{ContextError, ContextErrorReport, Result};
use crate::object::{
    BlendState, DepthStencilState, Query, RasterizerState, SamplerState, SamplerView, Scissor,
    StreamoutTarget, Surface, VertexElements, Viewport, MAX_ATOMIC_BUFFERS, MAX_ATTRIBS,
    MAX_CONSTANT_BUFFERS, MAX_SAMPLERS, MAX_SAMPLER_VIEWS, MAX_SHADER_BUFFERS, MAX_SHADER_IMAGES,
    MAX_VIEWPORTS, PIPE_SHADER_TYPES,
};
use crate::registry::{AttachmentTable, ObjectTable, ResourceRef};
use crate::shader::{InProgress, Shader};

bitflags! {
    /// State categories assigned since the last materialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u32 {
        const BLEND = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const RASTERIZER = 1 << 2;
        const VIEWPORT = 1 << 3;
        const SCISSOR = 1 << 4;
        const STENCIL_REF = 1 << 5;
        const BLEND_COLOR = 1 << 6;
        const VERTEX_BUFFERS = 1 << 7;
        const INDEX_BUFFER = 1 << 8;
        const SAMPLER_VIEWS = 1 << 9;
        const CONSTANT_BUFFERS = 1 << 10;
        const SHADER_BUFFERS = 1 << 11;
        const IMAGES = 1 << 12;
        const SHADERS = 1 << 13;
        const COMPUTE_SHADER = 1 << 14;
        const FRAMEBUFFER = 1 << 15;
        const ATOMIC_BUFFERS = 1 << 16;
    }
}

#[derive(Debug, Clone)]
pub struct VertexBufferSlot {
    pub resource: ResourceRef,
    pub stride: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct BufferSlot {
    pub resource: ResourceRef,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct IndexBufferSlot {
    pub resource: ResourceRef,
    pub index_size: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct ImageSlot {
    pub resource: ResourceRef,
    pub format: u32,
    pub access: u32,
    pub layer_offset: u32,
    pub level_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoAttachFramebuffer {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub samples: u32,
}

#[derive(Debug, Clone)]
pub struct RenderCondition {
    pub query: Rc<Query>,
    pub condition: bool,
    pub mode: u32,
}

fn per_stage<T: Clone>(slots: usize) -> [Vec<Option<T>>; PIPE_SHADER_TYPES] {
    std::array::from_fn(|_| vec![None; slots])
}

/// Bound pipeline state of one native context.
#[derive(Debug)]
pub struct SubContext {
    pub id: u32,
    pub native: NativeContext,
    pub dirty: DirtyFlags,

    pub blend: Option<Rc<BlendState>>,
    pub depth_stencil: Option<Rc<DepthStencilState>>,
    pub rasterizer: Option<Rc<RasterizerState>>,
    pub vertex_elements: Option<Rc<VertexElements>>,
    pub shaders: [Option<Rc<RefCell<Shader>>>; PIPE_SHADER_TYPES],
    pub shader_in_progress: InProgress,

    pub cbufs: Vec<Option<Rc<Surface>>>,
    pub zsurf: Option<Rc<Surface>>,
    pub no_attach: NoAttachFramebuffer,
    pub fb_height: u32,
    pub inverted_fbo_content: bool,

    pub viewports: [Viewport; MAX_VIEWPORTS],
    pub scissors: [Scissor; MAX_VIEWPORTS],
    pub stencil_ref: [u8; 2],
    pub blend_color: [f32; 4],
    pub polygon_stipple: [u32; 32],
    pub clip_planes: [[f32; 4]; 8],
    pub sample_mask: u32,
    pub min_samples: u32,
    pub tess_levels: [f32; 6],

    pub vertex_buffers: Vec<Option<VertexBufferSlot>>,
    pub index_buffer: Option<IndexBufferSlot>,
    pub sampler_views: [Vec<Option<Rc<SamplerView>>>; PIPE_SHADER_TYPES],
    pub sampler_states: [Vec<Option<Rc<SamplerState>>>; PIPE_SHADER_TYPES],
    pub constants: [Vec<u32>; PIPE_SHADER_TYPES],
    pub uniform_buffers: [Vec<Option<BufferSlot>>; PIPE_SHADER_TYPES],
    pub shader_buffers: [Vec<Option<BufferSlot>>; PIPE_SHADER_TYPES],
    pub images: [Vec<Option<ImageSlot>>; PIPE_SHADER_TYPES],
    pub atomic_buffers: Vec<Option<BufferSlot>>,

    pub so_targets: Vec<Rc<StreamoutTarget>>,
    pub so_append_bitmask: u32,
    pub render_condition: Option<RenderCondition>,
}

impl SubContext {
    pub fn new(id: u32, native: NativeContext) -> Self {
        let mut viewports = [Viewport::default(); MAX_VIEWPORTS];
        // depth range defaults to [0, 1]
        for vp in &mut viewports {
            vp.scale[2] = 0.5;
            vp.translate[2] = 0.5;
        }
        Self {
            id,
            native,
            dirty: DirtyFlags::all(),
            blend: None,
            depth_stencil: None,
            rasterizer: None,
            vertex_elements: None,
            shaders: Default::default(),
            shader_in_progress: InProgress::default(),
            cbufs: Vec::new(),
            zsurf: None,
            no_attach: NoAttachFramebuffer::default(),
            fb_height: 0,
            inverted_fbo_content: false,
            viewports,
            scissors: [Scissor::default(); MAX_VIEWPORTS],
            stencil_ref: [0; 2],
            blend_color: [0.0; 4],
            polygon_stipple: [0; 32],
            clip_planes: [[0.0; 4]; 8],
            sample_mask: !0,
            min_samples: 1,
            tess_levels: [0.0; 6],
            vertex_buffers: vec![None; MAX_ATTRIBS],
            index_buffer: None,
            sampler_views: per_stage(MAX_SAMPLER_VIEWS),
            sampler_states: per_stage(MAX_SAMPLERS),
            constants: Default::default(),
            uniform_buffers: per_stage(MAX_CONSTANT_BUFFERS),
            shader_buffers: per_stage(MAX_SHADER_BUFFERS),
            images: per_stage(MAX_SHADER_IMAGES),
            atomic_buffers: vec![None; MAX_ATOMIC_BUFFERS],
            so_targets: Vec::new(),
            so_append_bitmask: 0,
            render_condition: None,
        }
    }

    pub fn mark(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    /// Returns and clears the dirty bits in `flags`.
    pub fn take_dirty(&mut self, flags: DirtyFlags) -> DirtyFlags {
        let taken = self.dirty & flags;
        self.dirty.remove(flags);
        taken
    }
}

/// Per-connection renderer state: objects, attachments and sub-contexts.
///
/// The current sub-context is held outside the map so it is always present.
#[derive(Debug)]
pub struct Context {
    pub ctx_id: u32,
    pub name: String,
    pub in_error: bool,
    pub last_error: Option<ContextError>,
    pub switch_pending: bool,
    pub objects: ObjectTable,
    pub attachments: AttachmentTable,
    sub: SubContext,
    inactive: BTreeMap<u32, SubContext>,
}

impl Context {
    pub fn new(backend: &mut dyn Backend, ctx_id: u32, name: &str) -> Result<Self> {
        let native = backend.create_context(ctx_id, 0)?;
        Ok(Self {
            ctx_id,
            name: name.to_owned(),
            in_error: false,
            last_error: None,
            switch_pending: true,
            objects: ObjectTable::default(),
            attachments: AttachmentTable::default(),
            sub: SubContext::new(0, native),
            inactive: BTreeMap::new(),
        })
    }

    pub fn sub(&self) -> &SubContext {
        &self.sub
    }

    pub fn sub_mut(&mut self) -> &mut SubContext {
        &mut self.sub
    }

    /// Current sub-context together with the object table, for lookups that
    /// update bound state.
    pub fn split(&mut self) -> (&mut SubContext, &mut ObjectTable, &AttachmentTable) {
        (&mut self.sub, &mut self.objects, &self.attachments)
    }

    pub fn sub_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inactive.keys().copied().collect();
        ids.push(self.sub.id);
        ids.sort_unstable();
        ids
    }

    /// Latches `error`; the context renders nothing until it is recreated.
    pub fn report_error(&mut self, error: ContextError) {
        let report = ContextErrorReport {
            ctx_id: self.ctx_id,
            error,
        };
        tracing::warn!(%report, name = %self.name, "context error");
        self.in_error = true;
        self.last_error = Some(error);
    }

    /// A new sub-context becomes current. Existing ids are left alone.
    pub fn create_sub_ctx(&mut self, backend: &mut dyn Backend, id: u32) -> Result<()> {
        if self.sub.id == id || self.inactive.contains_key(&id) {
            return Ok(());
        }
        let native = backend.create_context(self.ctx_id, id)?;
        let previous = std::mem::replace(&mut self.sub, SubContext::new(id, native));
        self.inactive.insert(previous.id, previous);
        self.switch_pending = true;
        tracing::debug!(ctx_id = self.ctx_id, sub_ctx = id, "sub-context created");
        Ok(())
    }

    /// Unknown ids are ignored.
    pub fn set_sub_ctx(&mut self, id: u32) {
        if self.sub.id == id {
            return;
        }
        if let Some(next) = self.inactive.remove(&id) {
            let previous = std::mem::replace(&mut self.sub, next);
            self.inactive.insert(previous.id, previous);
            self.switch_pending = true;
        }
    }

    /// Destroys a sub-context and the objects it created. Sub-context 0 stays.
    pub fn destroy_sub_ctx(&mut self, backend: &mut dyn Backend, id: u32) {
        if id == 0 {
            return;
        }
        let removed = if self.sub.id == id {
            match self.inactive.remove(&0) {
                Some(sub0) => {
                    self.switch_pending = true;
                    Some(std::mem::replace(&mut self.sub, sub0))
                }
                None => None,
            }
        } else {
            self.inactive.remove(&id)
        };
        if let Some(sub) = removed {
            let dropped = self.objects.remove_sub_ctx(id);
            tracing::debug!(ctx_id = self.ctx_id, sub_ctx = id, dropped, "sub-context destroyed");
            backend.destroy_context(sub.native);
        }
    }

    /// Tears everything down. Resources survive while referenced elsewhere.
    pub fn destroy(mut self, backend: &mut dyn Backend) {
        self.objects.clear();
        self.attachments.clear();
        for (_, sub) in std::mem::take(&mut self.inactive) {
            backend.destroy_context(sub.native);
        }
        backend.destroy_context(self.sub.native);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::null::NullBackend;
    use crate::object::Object;

    #[test]
    fn sub_context_zero_survives_destroy() {
        let mut backend = NullBackend::new(0);
        let mut ctx = Context::new(&mut backend, 1, "test").unwrap();
        ctx.destroy_sub_ctx(&mut backend, 0);
        assert_eq!(ctx.sub().id, 0);

        ctx.create_sub_ctx(&mut backend, 2).unwrap();
        assert_eq!(ctx.sub().id, 2);
        assert_eq!(ctx.sub_ids(), vec![0, 2]);

        ctx.set_sub_ctx(0);
        assert_eq!(ctx.sub().id, 0);
        ctx.set_sub_ctx(9);
        assert_eq!(ctx.sub().id, 0);
    }

    #[test]
    fn destroying_current_sub_context_falls_back_to_zero() {
        let mut backend = NullBackend::new(0);
        let mut ctx = Context::new(&mut backend, 1, "test").unwrap();
        ctx.create_sub_ctx(&mut backend, 3).unwrap();
        ctx.objects
            .insert(10, 3, Object::Blend(Rc::new(BlendState::default())))
            .unwrap();
        ctx.objects
            .insert(11, 0, Object::Blend(Rc::new(BlendState::default())))
            .unwrap();

        ctx.destroy_sub_ctx(&mut backend, 3);
        assert_eq!(ctx.sub().id, 0);
        assert_eq!(ctx.sub_ids(), vec![0]);
        assert_eq!(ctx.objects.len(), 1);
    }

    #[test]
    fn errors_latch() {
        let mut backend = NullBackend::new(0);
        let mut ctx = Context::new(&mut backend, 4, "test").unwrap();
        ctx.report_error(ContextError::IllegalHandle(7));
        assert!(ctx.in_error);
        assert_eq!(ctx.last_error, Some(ContextError::IllegalHandle(7)));
    }

    #[test]
    fn take_dirty_clears_only_requested_bits() {
        let mut sub = SubContext::new(0, NativeContext(1));
        sub.dirty = DirtyFlags::BLEND | DirtyFlags::SCISSOR;
        assert_eq!(sub.take_dirty(DirtyFlags::BLEND), DirtyFlags::BLEND);
        assert_eq!(sub.dirty, DirtyFlags::SCISSOR);
    }
}
