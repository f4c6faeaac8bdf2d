//! Clears, draws, compute dispatch and copies, plus the state they pick up.
//!
//! Bound state is only pushed to the backend right before work that consumes
//! it, and only the categories marked dirty since the last push.

use crate::backend::{
    BufferBinding, FramebufferTargets, NativeCall, StateUpdate, SurfaceTarget,
    VertexBufferBinding,
};
use crate::context::{BufferSlot, DirtyFlags, SubContext};
use crate::decode::CopyRegion;
use crate::error::{RenderError, Result};
use crate::exec::{attached, context_mut};
use crate::format;
use crate::object::{BlitInfo, DrawInfo, GridInfo, Surface};
use crate::registry::ResourceRef;
use crate::renderer::Renderer;
use crate::resource::{Resource, Target};
use crate::shader::ShaderType;
use crate::transfer::{check_bounds, TransferBox, TransferInfo};

const COMPUTE_STATE: DirtyFlags = DirtyFlags::SAMPLER_VIEWS
    .union(DirtyFlags::CONSTANT_BUFFERS)
    .union(DirtyFlags::SHADER_BUFFERS)
    .union(DirtyFlags::IMAGES)
    .union(DirtyFlags::ATOMIC_BUFFERS)
    .union(DirtyFlags::COMPUTE_SHADER);

fn surface_target(surface: &Surface) -> Option<SurfaceTarget> {
    let res = surface.resource.borrow();
    res.native.map(|storage| SurfaceTarget {
        storage,
        format: surface.format,
        level: surface.level(),
        first_layer: surface.first_layer(),
        last_layer: surface.last_layer(),
    })
}

fn framebuffer_targets(sub: &SubContext) -> FramebufferTargets {
    FramebufferTargets {
        colors: sub
            .cbufs
            .iter()
            .map(|cbuf| cbuf.as_deref().and_then(surface_target))
            .collect(),
        depth: sub.zsurf.as_deref().and_then(surface_target),
    }
}

fn buffer_binding(slot: &BufferSlot) -> Option<BufferBinding> {
    slot.resource.borrow().native.map(|storage| BufferBinding {
        storage,
        offset: slot.offset,
        size: slot.size,
    })
}

fn whole_buffer(res: &ResourceRef, offset: u32) -> Option<BufferBinding> {
    let res = res.borrow();
    res.native.map(|storage| BufferBinding {
        storage,
        offset,
        size: res.width.saturating_sub(offset),
    })
}

fn stage_bindings(slots: &[Option<BufferSlot>]) -> Option<Vec<Option<BufferBinding>>> {
    let last = slots.iter().rposition(Option::is_some)?;
    Some(
        slots[..=last]
            .iter()
            .map(|slot| slot.as_ref().and_then(buffer_binding))
            .collect(),
    )
}

/// Collects the state updates for the dirty categories in `mask`.
fn pending_state(sub: &mut SubContext, mask: DirtyFlags) -> Vec<StateUpdate> {
    let dirty = sub.take_dirty(mask);
    let mut updates = Vec::new();

    if dirty.contains(DirtyFlags::BLEND) {
        if let Some(blend) = &sub.blend {
            // targets without alpha read destination alpha as one
            let alphaless = sub
                .cbufs
                .first()
                .and_then(Option::as_ref)
                .and_then(|cbuf| format::describe(cbuf.format))
                .is_some_and(|desc| !desc.has_alpha);
            let state = if alphaless {
                blend.without_dst_alpha(0)
            } else {
                **blend
            };
            updates.push(StateUpdate::Blend(state));
        }
    }
    if dirty.contains(DirtyFlags::DEPTH_STENCIL) {
        if let Some(dsa) = &sub.depth_stencil {
            updates.push(StateUpdate::DepthStencil(**dsa));
        }
    }
    if dirty.contains(DirtyFlags::RASTERIZER) {
        if let Some(rs) = &sub.rasterizer {
            updates.push(StateUpdate::Rasterizer(**rs));
        }
    }
    if dirty.contains(DirtyFlags::VIEWPORT) {
        updates.push(StateUpdate::Viewports {
            start: 0,
            viewports: sub.viewports.to_vec(),
        });
    }
    if dirty.contains(DirtyFlags::SCISSOR) {
        updates.push(StateUpdate::Scissors {
            start: 0,
            scissors: sub.scissors.to_vec(),
        });
    }
    if dirty.contains(DirtyFlags::STENCIL_REF) {
        updates.push(StateUpdate::StencilRef(sub.stencil_ref));
    }
    if dirty.contains(DirtyFlags::BLEND_COLOR) {
        updates.push(StateUpdate::BlendColor(sub.blend_color));
    }
    if dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
        let used = sub
            .vertex_buffers
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1);
        updates.push(StateUpdate::VertexBuffers(
            sub.vertex_buffers[..used]
                .iter()
                .map(|slot| {
                    slot.as_ref().and_then(|slot| {
                        slot.resource.borrow().native.map(|storage| VertexBufferBinding {
                            storage,
                            stride: slot.stride,
                            offset: slot.offset,
                        })
                    })
                })
                .collect(),
        ));
    }
    if dirty.contains(DirtyFlags::INDEX_BUFFER) {
        let (binding, index_size) = match &sub.index_buffer {
            Some(slot) => (whole_buffer(&slot.resource, slot.offset), slot.index_size),
            None => (None, 0),
        };
        updates.push(StateUpdate::IndexBuffer {
            binding,
            index_size,
        });
    }
    if dirty.contains(DirtyFlags::SAMPLER_VIEWS) {
        for stage in ShaderType::ALL {
            let count = sub.sampler_views[stage.index()]
                .iter()
                .filter(|view| view.is_some())
                .count() as u32;
            if count > 0 {
                updates.push(StateUpdate::SamplerViews {
                    shader: stage as u32,
                    count,
                });
            }
        }
    }
    if dirty.contains(DirtyFlags::CONSTANT_BUFFERS) {
        for stage in ShaderType::ALL {
            if let Some(bindings) = stage_bindings(&sub.uniform_buffers[stage.index()]) {
                updates.push(StateUpdate::ConstantBuffers {
                    shader: stage as u32,
                    bindings,
                });
            }
        }
    }
    if dirty.contains(DirtyFlags::SHADER_BUFFERS) {
        for stage in ShaderType::ALL {
            if let Some(bindings) = stage_bindings(&sub.shader_buffers[stage.index()]) {
                updates.push(StateUpdate::ShaderBuffers {
                    shader: stage as u32,
                    bindings,
                });
            }
        }
    }
    updates
}

fn shader_ready(sub: &SubContext, stage: ShaderType) -> bool {
    sub.shaders[stage.index()]
        .as_ref()
        .is_some_and(|shader| shader.borrow().is_complete())
}

impl Renderer {
    /// Makes the context current and pushes its dirty state.
    fn prepare(&mut self, ctx_id: u32, mask: DirtyFlags) -> Result<()> {
        self.switch_context(ctx_id)?;
        let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
        for update in pending_state(sub, mask) {
            self.backend.execute(NativeCall::State(update))?;
        }
        Ok(())
    }

    pub(crate) fn clear(
        &mut self,
        ctx_id: u32,
        buffers: u32,
        color: [f32; 4],
        depth: f64,
        stencil: u32,
    ) -> Result<()> {
        if context_mut(&mut self.contexts, ctx_id)?.in_error {
            return Ok(());
        }
        self.prepare(ctx_id, DirtyFlags::all().difference(COMPUTE_STATE))?;
        let targets = framebuffer_targets(context_mut(&mut self.contexts, ctx_id)?.sub());
        self.backend.execute(NativeCall::Clear {
            targets,
            buffers,
            color,
            depth,
            stencil,
        })
    }

    pub(crate) fn draw_vbo(&mut self, ctx_id: u32, info: DrawInfo) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        if ctx.in_error {
            return Ok(());
        }
        let sub = ctx.sub();
        if !shader_ready(sub, ShaderType::Vertex) || !shader_ready(sub, ShaderType::Fragment) {
            tracing::debug!(ctx_id, "draw dropped, vertex or fragment shader missing");
            return Ok(());
        }
        let indirect = match info.indirect {
            Some(indirect) if indirect.handle != 0 => {
                let Some(res) = attached(ctx, indirect.handle) else {
                    return Ok(());
                };
                if indirect.draw_count_handle != 0 && attached(ctx, indirect.draw_count_handle).is_none() {
                    return Ok(());
                }
                whole_buffer(&res, indirect.offset)
            }
            _ => None,
        };

        self.prepare(ctx_id, DirtyFlags::all().difference(DirtyFlags::COMPUTE_SHADER))?;
        let targets = framebuffer_targets(context_mut(&mut self.contexts, ctx_id)?.sub());
        self.backend.execute(NativeCall::Draw {
            targets,
            info,
            indirect,
        })
    }

    pub(crate) fn launch_grid(&mut self, ctx_id: u32, info: GridInfo) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        if ctx.in_error {
            return Ok(());
        }
        if !shader_ready(ctx.sub(), ShaderType::Compute) {
            tracing::debug!(ctx_id, "dispatch dropped, no compute shader");
            return Ok(());
        }
        let indirect = if info.indirect_handle != 0 {
            let Some(res) = attached(ctx, info.indirect_handle) else {
                return Ok(());
            };
            whole_buffer(&res, info.indirect_offset)
        } else {
            None
        };
        self.prepare(ctx_id, COMPUTE_STATE)?;
        self.backend
            .execute(NativeCall::LaunchGrid { info, indirect })
    }

    pub(crate) fn blit(&mut self, ctx_id: u32, info: BlitInfo) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        if ctx.in_error {
            return Ok(());
        }
        let Some(src) = attached(ctx, info.src.handle) else {
            return Ok(());
        };
        let Some(dst) = attached(ctx, info.dst.handle) else {
            return Ok(());
        };
        check_region(&src.borrow(), info.src.level, &info.src.area)?;
        check_region(&dst.borrow(), info.dst.level, &info.dst.area)?;
        let (Some(src), Some(dst)) = (src.borrow().native, dst.borrow().native) else {
            tracing::debug!(ctx_id, "blit between resources without native storage");
            return Ok(());
        };
        self.switch_context(ctx_id)?;
        self.backend.execute(NativeCall::Blit { src, dst, info })
    }

    pub(crate) fn copy_region(&mut self, ctx_id: u32, region: CopyRegion) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let Some(src) = attached(ctx, region.src_handle) else {
            return Ok(());
        };
        let Some(dst) = attached(ctx, region.dst_handle) else {
            return Ok(());
        };
        let dst_box = TransferBox {
            x: region.dst_origin[0] as i32,
            y: region.dst_origin[1] as i32,
            z: region.dst_origin[2] as i32,
            ..region.src_box
        };
        check_region(&src.borrow(), region.src_level, &region.src_box)?;
        check_region(&dst.borrow(), region.dst_level, &dst_box)?;

        let (src_native, dst_native, buffer) = {
            let (src, dst) = (src.borrow(), dst.borrow());
            let buffer = src.target == Target::Buffer && dst.target == Target::Buffer;
            if !buffer && src.format.block_size != dst.format.block_size {
                return Err(RenderError::invalid(format!(
                    "copy between incompatible formats {} and {}",
                    src.format.id, dst.format.id
                )));
            }
            (src.native, dst.native, buffer)
        };
        let (Some(src_native), Some(dst_native)) = (src_native, dst_native) else {
            tracing::debug!(ctx_id, "copy between resources without native storage");
            return Ok(());
        };
        self.switch_context(ctx_id)?;
        self.backend.execute(NativeCall::CopyRegion {
            src: src_native,
            src_level: region.src_level,
            src_box: region.src_box,
            dst: dst_native,
            dst_level: region.dst_level,
            dst_origin: region.dst_origin,
            buffer,
        })
    }
}

fn check_region(res: &Resource, level: u32, area: &TransferBox) -> Result<()> {
    let info = TransferInfo {
        handle: res.handle,
        level,
        area: *area,
        ..TransferInfo::default()
    };
    check_bounds(res, &info).map_err(|err| {
        tracing::debug!(handle = res.handle, %err, "copy region out of bounds");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{command_header, Opcode};
    use crate::error::ContextError;
    use crate::format::{B8G8R8A8_UNORM, B8G8R8X8_UNORM};
    use crate::null::NullBackend;
    use crate::object::{BLENDFACTOR_DST_ALPHA, BLENDFACTOR_ONE};
    use crate::renderer::RendererConfig;
    use crate::resource::{BindFlags, ResourceCreateArgs};

    fn cmd(opcode: Opcode, object: u32, args: &[u32]) -> Vec<u32> {
        let mut out = vec![command_header(opcode, object, args.len() as u16)];
        out.extend_from_slice(args);
        out
    }

    fn shader(handle: u32, ty: u32) -> Vec<u32> {
        let mut args = vec![handle, ty, 8, 4, 0];
        args.extend([u32::from_le_bytes(*b"TEXT"), 0]);
        cmd(Opcode::CreateObject, 4, &args)
    }

    fn setup() -> (Renderer, crate::null::CallLog) {
        let backend = NullBackend::new(0);
        let log = backend.log();
        let mut r = Renderer::new(Box::new(backend), RendererConfig::default()).unwrap();
        r.create_context(1, "draw").unwrap();
        (r, log)
    }

    fn render_target(r: &mut Renderer, handle: u32, format: u32) {
        let args = ResourceCreateArgs {
            handle,
            target: 2,
            format,
            bind: BindFlags::RENDER_TARGET.bits(),
            width: 16,
            height: 16,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        r.resource_create(&args).unwrap();
        r.attach_resource(1, handle).unwrap();
    }

    fn draw() -> Vec<u32> {
        cmd(Opcode::DrawVbo, 0, &[0, 3, 4, 0, 1, 0, 0, 0, 0, 0, 2, 0])
    }

    #[test]
    fn draw_without_shaders_reaches_nothing() {
        let (mut r, log) = setup();
        r.submit(1, &draw()).unwrap();
        assert!(log.executed().is_empty());
    }

    #[test]
    fn draw_pushes_dirty_state_once() {
        let (mut r, log) = setup();
        let mut batch = shader(1, 0);
        batch.extend(shader(2, 1));
        batch.extend(cmd(Opcode::BindShader, 0, &[1, 0]));
        batch.extend(cmd(Opcode::BindShader, 0, &[2, 1]));
        batch.extend(cmd(Opcode::SetStencilRef, 0, &[0x0201]));
        batch.extend(draw());
        batch.extend(draw());
        r.submit(1, &batch).unwrap();

        let executed = log.executed();
        let draws = executed
            .iter()
            .filter(|call| matches!(call, NativeCall::Draw { .. }))
            .count();
        assert_eq!(draws, 2);
        let stencil_refs = executed
            .iter()
            .filter(|call| matches!(call, NativeCall::State(StateUpdate::StencilRef([1, 2]))))
            .count();
        assert_eq!(stencil_refs, 1);
    }

    #[test]
    fn blend_patched_for_alphaless_target() {
        let (mut r, log) = setup();
        render_target(&mut r, 3, B8G8R8X8_UNORM);
        let rt0 = 1 | (u32::from(BLENDFACTOR_DST_ALPHA) << 4);
        let mut blend = vec![50, 0, 0, rt0];
        blend.extend([0; 7]);
        let mut batch = cmd(Opcode::CreateObject, 1, &blend);
        batch.extend(cmd(Opcode::BindObject, 1, &[50]));
        batch.extend(cmd(Opcode::CreateObject, 8, &[10, 3, B8G8R8X8_UNORM, 0, 0]));
        batch.extend(cmd(Opcode::SetFramebufferState, 0, &[1, 0, 10]));
        batch.extend(cmd(Opcode::Clear, 0, &[4, 0, 0, 0, 0, 0, 0, 0]));
        r.submit(1, &batch).unwrap();

        let blend = log.executed().into_iter().find_map(|call| match call {
            NativeCall::State(StateUpdate::Blend(state)) => Some(state),
            _ => None,
        });
        assert_eq!(blend.unwrap().rt[0].rgb_src_factor, BLENDFACTOR_ONE);
        assert!(log
            .executed()
            .iter()
            .any(|call| matches!(call, NativeCall::Clear { targets, .. } if targets.colors.len() == 1)));
    }

    #[test]
    fn context_in_error_skips_clears() {
        let (mut r, log) = setup();
        let mut batch = cmd(Opcode::SetFramebufferState, 0, &[1, 0, 99]);
        batch.extend(cmd(Opcode::Clear, 0, &[4, 0, 0, 0, 0, 0, 0, 0]));
        r.submit(1, &batch).unwrap();
        assert_eq!(r.context_error(1), Some(ContextError::IllegalSurface(99)));
        assert!(log.executed().is_empty());
    }

    #[test]
    fn copy_region_checks_both_boxes() {
        let (mut r, log) = setup();
        render_target(&mut r, 3, B8G8R8A8_UNORM);
        render_target(&mut r, 4, B8G8R8A8_UNORM);
        // dst handle, level, origin, src handle, level, box
        let ok = [4, 0, 8, 8, 0, 3, 0, 0, 0, 0, 8, 8, 1];
        r.submit(1, &cmd(Opcode::ResourceCopyRegion, 0, &ok)).unwrap();
        assert!(log
            .executed()
            .iter()
            .any(|call| matches!(call, NativeCall::CopyRegion { buffer: false, .. })));

        let past_edge = [4, 0, 12, 12, 0, 3, 0, 0, 0, 0, 8, 8, 1];
        assert!(r.submit(1, &cmd(Opcode::ResourceCopyRegion, 0, &past_edge)).is_err());
    }
}
