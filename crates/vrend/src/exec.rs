//! Applies decoded sub-commands to a context's object table and bound state.
//!
//! Lookups of guest handles follow two rules. A handle that must name an
//! object for the command to make sense at all fails the sub-command. A
//! handle that only feeds bound state latches a [`ContextError`] instead, and
//! the context stops rendering until it is recreated.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::backend::NativeCall;
use crate::context::{
    BufferSlot, Context, DirtyFlags, ImageSlot, IndexBufferSlot, RenderCondition,
    VertexBufferSlot,
};
use crate::decode::{BufferDesc, Command, ImageDesc, NewObject, VertexBufferDesc};
use crate::error::{ContextError, RenderError, Result};
use crate::format::FORMAT_MAX;
use crate::iov::IovecSet;
use crate::query;
use crate::object::{
    Object, ObjectKind, SamplerView, StreamoutTarget, Surface, MAX_ATOMIC_BUFFERS, MAX_SAMPLERS,
};
use crate::registry::ResourceRef;
use crate::renderer::Renderer;
use crate::shader::{self, ShaderType};
use crate::transfer::{TransferDirection, TransferInfo};

/// Sampler view targets are packed above the format in the same word.
const MAX_TEXTURE_TYPES: u32 = 9;

pub(crate) fn context_mut(
    contexts: &mut BTreeMap<u32, Context>,
    ctx_id: u32,
) -> Result<&mut Context> {
    contexts
        .get_mut(&ctx_id)
        .ok_or_else(|| RenderError::invalid(format!("no context {ctx_id}")))
}

/// Resolves a handle through the context's attachments, latching
/// [`ContextError::IllegalResource`] when it is not there.
pub(crate) fn attached(ctx: &mut Context, handle: u32) -> Option<ResourceRef> {
    let res = ctx.attachments.lookup(handle);
    if res.is_none() {
        ctx.report_error(ContextError::IllegalResource(handle));
    }
    res
}

fn illegal_resource(handle: u32) -> RenderError {
    RenderError::invalid(format!("resource {handle} is not attached"))
}

impl Renderer {
    pub(crate) fn apply(&mut self, ctx_id: u32, command: Command<'_>) -> Result<()> {
        match command {
            Command::Nop | Command::Ignored(_) => Ok(()),
            Command::CreateObject { handle, object } => self.create_object(ctx_id, handle, object),
            Command::BindObject { kind, handle } => {
                bind_object(context_mut(&mut self.contexts, ctx_id)?, kind, handle);
                Ok(())
            }
            Command::DestroyObject { handle } => self.destroy_object(ctx_id, handle),
            Command::SetViewports { start, viewports } => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                for (slot, vp) in sub.viewports.iter_mut().skip(start as usize).zip(viewports) {
                    *slot = vp;
                }
                sub.mark(DirtyFlags::VIEWPORT);
                Ok(())
            }
            Command::SetFramebuffer { zsurf, cbufs } => {
                set_framebuffer(context_mut(&mut self.contexts, ctx_id)?, zsurf, cbufs);
                Ok(())
            }
            Command::SetFramebufferNoAttach(fb) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.no_attach = fb;
                sub.mark(DirtyFlags::FRAMEBUFFER);
                Ok(())
            }
            Command::SetVertexBuffers(descs) => {
                set_vertex_buffers(context_mut(&mut self.contexts, ctx_id)?, &descs);
                Ok(())
            }
            Command::Clear {
                buffers,
                color,
                depth,
                stencil,
            } => self.clear(ctx_id, buffers, color, depth, stencil),
            Command::DrawVbo(info) => self.draw_vbo(ctx_id, info),
            Command::InlineWrite { info, data } => self.inline_write(ctx_id, &info, data),
            Command::SetSamplerViews {
                shader,
                start,
                handles,
            } => {
                set_sampler_views(context_mut(&mut self.contexts, ctx_id)?, shader, start, handles);
                Ok(())
            }
            Command::SetIndexBuffer {
                handle,
                index_size,
                offset,
            } => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                let slot = if handle == 0 {
                    None
                } else {
                    let Some(resource) = attached(ctx, handle) else {
                        return Ok(());
                    };
                    Some(IndexBufferSlot {
                        resource,
                        index_size,
                        offset,
                    })
                };
                let sub = ctx.sub_mut();
                sub.index_buffer = slot;
                sub.mark(DirtyFlags::INDEX_BUFFER);
                Ok(())
            }
            Command::SetConstantBuffer { shader, values } => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.constants[shader.index()] = values.to_vec();
                sub.mark(DirtyFlags::CONSTANT_BUFFERS);
                Ok(())
            }
            Command::SetUniformBuffer {
                shader,
                index,
                offset,
                length,
                handle,
            } => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                let desc = BufferDesc {
                    offset,
                    length,
                    handle,
                };
                let Some(slot) = buffer_slot(ctx, &desc) else {
                    return Ok(());
                };
                let sub = ctx.sub_mut();
                sub.uniform_buffers[shader.index()][index as usize] = slot;
                sub.mark(DirtyFlags::CONSTANT_BUFFERS);
                Ok(())
            }
            Command::SetStencilRef(refs) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.stencil_ref = refs;
                sub.mark(DirtyFlags::STENCIL_REF);
                Ok(())
            }
            Command::SetBlendColor(color) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.blend_color = color;
                sub.mark(DirtyFlags::BLEND_COLOR);
                Ok(())
            }
            Command::SetScissors { start, scissors } => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                let limit = sub.scissors.len();
                if start as usize > limit || scissors.len() > limit - start as usize {
                    return Ok(());
                }
                for (slot, scissor) in sub.scissors.iter_mut().skip(start as usize).zip(scissors) {
                    *slot = scissor;
                }
                sub.mark(DirtyFlags::SCISSOR);
                Ok(())
            }
            Command::Blit(info) => self.blit(ctx_id, info),
            Command::CopyRegion(region) => self.copy_region(ctx_id, region),
            Command::BindSamplerStates {
                shader,
                start,
                handles,
            } => {
                bind_sampler_states(context_mut(&mut self.contexts, ctx_id)?, shader, start, handles);
                Ok(())
            }
            Command::BeginQuery(handle) => self.begin_query(ctx_id, handle),
            Command::EndQuery(handle) => self.end_query(ctx_id, handle),
            Command::GetQueryResult { handle, .. } => self.get_query_result(ctx_id, handle),
            Command::GetQueryResultQbo(write) => self.get_query_result_qbo(ctx_id, write),
            Command::SetPolygonStipple(stipple) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.polygon_stipple = stipple;
                sub.mark(DirtyFlags::RASTERIZER);
                Ok(())
            }
            Command::SetClipState(planes) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.clip_planes = planes;
                sub.mark(DirtyFlags::RASTERIZER);
                Ok(())
            }
            Command::SetSampleMask(mask) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.sample_mask = mask;
                sub.mark(DirtyFlags::RASTERIZER);
                Ok(())
            }
            Command::SetMinSamples(samples) => {
                let sub = context_mut(&mut self.contexts, ctx_id)?.sub_mut();
                sub.min_samples = samples;
                sub.mark(DirtyFlags::RASTERIZER);
                Ok(())
            }
            Command::SetStreamoutTargets {
                append_bitmask,
                handles,
            } => {
                set_streamout_targets(context_mut(&mut self.contexts, ctx_id)?, append_bitmask, handles);
                Ok(())
            }
            Command::SetRenderCondition {
                handle,
                condition,
                mode,
            } => self.set_render_condition(ctx_id, handle, condition, mode),
            Command::SetSubCtx(id) => {
                context_mut(&mut self.contexts, ctx_id)?.set_sub_ctx(id);
                Ok(())
            }
            Command::CreateSubCtx(id) => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                ctx.create_sub_ctx(self.backend.as_mut(), id)
            }
            Command::DestroySubCtx(id) => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                ctx.destroy_sub_ctx(self.backend.as_mut(), id);
                self.flush_releases();
                Ok(())
            }
            Command::BindShader { handle, ty } => {
                bind_shader(context_mut(&mut self.contexts, ctx_id)?, handle, ty);
                Ok(())
            }
            Command::SetTessState(levels) => {
                context_mut(&mut self.contexts, ctx_id)?.sub_mut().tess_levels = levels;
                Ok(())
            }
            Command::SetShaderBuffers {
                shader,
                start,
                buffers,
            } => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                let Some(slots) = buffer_slots(ctx, &buffers) else {
                    return Ok(());
                };
                let sub = ctx.sub_mut();
                let stage = &mut sub.shader_buffers[shader.index()];
                for (slot, value) in stage.iter_mut().skip(start as usize).zip(slots) {
                    *slot = value;
                }
                sub.mark(DirtyFlags::SHADER_BUFFERS);
                Ok(())
            }
            Command::SetShaderImages {
                shader,
                start,
                images,
            } => {
                set_shader_images(context_mut(&mut self.contexts, ctx_id)?, shader, start, &images);
                Ok(())
            }
            Command::SetAtomicBuffers { start, buffers } => {
                let ctx = context_mut(&mut self.contexts, ctx_id)?;
                if start as usize + buffers.len() > MAX_ATOMIC_BUFFERS {
                    return Err(RenderError::invalid("atomic buffer slots out of range"));
                }
                let Some(slots) = buffer_slots(ctx, &buffers) else {
                    return Ok(());
                };
                let sub = ctx.sub_mut();
                for (slot, value) in sub.atomic_buffers.iter_mut().skip(start as usize).zip(slots) {
                    *slot = value;
                }
                sub.mark(DirtyFlags::ATOMIC_BUFFERS);
                Ok(())
            }
            Command::MemoryBarrier(flags) => {
                self.switch_context(ctx_id)?;
                self.backend.execute(NativeCall::MemoryBarrier(flags))
            }
            Command::TextureBarrier(flags) => {
                self.switch_context(ctx_id)?;
                self.backend.execute(NativeCall::TextureBarrier(flags))
            }
            Command::LaunchGrid(info) => self.launch_grid(ctx_id, info),
            Command::Transfer3d { info, direction } => self.transfer_iov(&info, direction, None),
            Command::CopyTransfer3d { info, src_handle } => {
                self.copy_transfer3d(ctx_id, &info, src_handle)
            }
        }
    }

    fn create_object(&mut self, ctx_id: u32, handle: u32, object: NewObject<'_>) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let sub_id = ctx.sub().id;
        let object = match object {
            NewObject::Blend(state) => Object::Blend(Rc::new(state)),
            NewObject::DepthStencil(state) => Object::DepthStencil(Rc::new(state)),
            NewObject::Rasterizer(state) => Object::Rasterizer(Rc::new(state)),
            NewObject::VertexElements(elements) => Object::VertexElements(Rc::new(elements)),
            NewObject::SamplerState(state) => Object::SamplerState(Rc::new(state)),
            NewObject::Shader(chunk) => {
                let (sub, objects, _) = ctx.split();
                return shader::create_shader(objects, sub_id, &mut sub.shader_in_progress, chunk);
            }
            NewObject::SamplerView {
                resource,
                format,
                val0,
                val1,
                swizzle,
            } => {
                let target = (format >> 24) & 0xff;
                let format = format & 0x00ff_ffff;
                if format >= FORMAT_MAX || target >= MAX_TEXTURE_TYPES {
                    return Err(RenderError::invalid(format!(
                        "sampler view format {format} target {target}"
                    )));
                }
                let resource = attached(ctx, resource).ok_or_else(|| illegal_resource(resource))?;
                Object::SamplerView(Rc::new(SamplerView {
                    resource,
                    format,
                    target,
                    val0,
                    val1,
                    swizzle: std::array::from_fn(|i| ((swizzle >> (3 * i)) & 0x7) as u8),
                }))
            }
            NewObject::Surface {
                resource,
                format,
                val0,
                val1,
            } => {
                if format >= FORMAT_MAX {
                    return Err(RenderError::invalid(format!("surface format {format}")));
                }
                let resource = attached(ctx, resource).ok_or_else(|| illegal_resource(resource))?;
                Object::Surface(Rc::new(Surface {
                    resource,
                    format,
                    val0,
                    val1,
                }))
            }
            NewObject::StreamoutTarget {
                resource,
                offset,
                size,
            } => {
                let resource = ctx
                    .attachments
                    .lookup(resource)
                    .ok_or_else(|| illegal_resource(resource))?;
                Object::StreamoutTarget(Rc::new(StreamoutTarget {
                    resource,
                    offset,
                    size,
                }))
            }
            NewObject::Query {
                query_type,
                index,
                resource,
                ..
            } => query::new_query(
                self.backend.as_mut(),
                &self.release,
                ctx,
                query_type,
                index,
                resource,
            )?,
        };
        ctx.objects.insert(handle, sub_id, object)
    }

    fn destroy_object(&mut self, ctx_id: u32, handle: u32) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let removed = ctx.objects.remove(handle);
        if let Some(Object::Shader(shader)) = &removed {
            let slot = shader.borrow().ty.index();
            let sub = ctx.sub_mut();
            if sub.shader_in_progress[slot] == handle {
                sub.shader_in_progress[slot] = 0;
            }
        }
        if let Some(Object::Query(query)) = &removed {
            self.waiting_queries
                .retain(|waiting| !Rc::ptr_eq(&waiting.query, query));
        }
        drop(removed);
        self.flush_releases();
        Ok(())
    }

    fn set_render_condition(
        &mut self,
        ctx_id: u32,
        handle: u32,
        condition: bool,
        mode: u32,
    ) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let state = if handle == 0 {
            None
        } else {
            match ctx.objects.lookup(handle, ObjectKind::Query) {
                Some(Object::Query(query)) => Some(RenderCondition {
                    query: query.clone(),
                    condition,
                    mode,
                }),
                _ => {
                    ctx.report_error(ContextError::IllegalHandle(handle));
                    return Ok(());
                }
            }
        };
        let native = state.as_ref().map(|cond| cond.query.native);
        ctx.sub_mut().render_condition = state;
        self.switch_context(ctx_id)?;
        self.backend.execute(NativeCall::RenderCondition {
            query: native,
            condition,
            mode,
        })
    }

    /// Writes inline data into an attached resource as if it came from guest
    /// memory.
    fn inline_write(&mut self, ctx_id: u32, info: &TransferInfo, data: &[u8]) -> Result<()> {
        let res = context_mut(&mut self.contexts, ctx_id)?
            .attachments
            .lookup(info.handle)
            .ok_or_else(|| illegal_resource(info.handle))?;
        let iov = IovecSet::single(data.to_vec());
        self.transfer_resource(&res, info, TransferDirection::ToHost, &iov)
    }

    /// Uploads into `info.handle` from the guest backing of `src_handle`.
    fn copy_transfer3d(&mut self, ctx_id: u32, info: &TransferInfo, src_handle: u32) -> Result<()> {
        let ctx = context_mut(&mut self.contexts, ctx_id)?;
        let src = ctx
            .attachments
            .lookup(src_handle)
            .ok_or_else(|| illegal_resource(src_handle))?;
        let dst = ctx
            .attachments
            .lookup(info.handle)
            .ok_or_else(|| illegal_resource(info.handle))?;
        let iov = src.borrow().iov.clone().ok_or_else(|| {
            RenderError::invalid(format!("resource {src_handle} has no guest backing"))
        })?;
        self.transfer_resource(&dst, info, TransferDirection::ToHost, &iov)
    }
}

fn bind_object(ctx: &mut Context, kind: ObjectKind, handle: u32) {
    let object = if handle == 0 {
        None
    } else {
        match ctx.objects.lookup(handle, kind) {
            Some(object) => Some(object.clone()),
            None => {
                ctx.report_error(ContextError::IllegalHandle(handle));
                return;
            }
        }
    };
    let sub = ctx.sub_mut();
    match (kind, object) {
        (ObjectKind::Blend, Some(Object::Blend(state))) => sub.blend = Some(state),
        (ObjectKind::Blend, _) => sub.blend = None,
        (ObjectKind::DepthStencil, Some(Object::DepthStencil(state))) => {
            sub.depth_stencil = Some(state)
        }
        (ObjectKind::DepthStencil, _) => sub.depth_stencil = None,
        (ObjectKind::Rasterizer, Some(Object::Rasterizer(state))) => sub.rasterizer = Some(state),
        (ObjectKind::Rasterizer, _) => sub.rasterizer = None,
        (ObjectKind::VertexElements, Some(Object::VertexElements(ve))) => {
            sub.vertex_elements = Some(ve)
        }
        (ObjectKind::VertexElements, _) => sub.vertex_elements = None,
        _ => return,
    }
    sub.mark(match kind {
        ObjectKind::Blend => DirtyFlags::BLEND,
        ObjectKind::DepthStencil => DirtyFlags::DEPTH_STENCIL,
        ObjectKind::Rasterizer => DirtyFlags::RASTERIZER,
        _ => DirtyFlags::VERTEX_BUFFERS,
    });
}

fn surface(ctx: &Context, handle: u32) -> std::result::Result<Option<Rc<Surface>>, ContextError> {
    if handle == 0 {
        return Ok(None);
    }
    match ctx.objects.lookup(handle, ObjectKind::Surface) {
        Some(Object::Surface(surface)) => Ok(Some(surface.clone())),
        _ => Err(ContextError::IllegalSurface(handle)),
    }
}

fn set_framebuffer(ctx: &mut Context, zsurf: u32, cbufs: &[u32]) {
    let resolved = surface(ctx, zsurf).and_then(|zsurf| {
        let cbufs = cbufs
            .iter()
            .map(|handle| surface(ctx, *handle))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((zsurf, cbufs))
    });
    let (zsurf, cbufs) = match resolved {
        Ok(resolved) => resolved,
        Err(error) => {
            ctx.report_error(error);
            return;
        }
    };

    let sub = ctx.sub_mut();
    let first = cbufs.iter().flatten().next().or(zsurf.as_ref());
    match first {
        Some(surface) => {
            let res = surface.resource.borrow();
            sub.fb_height = res.level_height(surface.level());
            sub.inverted_fbo_content = res.y_0_top;
        }
        None => {
            sub.fb_height = 0;
            sub.inverted_fbo_content = false;
        }
    }
    sub.zsurf = zsurf;
    sub.cbufs = cbufs;
    // blend factors depend on whether the first target has alpha
    sub.mark(DirtyFlags::FRAMEBUFFER | DirtyFlags::BLEND | DirtyFlags::VIEWPORT);
}

fn set_vertex_buffers(ctx: &mut Context, descs: &[VertexBufferDesc]) {
    let mut slots = Vec::with_capacity(descs.len());
    for desc in descs {
        if desc.handle == 0 {
            slots.push(None);
            continue;
        }
        let Some(resource) = attached(ctx, desc.handle) else {
            return;
        };
        slots.push(Some(VertexBufferSlot {
            resource,
            stride: desc.stride,
            offset: desc.offset,
        }));
    }
    let sub = ctx.sub_mut();
    for (index, slot) in sub.vertex_buffers.iter_mut().enumerate() {
        *slot = slots.get(index).cloned().flatten();
    }
    sub.mark(DirtyFlags::VERTEX_BUFFERS);
}

fn set_sampler_views(ctx: &mut Context, shader: ShaderType, start: u32, handles: &[u32]) {
    let mut views = Vec::with_capacity(handles.len());
    for &handle in handles {
        if handle == 0 {
            views.push(None);
            continue;
        }
        match ctx.objects.lookup(handle, ObjectKind::SamplerView) {
            Some(Object::SamplerView(view)) => views.push(Some(view.clone())),
            _ => {
                ctx.report_error(ContextError::IllegalHandle(handle));
                return;
            }
        }
    }
    let sub = ctx.sub_mut();
    let stage = &mut sub.sampler_views[shader.index()];
    for (slot, view) in stage.iter_mut().skip(start as usize).zip(views) {
        *slot = view;
    }
    sub.mark(DirtyFlags::SAMPLER_VIEWS);
}

fn bind_sampler_states(ctx: &mut Context, shader: ShaderType, start: u32, handles: &[u32]) {
    if start as usize > MAX_SAMPLERS || handles.len() > MAX_SAMPLERS - start as usize {
        ctx.report_error(ContextError::IllegalCmdBuffer);
        return;
    }
    // unknown handles leave the slot empty
    let states: Vec<_> = handles
        .iter()
        .map(|&handle| match ctx.objects.lookup(handle, ObjectKind::SamplerState) {
            Some(Object::SamplerState(state)) => Some(state.clone()),
            _ => None,
        })
        .collect();
    let sub = ctx.sub_mut();
    let stage = &mut sub.sampler_states[shader.index()];
    for (slot, state) in stage.iter_mut().skip(start as usize).zip(states) {
        *slot = state;
    }
    sub.mark(DirtyFlags::SAMPLER_VIEWS);
}

/// Resolves one buffer binding. `None` means a resource was missing and the
/// context error is latched; `Some(None)` unbinds.
fn buffer_slot(ctx: &mut Context, desc: &BufferDesc) -> Option<Option<BufferSlot>> {
    if desc.handle == 0 {
        return Some(None);
    }
    let resource = attached(ctx, desc.handle)?;
    Some(Some(BufferSlot {
        resource,
        offset: desc.offset,
        size: desc.length,
    }))
}

fn buffer_slots(ctx: &mut Context, descs: &[BufferDesc]) -> Option<Vec<Option<BufferSlot>>> {
    descs.iter().map(|desc| buffer_slot(ctx, desc)).collect()
}

fn set_shader_images(ctx: &mut Context, shader: ShaderType, start: u32, images: &[ImageDesc]) {
    let mut slots = Vec::with_capacity(images.len());
    for image in images {
        if image.handle == 0 {
            slots.push(None);
            continue;
        }
        if image.format >= FORMAT_MAX {
            ctx.report_error(ContextError::IllegalFormat(image.format));
            return;
        }
        let Some(resource) = attached(ctx, image.handle) else {
            return;
        };
        slots.push(Some(ImageSlot {
            resource,
            format: image.format,
            access: image.access,
            layer_offset: image.layer_offset,
            level_size: image.level_size,
        }));
    }
    let sub = ctx.sub_mut();
    let stage = &mut sub.images[shader.index()];
    for (slot, image) in stage.iter_mut().skip(start as usize).zip(slots) {
        *slot = image;
    }
    sub.mark(DirtyFlags::IMAGES);
}

fn set_streamout_targets(ctx: &mut Context, append_bitmask: u32, handles: &[u32]) {
    let mut targets = Vec::with_capacity(handles.len());
    for &handle in handles {
        match ctx.objects.lookup(handle, ObjectKind::StreamoutTarget) {
            Some(Object::StreamoutTarget(target)) => targets.push(target.clone()),
            _ => {
                ctx.report_error(ContextError::IllegalHandle(handle));
                return;
            }
        }
    }
    let sub = ctx.sub_mut();
    sub.so_targets = targets;
    sub.so_append_bitmask = append_bitmask;
}

/// Out-of-range stages and mismatched or unknown shaders are ignored.
fn bind_shader(ctx: &mut Context, handle: u32, ty: u32) {
    let Some(stage) = ShaderType::from_raw(ty) else {
        return;
    };
    let shader = if handle == 0 {
        None
    } else {
        match ctx.objects.lookup(handle, ObjectKind::Shader) {
            Some(Object::Shader(shader)) if shader.borrow().ty == stage => Some(shader.clone()),
            _ => return,
        }
    };
    let sub = ctx.sub_mut();
    sub.shaders[stage.index()] = shader;
    sub.mark(if stage == ShaderType::Compute {
        DirtyFlags::COMPUTE_SHADER
    } else {
        DirtyFlags::SHADERS
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::command_header;
    use crate::decode::Opcode;
    use crate::format::{B8G8R8A8_UNORM, R8_UNORM};
    use crate::null::NullBackend;
    use crate::renderer::RendererConfig;
    use crate::resource::{BindFlags, ResourceCreateArgs};

    fn renderer() -> Renderer {
        let mut r = Renderer::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap();
        r.create_context(1, "exec").unwrap();
        r
    }

    fn cmd(opcode: Opcode, object: u32, args: &[u32]) -> Vec<u32> {
        let mut out = vec![command_header(opcode, object, args.len() as u16)];
        out.extend_from_slice(args);
        out
    }

    fn texture(r: &mut Renderer, handle: u32) {
        let args = ResourceCreateArgs {
            handle,
            target: 2,
            format: B8G8R8A8_UNORM,
            bind: BindFlags::RENDER_TARGET.bits(),
            width: 8,
            height: 8,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        r.resource_create(&args).unwrap();
        r.attach_resource(1, handle).unwrap();
    }

    fn surface_cmd(handle: u32, resource: u32) -> Vec<u32> {
        cmd(Opcode::CreateObject, 8, &[handle, resource, B8G8R8A8_UNORM, 0, 0])
    }

    #[test]
    fn surface_on_unattached_resource_latches_error() {
        let mut r = renderer();
        let err = r.submit(1, &surface_cmd(10, 99)).unwrap_err();
        assert!(matches!(err, RenderError::InvalidArgument(_)));
        assert_eq!(r.context_error(1), Some(ContextError::IllegalResource(99)));
        // the context now refuses batches
        assert!(r.submit(1, &cmd(Opcode::Nop, 0, &[])).is_err());
    }

    #[test]
    fn framebuffer_tracks_first_target() {
        let mut r = renderer();
        texture(&mut r, 3);
        let mut batch = surface_cmd(10, 3);
        batch.extend(cmd(Opcode::SetFramebufferState, 0, &[1, 0, 10]));
        r.submit(1, &batch).unwrap();
        let ctx = &r.contexts[&1];
        assert_eq!(ctx.sub().cbufs.len(), 1);
        assert_eq!(ctx.sub().fb_height, 8);
        assert!(ctx.sub().zsurf.is_none());
    }

    #[test]
    fn missing_framebuffer_surface_latches_error() {
        let mut r = renderer();
        r.submit(1, &cmd(Opcode::SetFramebufferState, 0, &[1, 0, 44]))
            .unwrap();
        assert_eq!(r.context_error(1), Some(ContextError::IllegalSurface(44)));
    }

    #[test]
    fn sampler_view_target_and_swizzle_unpack() {
        let mut r = renderer();
        texture(&mut r, 3);
        let format = B8G8R8A8_UNORM | (2 << 24);
        let swizzle = 3 | (2 << 3) | (1 << 6) | (5 << 9);
        r.submit(1, &cmd(Opcode::CreateObject, 6, &[20, 3, format, 0, 0, swizzle]))
            .unwrap();
        let ctx = &r.contexts[&1];
        let Some(Object::SamplerView(view)) = ctx.objects.lookup(20, ObjectKind::SamplerView) else {
            panic!("sampler view missing");
        };
        assert_eq!(view.target, 2);
        assert_eq!(view.format, B8G8R8A8_UNORM);
        assert_eq!(view.swizzle, [3, 2, 1, 5]);

        let bad = B8G8R8A8_UNORM | (9 << 24);
        assert!(r
            .submit(1, &cmd(Opcode::CreateObject, 6, &[21, 3, bad, 0, 0, 0]))
            .is_err());
    }

    #[test]
    fn sampler_states_out_of_range_latch_error() {
        let mut r = renderer();
        r.submit(1, &cmd(Opcode::BindSamplerStates, 0, &[0, 31, 0, 0]))
            .unwrap();
        assert_eq!(r.context_error(1), Some(ContextError::IllegalCmdBuffer));
    }

    #[test]
    fn bind_shader_ignores_unknown_stage_and_type_mismatch() {
        let mut r = renderer();
        // a complete fragment shader
        let text = b"FRAG\0\0\0\0";
        let mut args = vec![30, 1, 8, 4, 0];
        args.extend(
            text.chunks(4)
                .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]])),
        );
        r.submit(1, &cmd(Opcode::CreateObject, 4, &args)).unwrap();

        r.submit(1, &cmd(Opcode::BindShader, 0, &[30, 0])).unwrap();
        assert!(r.contexts[&1].sub().shaders[0].is_none());
        r.submit(1, &cmd(Opcode::BindShader, 0, &[30, 9])).unwrap();
        r.submit(1, &cmd(Opcode::BindShader, 0, &[30, 1])).unwrap();
        assert!(r.contexts[&1].sub().shaders[1].is_some());
        assert!(r.context_error(1).is_none());
    }

    #[test]
    fn inline_write_reaches_host_memory() {
        let mut r = renderer();
        let args = ResourceCreateArgs {
            handle: 4,
            target: 0,
            format: R8_UNORM,
            bind: BindFlags::CUSTOM.bits(),
            width: 16,
            height: 1,
            depth: 1,
            array_size: 1,
            ..Default::default()
        };
        r.resource_create(&args).unwrap();
        r.attach_resource(1, 4).unwrap();
        // handle, level, usage, stride, layer stride, box
        let mut words = vec![4, 0, 0, 0, 0, 4, 0, 0, 8, 1, 1];
        words.extend([0x0403_0201, 0x0807_0605]);
        r.submit(1, &cmd(Opcode::ResourceInlineWrite, 0, &words)).unwrap();
        let res = r.resource(4).unwrap();
        let res = res.borrow();
        let memory = res.host_memory.as_deref().unwrap();
        assert_eq!(&memory[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn destroying_a_sub_context_drops_its_objects() {
        let mut r = renderer();
        let mut batch = cmd(Opcode::CreateSubCtx, 0, &[2]);
        batch.extend(cmd(Opcode::CreateObject, 1, &[40; 11]));
        batch.extend(cmd(Opcode::SetSubCtx, 0, &[0]));
        batch.extend(cmd(Opcode::DestroySubCtx, 0, &[2]));
        r.submit(1, &batch).unwrap();
        let ctx = &r.contexts[&1];
        assert_eq!(ctx.sub_ids(), vec![0]);
        assert!(ctx.objects.lookup(40, ObjectKind::Blend).is_none());
    }
}
