//! One client connection: request loop, per-client renderer and fence
//! bookkeeping.

use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vgpuconfig::ServerConfig;
use vrend::caps::CAPS_MAX_VERSION;
use vrend::error::{EEXIST, EFAULT, ESRCH};
use vrend::{
    Backend, IovecSet, RenderError, Renderer, RendererConfig, TextureLimits, TransferDirection,
    TransferInfo,
};

use crate::error::ProtocolError;
use crate::host::{Frontbuffer, HostHooks};
use crate::shm;
use crate::wire::{self, Opcode, Request, ResourceCreateRequest, TransferRequest};

/// Context every client renders into.
pub const CLIENT_CTX_ID: u32 = 1;

/// Builds the backend for a connection's renderer when the client asks for
/// one.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Backend>, RenderError>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn Backend>, RenderError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Backend>, RenderError> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionOptions {
    pub renderer: RendererConfig,
    /// Sleep between fence polls while a client blocks in busy-wait.
    pub busy_wait_poll: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            busy_wait_poll: Duration::from_millis(1),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        let limits = &config.limits;
        Self {
            renderer: RendererConfig {
                texture_limits: TextureLimits {
                    max_2d: limits.max_texture_2d,
                    max_3d: limits.max_texture_3d,
                    max_cube: limits.max_texture_cube,
                },
                max_command_words: limits.max_command_words,
            },
            busy_wait_poll: config.busy_wait_poll,
        }
    }
}

/// Renderer state created by CREATE_RENDERER.
struct Session {
    renderer: Renderer,
    /// Shared-memory backing per resource handle.
    iovecs: HashMap<u32, IovecSet>,
    fence_id: u32,
    last_fence_id: u32,
    frontbuffer: Option<Frontbuffer>,
}

impl Session {
    fn new(backend: Box<dyn Backend>, config: RendererConfig) -> Result<Self, RenderError> {
        let mut renderer = Renderer::new(backend, config)?;
        renderer.create_context(CLIENT_CTX_ID, "client")?;
        Ok(Self {
            renderer,
            iovecs: HashMap::new(),
            fence_id: 0,
            last_fence_id: 0,
            frontbuffer: None,
        })
    }

    fn busy(&self) -> bool {
        self.last_fence_id != self.fence_id
    }

    fn poll_fences(&mut self) {
        if let Some(retired) = self.renderer.check_fences() {
            self.last_fence_id = retired;
        }
        // A fence that could not be created never retires.
        if self.renderer.pending_fences() == 0 {
            self.last_fence_id = self.fence_id;
        }
    }

    fn send_caps(&self, stream: &mut UnixStream) -> Result<(), ProtocolError> {
        let caps = self.renderer.caps();
        let blob = caps.as_bytes();
        wire::write_words(stream, &[blob.len() as u32 + 1, CAPS_MAX_VERSION])?;
        stream.write_all(blob)?;
        Ok(())
    }

    fn resource_create(
        &mut self,
        stream: &mut UnixStream,
        req: &ResourceCreateRequest,
    ) -> Result<(), ProtocolError> {
        let handle = req.args.handle;
        if self.iovecs.contains_key(&handle) {
            return Err(ProtocolError::Status(-EEXIST));
        }

        // The client waits for a descriptor after a sized create, so a
        // rejected resource cannot be reported without ending the stream.
        self.renderer.resource_create(&req.args).map_err(|err| {
            tracing::warn!(handle, %err, "resource creation rejected");
            ProtocolError::status(&err)
        })?;
        self.renderer
            .attach_resource(CLIENT_CTX_ID, handle)
            .map_err(|err| ProtocolError::status(&err))?;

        let (fd, iov) = match NonZeroUsize::new(req.size as usize) {
            None => (None, IovecSet::new(Vec::new())),
            Some(size) => {
                let (fd, mapping) = shm::create(handle, size)?;
                (Some(fd), IovecSet::single(mapping))
            }
        };
        // Attaching seeds the mapping from host memory, so it must happen
        // before the client can write through its copy.
        self.renderer
            .attach_iov(handle, iov.clone())
            .map_err(|err| ProtocolError::status(&err))?;
        self.iovecs.insert(handle, iov);
        if let Some(fd) = fd {
            shm::send_fd(stream.as_fd(), fd.as_fd())?;
        }
        tracing::debug!(handle, size = req.size, "resource created");
        Ok(())
    }

    fn resource_destroy(&mut self, handle: u32) {
        self.renderer.detach_iov(handle);
        self.iovecs.remove(&handle);
        if !self.renderer.resource_unref(handle) {
            tracing::debug!(handle, "destroy of unknown resource");
        }
        if self.frontbuffer.is_some_and(|fb| fb.handle == handle) {
            self.frontbuffer = None;
        }
    }

    fn transfer(
        &mut self,
        req: &TransferRequest,
        direction: TransferDirection,
    ) -> Result<(), ProtocolError> {
        let iov = self
            .iovecs
            .get(&req.handle)
            .ok_or(ProtocolError::Status(-ESRCH))?;
        if direction == TransferDirection::FromHost && req.offset as usize >= iov.size() {
            return Err(ProtocolError::Status(-EFAULT));
        }

        let info = TransferInfo {
            handle: req.handle,
            ctx_id: CLIENT_CTX_ID,
            level: req.level,
            area: req.area,
            offset: u64::from(req.offset),
            context0: true,
            ..TransferInfo::default()
        };
        if let Err(err) = self.renderer.transfer_iov(&info, direction, None) {
            tracing::warn!(handle = req.handle, ?direction, %err, "transfer failed");
        }
        Ok(())
    }

    /// Runs a batch and fences it. Fence ids never wrap, so a client that
    /// exhausts them is dropped before its batch runs.
    fn submit(&mut self, words: &[u32]) -> Result<(), ProtocolError> {
        let fence_id = self
            .fence_id
            .checked_add(1)
            .ok_or(ProtocolError::FenceIdsExhausted)?;
        if let Err(err) = self.renderer.submit(CLIENT_CTX_ID, words) {
            tracing::debug!(words = words.len(), %err, "command batch aborted");
        }
        self.fence_id = fence_id;
        if let Err(err) = self.renderer.create_fence(CLIENT_CTX_ID, fence_id) {
            tracing::error!(fence_id, %err, "failed to create fence");
        }
        Ok(())
    }

    fn busy_wait(
        &mut self,
        stream: &mut UnixStream,
        flags: u32,
        poll: Duration,
    ) -> Result<(), ProtocolError> {
        let wait = flags & wire::BUSY_WAIT_FLAG_WAIT != 0;
        let mut busy = self.busy();
        while busy && wait {
            self.poll_fences();
            busy = self.busy();
            if busy {
                thread::sleep(poll);
            }
        }
        wire::write_words(
            stream,
            &[1, Opcode::ResourceBusyWait as u32, u32::from(busy)],
        )?;
        Ok(())
    }

    /// Presents `handle`, rebinding only when it differs from the last one.
    fn flush_frontbuffer(&mut self, hooks: &mut dyn HostHooks, handle: u32, drawable: u32) {
        let frontbuffer = match self.frontbuffer.filter(|fb| fb.handle == handle) {
            Some(fb) => fb,
            None => {
                let Some(fb) = self.bind_frontbuffer(handle) else {
                    tracing::warn!(handle, drawable, "flush of unknown resource");
                    return;
                };
                tracing::debug!(handle, width = fb.width, height = fb.height, "frontbuffer bound");
                self.frontbuffer = Some(fb);
                fb
            }
        };
        hooks.flush_frontbuffer(drawable, &frontbuffer);
    }

    fn bind_frontbuffer(&self, handle: u32) -> Option<Frontbuffer> {
        let res = self.renderer.resource(handle)?;
        let res = res.borrow();
        Some(Frontbuffer {
            handle,
            width: res.width,
            height: res.height,
            format: res.format.id,
            y_0_top: res.y_0_top,
        })
    }
}

/// A client connection and the renderer it drives.
///
/// Requests are served strictly in order. Dropping the connection tears the
/// renderer down without waiting for outstanding GPU work.
pub struct Connection<H> {
    stream: UnixStream,
    factory: Arc<dyn BackendFactory>,
    hooks: H,
    options: ConnectionOptions,
    session: Option<Session>,
}

impl<H: HostHooks> Connection<H> {
    pub fn new(
        stream: UnixStream,
        factory: Arc<dyn BackendFactory>,
        hooks: H,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            stream,
            factory,
            hooks,
            options,
            session: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Serves requests until the client hangs up or a request fails fatally.
    pub fn run(mut self) -> Result<(), ProtocolError> {
        loop {
            match self.handle_request() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("client hung up");
                    return Ok(());
                }
                Err(err) => {
                    self.hooks.kill_connection(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Reads and serves one request. Returns `false` once the client closed
    /// the socket between requests.
    pub fn handle_request(&mut self) -> Result<bool, ProtocolError> {
        let Some(header) = wire::read_header(&mut self.stream)? else {
            return Ok(false);
        };
        if self.session.is_none() && header.opcode != Opcode::CreateRenderer as u32 {
            return Err(ProtocolError::NotInitialized(header.opcode));
        }
        let request = Request::read(
            &mut self.stream,
            header,
            self.options.renderer.max_command_words,
        )?;
        tracing::trace!(opcode = ?request.opcode(), "request");

        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let backend = self.factory.create().map_err(ProtocolError::Renderer)?;
                let session = Session::new(backend, self.options.renderer)
                    .map_err(ProtocolError::Renderer)?;
                tracing::info!(backend = session.renderer.backend_name(), "renderer created");
                session
            }
        };
        let session = self.session.insert(session);
        session.poll_fences();

        let stream = &mut self.stream;
        match request {
            Request::CreateRenderer => {}
            Request::GetCaps => session.send_caps(stream)?,
            Request::ResourceCreate(req) => session.resource_create(stream, &req)?,
            Request::ResourceDestroy { handle } => session.resource_destroy(handle),
            Request::TransferGet(req) => session.transfer(&req, TransferDirection::FromHost)?,
            Request::TransferPut(req) => session.transfer(&req, TransferDirection::ToHost)?,
            Request::SubmitCmd(words) => session.submit(&words)?,
            Request::ResourceBusyWait { handle: _, flags } => {
                session.busy_wait(stream, flags, self.options.busy_wait_poll)?
            }
            Request::FlushFrontbuffer { handle, drawable } => {
                session.flush_frontbuffer(&mut self.hooks, handle, drawable)
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrend::NullBackend;

    fn session() -> Session {
        Session::new(Box::new(NullBackend::new(0)), RendererConfig::default()).unwrap()
    }

    #[test]
    fn fence_ids_advance_per_submission() {
        let mut session = session();
        session.submit(&[]).unwrap();
        session.submit(&[]).unwrap();
        assert_eq!(session.fence_id, 2);
        session.poll_fences();
        assert!(!session.busy());
    }

    #[test]
    fn last_fence_id_ends_the_connection() {
        let mut session = session();
        session.fence_id = u32::MAX - 1;
        session.last_fence_id = u32::MAX - 1;
        session.submit(&[]).unwrap();
        assert_eq!(session.fence_id, u32::MAX);

        let err = session.submit(&[]).unwrap_err();
        assert!(matches!(err, ProtocolError::FenceIdsExhausted));
        assert_eq!(session.fence_id, u32::MAX);
    }
}
