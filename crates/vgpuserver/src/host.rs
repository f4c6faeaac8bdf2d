use crate::error::ProtocolError;

/// The resource a client last presented, as bound for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontbuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    /// Virgl format id of the resource.
    pub format: u32,
    /// Row 0 is the top of the image rather than the bottom.
    pub y_0_top: bool,
}

/// Upcalls from a connection into whatever embeds the server.
///
/// Each connection owns its hooks, so implementations never see two clients
/// at once.
pub trait HostHooks {
    /// Present `frontbuffer` on the host drawable `drawable`.
    fn flush_frontbuffer(&mut self, drawable: u32, frontbuffer: &Frontbuffer);

    /// The connection is about to be torn down because of `reason`.
    fn kill_connection(&mut self, reason: &ProtocolError) {
        let _ = reason;
    }
}

/// Hooks for a server without a presenter: flushes are only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl HostHooks for LogHooks {
    fn flush_frontbuffer(&mut self, drawable: u32, frontbuffer: &Frontbuffer) {
        tracing::debug!(
            drawable,
            handle = frontbuffer.handle,
            width = frontbuffer.width,
            height = frontbuffer.height,
            "flush frontbuffer"
        );
    }

    fn kill_connection(&mut self, reason: &ProtocolError) {
        tracing::warn!(%reason, "killing connection");
    }
}
