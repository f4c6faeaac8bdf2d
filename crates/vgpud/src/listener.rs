use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use vgpuserver::{BackendFactory, Connection, ConnectionOptions, LogHooks};

/// The listening socket. The socket file is removed again on drop.
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener {
    /// Binds `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Ok(meta) = fs::symlink_metadata(path) {
            if !meta.file_type().is_socket() {
                bail!("{} exists and is not a socket", path.display());
            }
            if UnixStream::connect(path).is_ok() {
                bail!("another server is already listening on {}", path.display());
            }
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            tracing::debug!(path = %path.display(), "removed stale socket");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        tracing::info!(path = %path.display(), "listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accepts clients forever, one thread each, refusing clients beyond
    /// `max_connections`.
    pub fn serve(
        &self,
        factory: Arc<dyn BackendFactory>,
        options: ConnectionOptions,
        max_connections: usize,
    ) -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let mut next_id: u64 = 1;

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };

            if active.load(Ordering::SeqCst) >= max_connections {
                tracing::warn!(max_connections, "connection limit reached; refusing client");
                drop(stream);
                continue;
            }

            let id = next_id;
            next_id += 1;
            let slot = ActiveSlot::claim(&active);
            let factory = Arc::clone(&factory);
            thread::Builder::new()
                .name(format!("vgpud-conn-{id}"))
                .spawn(move || {
                    let _slot = slot;
                    let span = tracing::info_span!("conn", id);
                    let _enter = span.enter();
                    tracing::info!("client connected");
                    match Connection::new(stream, factory, LogHooks, options).run() {
                        Ok(()) => tracing::info!("client disconnected"),
                        Err(err) => tracing::info!(%err, "client dropped"),
                    }
                })
                .context("failed to spawn connection thread")?;
        }
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(%err, path = %self.path.display(), "failed to remove socket");
        }
    }
}

/// Counts a live connection until dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn claim(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
