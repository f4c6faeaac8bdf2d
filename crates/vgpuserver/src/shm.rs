//! Anonymous shared memory handed to clients as resource backing.
//!
//! The server creates a sealable memfd per resource, maps it, passes the file
//! descriptor over the socket and keeps only the mapping. The client maps the
//! same pages, so guest writes are visible to transfers without a copy.

use std::ffi::{c_void, CString};
use std::io::IoSlice;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::slice;

use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::unistd::ftruncate;
use vrend::IoSpan;

/// A shared read/write mapping, unmapped on drop.
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: NonZeroUsize,
}

impl IoSpan for Mapping {
    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping stays valid until drop and is `len` bytes long.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len.get()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` keeps server-side access exclusive.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len.get()) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from mmap with this length and is not used again.
        if let Err(err) = unsafe { munmap(self.ptr, self.len.get()) } {
            tracing::warn!(%err, len = self.len.get(), "munmap failed");
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

/// Creates `size` bytes of memfd-backed memory named after `handle` and maps
/// it. The returned descriptor is meant to be sent to the client and closed.
pub fn create(handle: u32, size: NonZeroUsize) -> Result<(OwnedFd, Mapping), Errno> {
    let name = CString::new(format!("virgl-res-{handle}")).map_err(|_| Errno::EINVAL)?;
    let fd = memfd_create(
        name.as_c_str(),
        MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
    )?;
    let len = nix::libc::off_t::try_from(size.get()).map_err(|_| Errno::EINVAL)?;
    ftruncate(&fd, len)?;

    // SAFETY: a fresh shared mapping of a file we own; nothing aliases it yet.
    let ptr = unsafe {
        mmap(
            None,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            &fd,
            0,
        )
    }
    .map_err(|_| Errno::ENOMEM)?;

    Ok((fd, Mapping { ptr, len: size }))
}

/// Sends `fd` as `SCM_RIGHTS` ancillary data with a one-byte payload.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<(), Errno> {
    let payload = [0u8];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map(|_| ())
        .map_err(|_| Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    use super::*;

    #[test]
    fn mapping_and_descriptor_share_pages() {
        let size = NonZeroUsize::new(4096).unwrap();
        let (fd, mut mapping) = create(7, size).unwrap();
        assert_eq!(mapping.len(), 4096);
        mapping.bytes_mut()[..4].copy_from_slice(b"virg");

        let mut file = File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut head = [0u8; 4];
        file.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"virg");
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }
}
