use std::{fs::File, io, path::Path};

/// Moves the calling thread into another network namespace.
pub trait Netns {
    /// Restores the thread's original namespace when dropped.
    type Guard;

    fn enter(&self, path: &Path) -> io::Result<Self::Guard>;
}

/// Enters namespaces with `setns(2)`.
///
/// Namespace membership is a property of the calling thread; callers must hold the guard on a
/// thread that runs nothing else.
#[derive(Copy, Clone, Debug, Default)]
pub struct Setns(());

#[derive(Debug)]
pub struct SetnsGuard {
    original: File,
}

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

// === impl Setns ===

impl Setns {
    pub fn new() -> Self {
        Self(())
    }
}

impl Netns for Setns {
    type Guard = SetnsGuard;

    fn enter(&self, path: &Path) -> io::Result<SetnsGuard> {
        let original = File::open(THREAD_NETNS)?;
        let target = File::open(path)?;
        linux::setns(&target)?;
        tracing::trace!(netns = %path.display(), "Entered");
        Ok(SetnsGuard { original })
    }
}

impl Drop for SetnsGuard {
    fn drop(&mut self) {
        match linux::setns(&self.original) {
            Ok(()) => tracing::trace!("Restored network namespace"),
            Err(error) => tracing::error!(%error, "Failed to restore network namespace"),
        }
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod linux {
    use std::{fs::File, io, os::unix::io::AsRawFd};

    pub(super) fn setns(ns: &File) -> io::Result<()> {
        // Safety: the descriptor is owned by `ns` and remains open for the duration of the call.
        let ret = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod linux {
    use std::{fs::File, io};

    pub(super) fn setns(_: &File) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "network namespaces are only supported on Linux",
        ))
    }
}
