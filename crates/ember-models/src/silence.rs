//! Scoped suppression of native initialization output.
//!
//! Native inference engines print device and tensor diagnostics straight to file descriptors 1
//! and 2 while a model loads. [`StdioSilencer`] points both descriptors at the null device for as
//! long as the guard is alive and restores the original targets when it is dropped, including
//! during unwinding.
//!
//! Redirection is process-wide, so guards are serialized through a global lock: a second
//! silencer on another thread waits until the first one has restored the streams.

use std::io::{self, Write};

#[cfg(unix)]
static REDIRECT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Guard that redirects process stdout and stderr to the null device.
#[derive(Debug)]
#[must_use = "streams are restored as soon as the silencer is dropped"]
pub struct StdioSilencer {
    #[cfg(unix)]
    saved: Option<SavedStreams>,
}

#[cfg(unix)]
#[derive(Debug)]
struct SavedStreams {
    stdout: std::os::fd::OwnedFd,
    stderr: std::os::fd::OwnedFd,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl StdioSilencer {
    /// Redirects stdout and stderr to the null device.
    ///
    /// Pending buffered output is flushed to the real streams first.
    ///
    /// # Errors
    /// Returns an I/O error if the null device cannot be opened or a descriptor cannot be
    /// duplicated. On error the streams are left untouched.
    #[cfg(unix)]
    pub fn engage() -> io::Result<Self> {
        use nix::unistd::{dup, dup2_stderr, dup2_stdout};
        use std::sync::PoisonError;

        let lock = REDIRECT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        flush_std_streams();

        let devnull = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
        let stdout = dup(io::stdout()).map_err(io::Error::from)?;
        let stderr = dup(io::stderr()).map_err(io::Error::from)?;

        dup2_stdout(&devnull).map_err(io::Error::from)?;
        if let Err(e) = dup2_stderr(&devnull) {
            let _ = dup2_stdout(&stdout);
            return Err(io::Error::from(e));
        }

        Ok(Self {
            saved: Some(SavedStreams {
                stdout,
                stderr,
                _lock: lock,
            }),
        })
    }

    /// No-op on platforms without file-descriptor redirection.
    #[cfg(not(unix))]
    pub fn engage() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Engages the silencer unless `verbose` is set.
    ///
    /// A failure to redirect is logged and initialization proceeds with the streams untouched.
    pub fn unless_verbose(verbose: bool) -> Option<Self> {
        if verbose {
            return None;
        }
        match Self::engage() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Could not suppress native output, continuing verbosely"
                );
                None
            }
        }
    }

    /// Whether the streams are currently redirected by this guard.
    pub fn is_engaged(&self) -> bool {
        #[cfg(unix)]
        {
            self.saved.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    #[cfg(unix)]
    fn restore(&mut self) {
        use nix::unistd::{dup2_stderr, dup2_stdout};

        if let Some(saved) = self.saved.take() {
            flush_std_streams();
            let stdout_result = dup2_stdout(&saved.stdout);
            let stderr_result = dup2_stderr(&saved.stderr);
            if let Err(e) = stdout_result.and(stderr_result) {
                tracing::error!(
                    error = %e,
                    "Failed to restore stdout/stderr after native initialization"
                );
            }
        }
    }
}

impl Drop for StdioSilencer {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.restore();
    }
}

fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}
