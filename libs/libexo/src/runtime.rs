//! Per-process library state.
//!
//! Process-wide library state (`thisenv`, the installed fault handler)
//! is held here explicitly. A process builds one [`Runtime`] at startup and
//! threads it through every call that needs it.

use crate::syscall::Platform;
use crate::types::EnvId;

/// Which fault handler this process has registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    /// One the application supplied.
    Custom,
    /// The copy-on-write handler.
    Cow,
}

/// Library state for one process.
pub struct Runtime<P: Platform> {
    pub(crate) sys: P,
    thisenv: EnvId,
    pub(crate) handler: Option<Handler>,
}

impl<P: Platform> Runtime<P> {
    /// Set up the runtime for a process that has just started running.
    pub fn bootstrap(sys: P) -> Self {
        let thisenv = sys.getenvid();
        log::debug!("[{}] runtime up", thisenv);
        Self {
            sys,
            thisenv,
            handler: None,
        }
    }

    /// Kernel handle of this process.
    pub fn sys(&self) -> &P {
        &self.sys
    }

    /// Cached identifier of this process.
    pub fn thisenv(&self) -> EnvId {
        self.thisenv
    }

    /// Re-read this process's identifier from the kernel.
    ///
    /// A freshly forked child starts with its parent's cached value; fork
    /// calls this on the child side before returning.
    pub fn refresh_thisenv(&mut self) {
        self.thisenv = self.sys.getenvid();
    }

    /// Whether the copy-on-write handler is the registered fault handler.
    pub fn cow_handler_installed(&self) -> bool {
        self.handler == Some(Handler::Cow)
    }

    /// This runtime's state as a freshly created child sees it.
    ///
    /// The child's memory is a copy of the parent's, so it starts with the
    /// parent's runtime verbatim (including the stale `thisenv`) bound to
    /// its own kernel handle. Its first [`fork`](Runtime::fork) returns
    /// [`ForkResult::Child`](crate::ForkResult::Child) and corrects the cache.
    pub fn duplicate_for(&self, sys: P) -> Self {
        Self {
            sys,
            thisenv: self.thisenv,
            handler: self.handler,
        }
    }
}
