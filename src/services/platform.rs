/// What the host platform can do for us, resolved once at startup.
///
/// Every platform-dependent branch in the crate reads this descriptor instead of
/// comparing OS names locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// A universally-named interpreter binary (`python3`) can be assumed on PATH.
    /// When false, the default candidate has to be probed for its version.
    pub has_named_default_interpreter: bool,

    /// Spawned workers can lead their own process group, so a single signal
    /// reaches the whole tree.
    pub supports_process_groups: bool,
}

impl PlatformCapabilities {
    /// Detect the capabilities of the platform we were compiled for
    pub fn detect() -> Self {
        Self {
            has_named_default_interpreter: !cfg!(windows),
            supports_process_groups: cfg!(unix),
        }
    }

    /// Default interpreter command on platforms with a universally-named binary
    pub fn named_default_interpreter(&self) -> &'static str {
        "python3"
    }

    /// Candidate probed on the primary platform
    pub fn probe_candidate(&self) -> &'static str {
        "python"
    }

    /// Launcher known to chain to a suitable interpreter when the candidate is too old
    pub fn alternate_launcher(&self) -> &'static str {
        "py"
    }

    /// Command used when nothing else could be determined
    pub fn fallback_interpreter(&self) -> &'static str {
        if self.has_named_default_interpreter {
            self.named_default_interpreter()
        } else {
            self.alternate_launcher()
        }
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}
