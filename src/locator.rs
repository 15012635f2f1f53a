//! Locate the debugger executable.
//!
//! A configured path wins when it exists. Otherwise each well-known install
//! root is probed for architecture subdirectories in an order derived from
//! the host architecture, so an ARM64 host prefers the arm64 debugger but
//! falls back to the emulated x64/x86 ones. Pure function of the filesystem
//! capability; no global state.

use crate::error::{EngineError, EngineResult};
use crate::sys::Filesystem;
use std::path::{Path, PathBuf};

/// Host architectures the debugger ships for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsArch {
    X86,
    X64,
    Arm64,
}

impl OsArch {
    /// The architecture of the running host.
    #[must_use]
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Self::Arm64,
            "x86" => Self::X86,
            _ => Self::X64,
        }
    }

    /// Subdirectory names probed under each install root, best first.
    #[must_use]
    fn subdir_priority(self) -> &'static [&'static str] {
        match self {
            Self::Arm64 => &["arm64", "x64", "x86"],
            Self::X64 => &["x64", "x86"],
            Self::X86 => &["x86"],
        }
    }
}

/// Resolve an absolute path to `tool` (e.g. `cdb.exe`).
///
/// Returns the configured path unmodified when it exists on disk; otherwise
/// the first existing `root/arch/tool` in root order, arch-priority order
/// within each root. Fails with [`EngineError::ToolNotFound`] when nothing
/// matches.
pub fn find_tool_path(
    fs: &dyn Filesystem,
    tool: &str,
    configured_path: Option<&Path>,
    os_arch: OsArch,
    install_roots: &[PathBuf],
) -> EngineResult<PathBuf> {
    if let Some(configured) = configured_path {
        if fs.exists(configured) {
            return Ok(configured.to_path_buf());
        }
        tracing::warn!(
            path = %configured.display(),
            "configured debugger path does not exist, falling back to install roots"
        );
    }

    for root in install_roots {
        for arch in os_arch.subdir_priority() {
            let candidate = root.join(arch).join(tool);
            if fs.exists(&candidate) {
                tracing::debug!(path = %candidate.display(), "located debugger");
                return Ok(candidate);
            }
        }
    }

    Err(EngineError::ToolNotFound(tool.to_string()))
}
