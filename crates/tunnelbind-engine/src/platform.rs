//! Platform detection and the engine support matrix
//!
//! Maps `{os, arch, libc}` to exactly one engine artifact through a lookup
//! table so the supported set can be audited and tested in isolation.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::loader::LoadError;

/// C library flavor (Linux only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Libc {
    Gnu,
    Musl,
}

impl Libc {
    /// Classify a dynamic-linker (`ldd`) binary by searching it for a musl signature
    pub fn from_linker_bytes(bytes: &[u8]) -> Libc {
        if bytes.windows(4).any(|w| w == b"musl") {
            Libc::Musl
        } else {
            Libc::Gnu
        }
    }
}

impl fmt::Display for Libc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Libc::Gnu => f.write_str("gnu"),
            Libc::Musl => f.write_str("musl"),
        }
    }
}

/// The `{os, arch, libc}` tuple an artifact is selected for.
///
/// `os` and `arch` use the names from [`std::env::consts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub libc: Option<Libc>,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>, libc: Option<Libc>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            libc,
        }
    }

    /// The platform of the running process
    pub fn current() -> Self {
        let os = std::env::consts::OS;
        let libc = if os == "linux" {
            Some(detect_libc())
        } else {
            None
        };
        Self::new(os, std::env::consts::ARCH, libc)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)?;
        if let Some(libc) = self.libc {
            write!(f, "-{}", libc)?;
        }
        Ok(())
    }
}

/// A platform-specific engine artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub name: &'static str,
    os: &'static str,
}

impl Artifact {
    /// File name of the bundled artifact, e.g. `tunnelbind-engine.linux-x64-gnu.so`
    pub fn file_name(&self) -> String {
        let ext = match self.os {
            "windows" => "dll",
            "macos" => "dylib",
            _ => "so",
        };
        format!("tunnelbind-engine.{}.{}", self.name, ext)
    }

    /// Name of the separately installed package providing this artifact
    pub fn package_name(&self) -> String {
        format!("tunnelbind-engine-{}", self.name)
    }
}

/// Preferred artifact on macOS, tried before the architecture-specific one
pub const DARWIN_UNIVERSAL: Artifact = Artifact {
    name: "darwin-universal",
    os: "macos",
};

struct MatrixEntry {
    os: &'static str,
    arch: &'static str,
    libc: Option<Libc>,
    artifact: &'static str,
}

const fn entry(
    os: &'static str,
    arch: &'static str,
    libc: Option<Libc>,
    artifact: &'static str,
) -> MatrixEntry {
    MatrixEntry {
        os,
        arch,
        libc,
        artifact,
    }
}

/// Every supported `{os, arch, libc}` tuple
const SUPPORT_MATRIX: &[MatrixEntry] = &[
    entry("android", "aarch64", None, "android-arm64"),
    entry("android", "arm", None, "android-arm-eabi"),
    entry("windows", "x86_64", None, "win32-x64-msvc"),
    entry("windows", "x86", None, "win32-ia32-msvc"),
    entry("windows", "aarch64", None, "win32-arm64-msvc"),
    entry("macos", "x86_64", None, "darwin-x64"),
    entry("macos", "aarch64", None, "darwin-arm64"),
    entry("freebsd", "x86_64", None, "freebsd-x64"),
    entry("linux", "x86_64", Some(Libc::Gnu), "linux-x64-gnu"),
    entry("linux", "x86_64", Some(Libc::Musl), "linux-x64-musl"),
    entry("linux", "aarch64", Some(Libc::Gnu), "linux-arm64-gnu"),
    entry("linux", "aarch64", Some(Libc::Musl), "linux-arm64-musl"),
    entry("linux", "arm", None, "linux-arm-gnueabihf"),
];

fn os_display_name(os: &str) -> &str {
    match os {
        "android" => "Android",
        "windows" => "Windows",
        "macos" => "macOS",
        "freebsd" => "FreeBSD",
        "linux" => "Linux",
        other => other,
    }
}

/// Select the single artifact for `platform`.
///
/// Linux entries that distinguish libc use `platform.libc`, defaulting to gnu
/// when it is unknown.
pub fn select_artifact(platform: &Platform) -> Result<Artifact, LoadError> {
    let mut os_known = false;
    for e in SUPPORT_MATRIX.iter().filter(|e| e.os == platform.os) {
        os_known = true;
        if e.arch != platform.arch {
            continue;
        }
        let libc_matches = match e.libc {
            None => true,
            Some(libc) => platform.libc.unwrap_or(Libc::Gnu) == libc,
        };
        if libc_matches {
            return Ok(Artifact {
                name: e.artifact,
                os: e.os,
            });
        }
    }

    if os_known {
        Err(LoadError::UnsupportedArch {
            os: os_display_name(&platform.os).to_string(),
            arch: platform.arch.clone(),
        })
    } else {
        Err(LoadError::UnsupportedOs {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        })
    }
}

/// Artifacts to try, in order, for `platform`
pub fn candidate_artifacts(platform: &Platform) -> Result<Vec<Artifact>, LoadError> {
    let selected = select_artifact(platform)?;
    if platform.os == "macos" {
        Ok(vec![DARWIN_UNIVERSAL, selected])
    } else {
        Ok(vec![selected])
    }
}

/// Detect the C library of the running process.
///
/// The process's own libc is known at build time; when the target does not
/// say, the `ldd` binary on `PATH` is searched for a musl signature. An
/// unreadable linker is treated as musl.
pub fn detect_libc() -> Libc {
    if cfg!(target_env = "musl") {
        return Libc::Musl;
    }
    if cfg!(target_env = "gnu") {
        return Libc::Gnu;
    }

    match find_in_path("ldd").map(std::fs::read) {
        Some(Ok(bytes)) => Libc::from_linker_bytes(&bytes),
        _ => Libc::Musl,
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_file(candidate))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
