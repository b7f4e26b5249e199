use std::io;
#[cfg(windows)]
use std::process::Command;
use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    FreeBsd,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else {
            Platform::Other
        }
    }

    /// Platform name as the remote console expects it.
    pub fn wire_name(self) -> &'static str {
        match self {
            Platform::Windows => "win32",
            Platform::Linux => "linux",
            Platform::MacOs => "darwin",
            Platform::FreeBsd => "freebsd",
            Platform::Other => "unknown",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "win32" | "windows" => Some(Platform::Windows),
            "linux" => Some(Platform::Linux),
            "darwin" | "macos" => Some(Platform::MacOs),
            "freebsd" => Some(Platform::FreeBsd),
            _ => None,
        }
    }

    /// Forces `path` to be rooted. Windows paths are left alone since they
    /// carry their own drive prefix.
    pub fn normalize_path(self, path: &str) -> String {
        if self == Platform::Windows || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        }
    }
}

pub trait SessionLocker {
    fn lock(&self) -> io::Result<()>;
}

/// Locks the interactive desktop session of this host.
#[derive(Debug, Default)]
pub struct WorkstationLocker;

impl SessionLocker for WorkstationLocker {
    #[cfg(windows)]
    fn lock(&self) -> io::Result<()> {
        use std::os::windows::process::CommandExt;
        let windir = std::env::var("windir").unwrap_or_else(|_| "C:\\Windows".to_string());
        let mut command = Command::new(format!("{}\\system32\\cmd.exe", windir));
        command.args(["/c", "RunDll32.exe user32.dll,LockWorkStation"]);
        command.creation_flags(CREATE_NO_WINDOW);
        command.spawn()?;
        Ok(())
    }

    #[cfg(not(windows))]
    fn lock(&self) -> io::Result<()> {
        debug!("session lock is not supported on this platform");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_rooted_off_windows() {
        assert_eq!(Platform::Linux.normalize_path("a/b"), "/a/b");
        assert_eq!(Platform::Linux.normalize_path("/a/b"), "/a/b");
        assert_eq!(Platform::MacOs.normalize_path(""), "/");
        assert_eq!(Platform::Windows.normalize_path("C:\\a"), "C:\\a");
        assert_eq!(Platform::Windows.normalize_path("a/b"), "a/b");
    }

    #[test]
    fn wire_names_round_trip() {
        for p in [
            Platform::Windows,
            Platform::Linux,
            Platform::MacOs,
            Platform::FreeBsd,
        ] {
            assert_eq!(Platform::from_wire_name(p.wire_name()), Some(p));
        }
    }
}
