//! Host platform detection.

/// Supported sandbox hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
}

impl Platform {
    /// Detect the current platform.
    /// All Linux including WSL returns Linux; WSL1 fails `is_supported()`.
    pub fn current() -> Option<Self> {
        #[cfg(target_os = "macos")]
        {
            Some(Platform::MacOS)
        }
        #[cfg(target_os = "linux")]
        {
            Some(Platform::Linux)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }

    /// Check if the current platform is supported.
    /// Returns false for unsupported platforms and WSL1 (no user namespaces).
    pub fn is_supported() -> bool {
        match Self::current() {
            Some(Platform::Linux) => get_wsl_version() != Some("1".to_string()),
            Some(Platform::MacOS) => true,
            None => false,
        }
    }

    /// Get the platform name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::Linux => "Linux",
        }
    }
}

/// Get the current platform, if any.
pub fn current_platform() -> Option<Platform> {
    Platform::current()
}

/// Get the CPU architecture, using the naming the seccomp helper bundle uses.
pub fn get_arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "x64"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        "unknown"
    }
}

/// Get the WSL version if running in WSL.
pub fn get_wsl_version() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let proc_version = std::fs::read_to_string("/proc/version").ok()?;
        parse_wsl_version_from_string(&proc_version)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Parse WSL version from a /proc/version string.
#[cfg(any(target_os = "linux", test))]
fn parse_wsl_version_from_string(proc_version: &str) -> Option<String> {
    let proc_lower = proc_version.to_lowercase();

    if let Some(pos) = proc_lower.find("wsl") {
        let after_wsl = &proc_lower[pos + 3..];
        if let Some(ch) = after_wsl.chars().next() {
            if ch.is_ascii_digit() {
                return Some(ch.to_string());
            }
        }
    }

    // Original WSL1 kernels identify only as "Microsoft".
    if proc_lower.contains("microsoft") {
        return Some("1".to_string());
    }

    None
}
