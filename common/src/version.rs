//! Build identification logged at startup.

/// Package version plus, for builds from a git checkout, `git describe` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    pub semantic: &'static str,
    /// e.g. "v0.3.1-7-g644da27-dirty", set by build.rs
    pub git_describe: Option<&'static str>,
}

impl BuildVersion {
    pub const fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION"),
            git_describe: option_env!("SFTP_PUBLISH_GIT_DESCRIBE"),
        }
    }
}

/// ```
/// use common::version::BuildVersion;
///
/// let v = BuildVersion {
///     semantic: "0.4.0",
///     git_describe: Some("v0.3.1-7-g644da27"),
/// };
/// assert_eq!(v.to_string(), "0.4.0 (v0.3.1-7-g644da27)");
/// ```
impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.git_describe {
            Some(describe) => write!(f, "{} ({describe})", self.semantic),
            None => write!(f, "{}", self.semantic),
        }
    }
}
