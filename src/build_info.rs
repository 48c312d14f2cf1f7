//! Version details recorded by `build.rs`.

use std::fmt;

/// What `meridian version` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    /// Abbreviated commit, absent when built outside a git checkout.
    pub git_sha: Option<&'static str>,
    /// Tracked files had uncommitted changes.
    pub dirty: bool,
    pub profile: &'static str,
}

impl BuildInfo {
    /// Details of the running binary.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_sha: option_env!("MERIDIAN_GIT_SHA"),
            dirty: option_env!("MERIDIAN_GIT_DIRTY") == Some("1"),
            profile: env!("MERIDIAN_BUILD_PROFILE"),
        }
    }
}

/// `meridian 0.1.0 (1a2b3c4d5, modified) debug`
impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "meridian {}", self.version)?;
        match (self.git_sha, self.dirty) {
            (Some(sha), true) => write!(f, " ({sha}, modified)")?,
            (Some(sha), false) => write!(f, " ({sha})")?,
            (None, _) => {}
        }
        if self.profile != "release" {
            write!(f, " {}", self.profile)?;
        }
        Ok(())
    }
}

/// One-line version banner for the running binary.
#[must_use]
pub fn version_line() -> String {
    BuildInfo::current().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(git_sha: Option<&'static str>, dirty: bool, profile: &'static str) -> BuildInfo {
        BuildInfo {
            version: "0.3.1",
            git_sha,
            dirty,
            profile,
        }
    }

    #[test]
    fn release_build_shows_revision() {
        assert_eq!(
            info(Some("1a2b3c4d5"), false, "release").to_string(),
            "meridian 0.3.1 (1a2b3c4d5)"
        );
    }

    #[test]
    fn modified_debug_build_is_flagged() {
        assert_eq!(
            info(Some("1a2b3c4d5"), true, "debug").to_string(),
            "meridian 0.3.1 (1a2b3c4d5, modified) debug"
        );
    }

    #[test]
    fn missing_revision_is_omitted() {
        assert_eq!(info(None, true, "release").to_string(), "meridian 0.3.1");
    }

    #[test]
    fn current_uses_package_version() {
        let current = BuildInfo::current();
        assert_eq!(current.version, env!("CARGO_PKG_VERSION"));
        assert!(version_line().starts_with("meridian "));
    }
}
