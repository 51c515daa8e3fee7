//! Build metadata shown in the version panel.
//!
//! Values come from compile-time environment variables so release builds can
//! stamp them without touching the source.

/// Build metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub date: &'static str,
    pub built_by: &'static str,
}

pub const VERSION: &str = match option_env!("SOCKS5_UDP_CHECKER_VERSION") {
    Some(v) => v,
    None => "dev",
};

pub const COMMIT: &str = match option_env!("SOCKS5_UDP_CHECKER_COMMIT") {
    Some(v) => v,
    None => "none",
};

pub const DATE: &str = match option_env!("SOCKS5_UDP_CHECKER_DATE") {
    Some(v) => v,
    None => "unknown",
};

pub const BUILT_BY: &str = match option_env!("SOCKS5_UDP_CHECKER_BUILT_BY") {
    Some(v) => v,
    None => "unknown",
};

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: VERSION,
            commit: COMMIT,
            date: DATE,
            built_by: BUILT_BY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_never_empty() {
        let info = VersionInfo::default();
        assert!(!info.version.is_empty());
        assert!(!info.commit.is_empty());
        assert!(!info.date.is_empty());
        assert!(!info.built_by.is_empty());
    }
}
