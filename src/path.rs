// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for files that Nixopus reads or
//! manages, without checking whether they exist.

use std::path::{Path, PathBuf};

/// Determine default absolute path to the settings file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/nixopus/config.toml` as the
/// default location. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("nixopus").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Sibling path used to hold the previous version of a file during a write.
pub fn backup_path(path: impl AsRef<Path>) -> PathBuf {
    let mut backup = path.as_ref().as_os_str().to_owned();
    backup.push(".backup");
    PathBuf::from(backup)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test_case("/srv/nixopus/api/.env", "/srv/nixopus/api/.env.backup"; "dotfile")]
    #[test_case("relative/config.env", "relative/config.env.backup"; "relative path")]
    #[test_case("/tmp/x", "/tmp/x.backup"; "no extension")]
    #[test]
    fn backup_path_appends_suffix(path: &str, expect: &str) {
        assert_eq!(backup_path(path), PathBuf::from(expect));
    }
}
