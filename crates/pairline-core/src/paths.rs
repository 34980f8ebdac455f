//! Well-known filesystem locations.

use std::env;
use std::path::PathBuf;

/// Directory under the home directory holding all pairline state.
const APP_DIR: &str = ".pairline";

/// The user's home directory: `HOME`, falling back to `USERPROFILE` on Windows.
pub fn home_dir() -> Option<PathBuf> {
    home_dir_from(|key| env::var(key).ok())
}

fn home_dir_from(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(lookup)
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Default root for per-identity session directories: `~/.pairline/sessions`.
pub fn default_session_root() -> Result<PathBuf, String> {
    home_dir()
        .map(|home| session_root_under(&home))
        .ok_or_else(|| "Home directory not set".to_string())
}

fn session_root_under(home: &std::path::Path) -> PathBuf {
    home.join(APP_DIR).join("sessions")
}
