//! Default value functions for configuration.
//!
//! Each function backs a `#[serde(default = "crate::defaults::...")]`
//! attribute on a `Config` field.

/// Environment variable that overrides tmux binary discovery.
pub const TMUX_BIN_ENV: &str = "DEVHAVEN_TMUX_BIN";

/// Well-known install locations checked when `PATH` does not contain tmux
/// (e.g. GUI apps launched from Finder inherit a minimal `PATH`).
const TMUX_FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin/tmux", // Homebrew on Apple Silicon
    "/usr/local/bin/tmux",    // Homebrew on Intel / manual install
    "/opt/local/bin/tmux",    // MacPorts
    "/usr/bin/tmux",          // Most Linux distros
    "/snap/bin/tmux",         // Snap package
];

pub fn tmux_path() -> String {
    if let Ok(configured) = std::env::var(TMUX_BIN_ENV) {
        let configured = configured.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
    }

    if let Ok(path_env) = std::env::var("PATH") {
        let separator = if cfg!(windows) { ';' } else { ':' };
        let executable = if cfg!(windows) { "tmux.exe" } else { "tmux" };

        for dir in path_env.split(separator).filter(|d| !d.is_empty()) {
            let candidate = std::path::Path::new(dir).join(executable);
            if candidate.is_file() {
                return candidate.to_string_lossy().to_string();
            }
        }
    }

    for path in TMUX_FALLBACK_PATHS {
        if std::path::Path::new(path).is_file() {
            return path.to_string();
        }
    }

    // Final fallback - let the OS try to find it
    "tmux".to_string()
}

pub fn output_buffer_limit() -> usize {
    200_000
}

pub fn refresh_debounce_ms() -> u64 {
    75
}

pub fn command_timeout_ms() -> u64 {
    2_500
}

pub fn pause_after_secs() -> u32 {
    5
}

pub fn history_limit() -> u32 {
    200_000
}

pub fn pane_border_style() -> String {
    "fg=#586e75,bg=default".to_string()
}

pub fn pane_active_border_style() -> String {
    "fg=#268bd2,bg=default".to_string()
}

pub fn session_prefix() -> String {
    "devhaven".to_string()
}
