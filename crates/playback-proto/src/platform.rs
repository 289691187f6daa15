use std::path::PathBuf;

/// Default TCP port of the observer sync server.
pub const SYNC_TCP_PORT: u16 = 9877;

const SYNC_TCP_HOST: &str = "127.0.0.1";

/// Sub-directory name used under the data / config roots.
const APP_DIR: &str = "playback";

pub fn sync_address() -> String {
    format!("{}:{}", SYNC_TCP_HOST, SYNC_TCP_PORT)
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/playback/ (XDG standard)
    // instead of macOS Application Support for consistency
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        // Portable layout: a `data` directory beside the executable wins
        if let Some(dir) = beside_exe("data") {
            return dir;
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(exe_dir) = beside_exe("config.toml").and_then(|p| p.parent().map(Into::into)) {
            return exe_dir;
        }
    }

    // On macOS and Linux, always use ~/.config/playback/
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(windows)]
fn beside_exe(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let candidate = exe_path.parent()?.join(name);
    candidate.exists().then_some(candidate)
}
