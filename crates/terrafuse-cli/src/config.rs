//! Configuration vault – reads/writes `~/.terrafuse/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use terrafuse_map::{MapConfig, StorageConfig};

/// Persisted settings of the `terrafuse` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Frame the sensor is mounted in (used in log output).
    #[serde(default = "default_robot_frame")]
    pub robot_frame: String,

    /// Terrain frame the map is built in.
    #[serde(default = "default_fixed_frame")]
    pub fixed_frame: String,

    #[serde(default)]
    pub map: MapConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_robot_frame() -> String {
    "base_link".to_string()
}
fn default_fixed_frame() -> String {
    "world".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            robot_frame: default_robot_frame(),
            fixed_frame: default_fixed_frame(),
            map: MapConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Return the path to `~/.terrafuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".terrafuse").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config at `path`, falling back to defaults (plus environment
/// overrides) when it does not exist, and validate the map section.
pub fn resolve(path: &Path) -> Result<Config, String> {
    let cfg = match load_from(path)? {
        Some(cfg) => cfg,
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };
    cfg.map.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

/// Apply `TERRAFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TERRAFUSE_MAP_ROOT` | `storage.root` |
/// | `TERRAFUSE_VARIANCE_THRESHOLD` | `map.variance_threshold` |
/// | `TERRAFUSE_SWAP_WINDOW` | `map.swap_window` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("TERRAFUSE_MAP_ROOT") {
        cfg.storage.root = PathBuf::from(v);
    }
    if let Some(v) = lookup("TERRAFUSE_VARIANCE_THRESHOLD")
        && let Ok(threshold) = v.parse::<f32>()
    {
        cfg.map.variance_threshold = threshold;
    }
    if let Some(v) = lookup("TERRAFUSE_SWAP_WINDOW")
        && let Ok(window) = v.parse::<usize>()
    {
        cfg.map.swap_window = window;
    }
}

/// Save the config to a specific path, creating its directory with
/// owner-only permissions on Unix.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
