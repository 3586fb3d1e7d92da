use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use auto_launch::AutoLaunchBuilder;

const APP_NAME: &str = "NVR Viewer";

/// Absolute form of the config path, so the autostart entry works no matter
/// which directory the session starts it from.
fn pinned_config_path(config_path: &Path) -> Result<PathBuf> {
    if config_path.is_absolute() {
        return Ok(config_path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(config_path))
}

fn autostart_args(config_path: &Path) -> Result<Vec<String>> {
    let pinned = pinned_config_path(config_path)?;
    Ok(vec!["--config".to_string(), pinned.to_string_lossy().to_string()])
}

/// Get the AutoLaunch instance for this app
fn get_auto_launch(config_path: &Path) -> Result<auto_launch::AutoLaunch> {
    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    let app_path = current_exe.to_string_lossy().to_string();
    let args = autostart_args(config_path)?;

    let mut builder = AutoLaunchBuilder::new();
    builder
        .set_app_name(APP_NAME)
        .set_app_path(&app_path)
        .set_args(&args);

    builder.build().context("Failed to create AutoLaunch instance")
}

/// Check if the viewer is registered to start with the desktop session
pub fn is_enabled(config_path: &Path) -> bool {
    match get_auto_launch(config_path) {
        Ok(auto_launch) => auto_launch.is_enabled().unwrap_or(false),
        Err(e) => {
            log::warn!("Failed to check autostart status: {}", e);
            false
        }
    }
}

/// Register or remove the autostart entry
pub fn set_enabled(config_path: &Path, enabled: bool) -> Result<()> {
    let auto_launch = get_auto_launch(config_path)?;

    if enabled {
        auto_launch.enable().context("Failed to enable autostart")?;
        log::info!(
            "Autostart enabled (config {:?})",
            pinned_config_path(config_path)?
        );
    } else {
        auto_launch.disable().context("Failed to disable autostart")?;
        log::info!("Autostart disabled");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_config_is_pinned_to_cwd() {
        let args = autostart_args(Path::new("nvr_config.json")).unwrap();
        assert_eq!(args[0], "--config");
        let pinned = PathBuf::from(&args[1]);
        assert!(pinned.is_absolute());
        assert!(pinned.ends_with("nvr_config.json"));
    }

    #[test]
    fn test_absolute_config_is_kept() {
        let path = std::env::temp_dir().join("viewer.json");
        let args = autostart_args(&path).unwrap();
        assert_eq!(PathBuf::from(&args[1]), path);
    }
}
