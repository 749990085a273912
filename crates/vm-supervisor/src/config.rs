use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{SupervisorError, SupervisorResult};

/// Share tag used for the host home directory.
pub const HOME_SHARE_TAG: &str = "user-home";

/// Boot settings read from a JSON file. Every field is optional; command
/// line flags override whatever is set here.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub cpus: Option<u32>,
    /// Memory size in MiB.
    pub memory: Option<u64>,
    /// Share the user's home directory with the guest as `user-home`.
    pub share_home: bool,
    /// MAC address of the default NAT network device.
    pub mac: Option<String>,
    pub kernel: Option<PathBuf>,
    pub cmdline: Option<String>,
    pub initrd: Option<PathBuf>,
}

/// Load a boot config from a JSON file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> SupervisorResult<BootConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SupervisorError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: BootConfig = serde_json::from_str(&content)
        .map_err(|e| SupervisorError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

impl BootConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        if let Some(kernel) = &mut self.kernel {
            resolve(kernel);
        }
        if let Some(initrd) = &mut self.initrd {
            resolve(initrd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot_config.json");
        tokio::fs::write(
            &path,
            r#"{
                "cpus": 4,
                "memory": 2048,
                "share_home": true,
                "mac": "52:54:00:12:34:56",
                "kernel": "vmlinuz",
                "cmdline": "console=hvc0 root=/dev/vda",
                "initrd": "/boot/initrd.img"
            }"#,
        )
        .await
        .unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(
            config,
            BootConfig {
                cpus: Some(4),
                memory: Some(2048),
                share_home: true,
                mac: Some("52:54:00:12:34:56".into()),
                kernel: Some(dir.path().join("vmlinuz")),
                cmdline: Some("console=hvc0 root=/dev/vda".into()),
                initrd: Some(PathBuf::from("/boot/initrd.img")),
            }
        );
    }

    #[tokio::test]
    async fn empty_object_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot_config.json");
        tokio::fs::write(&path, "{}").await.unwrap();

        assert_eq!(load(&path).await.unwrap(), BootConfig::default());
    }

    #[tokio::test]
    async fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot_config.json");
        tokio::fs::write(&path, r#"{"cpus": "many"}"#).await.unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "got {err}");
    }
}
