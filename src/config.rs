use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Folder holding the mod archives and the modlist.json store.
    pub mods_folder: PathBuf,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub curseforge_key: Option<String>,
    /// Subdirectory of the mods folder that the scanner never descends into.
    #[serde(default = "default_ignored_dir")]
    pub ignored_dir: String,
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig {
            mods_folder: PathBuf::from("."),
            github_token: None,
            curseforge_key: None,
            ignored_dir: default_ignored_dir(),
            scan_depth: default_scan_depth(),
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }
}

fn default_ignored_dir() -> String {
    "ignored".to_string()
}

fn default_scan_depth() -> usize {
    3
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modvault"))
}
