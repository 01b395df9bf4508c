use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const REQUIRED_BASE_TAG: &str = "REQUIRED_BASE";
pub const ARCHIVE_EXT: &str = "jar";
pub const DISABLED_SUFFIX: &str = ".disabled";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModRecord {
    pub id: String,
    pub file_path: PathBuf,
    pub other_ids: Vec<String>,
    pub tags: Vec<String>,
    pub source: String,
    pub notes: String,
    pub wants: Vec<String>,
    pub wanted_by: Vec<String>,
    pub enabled: bool,
    pub update_state: UpdateState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModRecord {
    /// Fresh record built from the immutable default template. Every new
    /// record is a deep clone of this shape, never a shared reference.
    pub fn with_defaults(id: &str) -> Self {
        ModRecord {
            id: id.to_string(),
            file_path: PathBuf::new(),
            other_ids: Vec::new(),
            tags: Vec::new(),
            source: String::new(),
            notes: String::new(),
            wants: Vec::new(),
            wanted_by: Vec::new(),
            enabled: true,
            update_state: UpdateState::default(),
            extra: Map::new(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// True when `candidate` names this record itself: same id case-folded,
    /// or one of the record's alternate ids.
    pub fn is_alias(&self, candidate: &str) -> bool {
        candidate.eq_ignore_ascii_case(&self.id)
            || self
                .other_ids
                .iter()
                .any(|other| other.eq_ignore_ascii_case(candidate))
    }

    pub fn source_type(&self) -> SourceType {
        SourceType::from_url(&self.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateState {
    pub version: String,
    pub disable_check: bool,
    pub frequency: UpdateFrequency,
    pub last_status: String,
    pub last_updated_at: String,
    pub file_pattern: String,
}

impl Default for UpdateState {
    fn default() -> Self {
        UpdateState {
            version: String::new(),
            disable_check: false,
            frequency: UpdateFrequency::Common,
            last_status: String::new(),
            last_updated_at: String::new(),
            file_pattern: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateFrequency {
    Common,
    Rare,
    Eol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    GhRelease,
    Curseforge,
    Modrinth,
    Other,
}

impl SourceType {
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("github.com") {
            SourceType::GhRelease
        } else if lower.contains("curseforge.com") {
            SourceType::Curseforge
        } else if lower.contains("modrinth.com") {
            SourceType::Modrinth
        } else {
            SourceType::Other
        }
    }
}

/// In-memory registry: mod id -> record, keys kept sorted so the persisted
/// store diffs cleanly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    pub mods: BTreeMap<String, ModRecord>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Registry::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read mod store {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse mod store {}", path.display()))?;
        let Value::Object(entries) = value else {
            anyhow::bail!("mod store {} is not a JSON object", path.display());
        };

        let mut mods = BTreeMap::new();
        for (id, mut entry) in entries {
            fill_record_defaults(&id, &mut entry);
            let record: ModRecord = serde_json::from_value(entry)
                .with_context(|| format!("parse record for {id}"))?;
            mods.insert(id, record);
        }
        Ok(Registry { mods })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.mods).context("serialize mod store")?;
        fs::write(path, raw)
            .with_context(|| format!("write mod store {}", path.display()))?;
        Ok(())
    }

    pub fn ordered_ids(&self) -> Vec<String> {
        self.mods.keys().cloned().collect()
    }

    /// Two-stage alias lookup: exact id, case-insensitive id, then
    /// case-insensitive match against any record's alternate ids. Returns
    /// the canonical id of the matching record.
    pub fn resolve_id(&self, raw: &str) -> Option<String> {
        if self.mods.contains_key(raw) {
            return Some(raw.to_string());
        }
        if let Some(id) = self
            .mods
            .keys()
            .find(|id| id.eq_ignore_ascii_case(raw))
        {
            return Some(id.clone());
        }
        self.mods
            .values()
            .find(|record| {
                record
                    .other_ids
                    .iter()
                    .any(|other| other.eq_ignore_ascii_case(raw))
            })
            .map(|record| record.id.clone())
    }
}

/// Backfill every missing field of a stored record from the default
/// template, including nested `update_state` sub-fields. The frequency
/// default depends on the source URL, so it is patched after the generic
/// merge when the stored record never carried one.
fn fill_record_defaults(id: &str, entry: &mut Value) {
    let had_frequency = entry
        .get("update_state")
        .and_then(|state| state.get("frequency"))
        .is_some();

    let defaults = serde_json::to_value(ModRecord::with_defaults(id))
        .unwrap_or_else(|_| Value::Object(Map::new()));
    merge_missing(entry, &defaults);

    if !had_frequency {
        let source = entry
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        let frequency = if source.contains("github.com") {
            "COMMON"
        } else {
            "EOL"
        };
        if let Some(state) = entry.get_mut("update_state") {
            if let Some(obj) = state.as_object_mut() {
                obj.insert("frequency".to_string(), Value::String(frequency.into()));
            }
        }
    }
}

fn merge_missing(target: &mut Value, defaults: &Value) {
    let (Some(target), Some(defaults)) = (target.as_object_mut(), defaults.as_object()) else {
        return;
    };
    for (key, default_value) in defaults {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), default_value.clone());
            }
            Some(existing) if existing.is_object() && default_value.is_object() => {
                merge_missing(existing, default_value);
            }
            Some(_) => {}
        }
    }
}

/// The disabled marker on the archive path is the sole source of truth
/// for the enabled flag when reconciling from the folder.
pub fn enabled_from_path(path: &Path) -> bool {
    !path.to_string_lossy().ends_with(DISABLED_SUFFIX)
}

pub fn disabled_variant(path: &Path) -> PathBuf {
    if !enabled_from_path(path) {
        return path.to_path_buf();
    }
    let mut raw = path.as_os_str().to_os_string();
    raw.push(DISABLED_SUFFIX);
    PathBuf::from(raw)
}

pub fn enabled_variant(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match raw.strip_suffix(DISABLED_SUFFIX) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

pub fn is_archive_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(&format!(".{ARCHIVE_EXT}"))
        || name.ends_with(&format!(".{ARCHIVE_EXT}{DISABLED_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str) -> ModRecord {
        let mut record = ModRecord::with_defaults(id);
        record.file_path = PathBuf::from(format!("{id}.jar"));
        record
    }

    #[test]
    fn round_trip_preserves_records() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("modlist.json");

        let mut registry = Registry::default();
        let mut a = record("alpha");
        a.wants.push("beta".to_string());
        a.tags.push(REQUIRED_BASE_TAG.to_string());
        registry.mods.insert("alpha".to_string(), a);
        registry.mods.insert("beta".to_string(), record("beta"));

        registry.save(&store).unwrap();
        let loaded = Registry::load(&store).unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn load_preserves_unknown_keys() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("modlist.json");
        std::fs::write(
            &store,
            r#"{"alpha": {"id": "alpha", "custom_field": "kept"}}"#,
        )
        .unwrap();

        let registry = Registry::load(&store).unwrap();
        let alpha = &registry.mods["alpha"];
        assert_eq!(alpha.extra["custom_field"], "kept");

        registry.save(&store).unwrap();
        let raw = std::fs::read_to_string(&store).unwrap();
        assert!(raw.contains("custom_field"));
    }

    #[test]
    fn load_backfills_missing_fields() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("modlist.json");
        std::fs::write(
            &store,
            r#"{
                "gh": {"id": "gh", "source": "https://github.com/a/b"},
                "plain": {"id": "plain", "update_state": {"version": "1.0"}}
            }"#,
        )
        .unwrap();

        let registry = Registry::load(&store).unwrap();
        let gh = &registry.mods["gh"];
        assert_eq!(gh.update_state.frequency, UpdateFrequency::Common);
        assert!(gh.wants.is_empty());
        assert!(gh.enabled);

        let plain = &registry.mods["plain"];
        assert_eq!(plain.update_state.frequency, UpdateFrequency::Eol);
        assert_eq!(plain.update_state.version, "1.0");
    }

    #[test]
    fn resolve_id_walks_fallback_stages() {
        let mut registry = Registry::default();
        let mut alpha = record("Alpha");
        alpha.other_ids.push("AlphaCore".to_string());
        registry.mods.insert("Alpha".to_string(), alpha);

        assert_eq!(registry.resolve_id("Alpha").as_deref(), Some("Alpha"));
        assert_eq!(registry.resolve_id("alpha").as_deref(), Some("Alpha"));
        assert_eq!(registry.resolve_id("alphacore").as_deref(), Some("Alpha"));
        assert_eq!(registry.resolve_id("gamma"), None);
    }

    #[test]
    fn alias_check_covers_other_ids() {
        let mut alpha = record("Alpha");
        alpha.other_ids.push("AlphaCore".to_string());
        assert!(alpha.is_alias("ALPHA"));
        assert!(alpha.is_alias("alphacore"));
        assert!(!alpha.is_alias("beta"));
    }

    #[test]
    fn disabled_marker_round_trip() {
        let enabled = PathBuf::from("mods/Foo-1.2.jar");
        let disabled = disabled_variant(&enabled);
        assert_eq!(disabled, PathBuf::from("mods/Foo-1.2.jar.disabled"));
        assert!(!enabled_from_path(&disabled));
        assert_eq!(enabled_variant(&disabled), enabled);
        // Already-marked paths are not double-suffixed.
        assert_eq!(disabled_variant(&disabled), disabled);
        assert!(is_archive_path(&disabled));
        assert!(!is_archive_path(Path::new("mods/readme.txt")));
    }

    #[test]
    fn source_type_from_url() {
        assert_eq!(
            SourceType::from_url("https://github.com/a/b"),
            SourceType::GhRelease
        );
        assert_eq!(
            SourceType::from_url("https://www.curseforge.com/minecraft/mc-mods/x"),
            SourceType::Curseforge
        );
        assert_eq!(
            SourceType::from_url("https://modrinth.com/mod/x"),
            SourceType::Modrinth
        );
        assert_eq!(SourceType::from_url("https://example.com"), SourceType::Other);
    }
}
