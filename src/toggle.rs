use crate::registry::{
    disabled_variant, enabled_variant, Registry, REQUIRED_BASE_TAG,
};
use anyhow::{Context, Result};
use std::{collections::HashSet, fs, path::Path};
use tracing::debug;

/// Per-operation traversal context. A record touched once in a logical
/// operation is never processed twice, which makes traversals idempotent
/// within the operation and terminates diamond and cyclic dependency
/// shapes. `changed` records side-effect order for reporting.
#[derive(Debug, Default)]
pub struct Visited {
    seen: HashSet<String>,
    pub changed: Vec<String>,
}

impl Visited {
    pub fn new() -> Self {
        Visited::default()
    }

    /// Marks `id` as seen. Returns false when it already was.
    fn mark(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }
}

/// Disable `id` and, first, everything that depends on it. Dependents are
/// always torn down before the dependency they rely on.
pub fn disable_deep(id: &str, registry: &mut Registry, visited: &mut Visited) -> Result<usize> {
    let Some(record) = registry.mods.get(id) else {
        return Ok(0);
    };
    let rec_id = record.id.clone();
    if !visited.mark(&rec_id) {
        return Ok(0);
    }
    let dependents: Vec<String> = record
        .wanted_by
        .iter()
        .filter(|dep| !record.is_alias(dep))
        .cloned()
        .collect();

    let mut changes = 0;
    for dependent in dependents {
        changes += disable_deep(&dependent, registry, visited)?;
    }

    if let Some(record) = registry.mods.get_mut(&rec_id) {
        if record.enabled {
            let target = disabled_variant(&record.file_path);
            rename_archive(&record.file_path, &target)?;
            record.file_path = target;
            record.enabled = false;
            visited.changed.push(rec_id.clone());
            changes += 1;
            debug!(id = %rec_id, "disabled");
        }
    }
    Ok(changes)
}

/// Enable `id` and, first, everything it depends on.
pub fn enable_deep(id: &str, registry: &mut Registry, visited: &mut Visited) -> Result<usize> {
    let Some(record) = registry.mods.get(id) else {
        return Ok(0);
    };
    let rec_id = record.id.clone();
    if !visited.mark(&rec_id) {
        return Ok(0);
    }
    let dependencies: Vec<String> = record
        .wants
        .iter()
        .filter(|dep| !record.is_alias(dep))
        .cloned()
        .collect();

    let mut changes = 0;
    for dependency in dependencies {
        changes += enable_deep(&dependency, registry, visited)?;
    }

    if let Some(record) = registry.mods.get_mut(&rec_id) {
        if !record.enabled {
            let target = enabled_variant(&record.file_path);
            rename_archive(&record.file_path, &target)?;
            record.file_path = target;
            record.enabled = true;
            visited.changed.push(rec_id.clone());
            changes += 1;
            debug!(id = %rec_id, "enabled");
        }
    }
    Ok(changes)
}

/// Dispatch on the current state of `id` alone; dependents and
/// dependencies follow the chosen direction, they are not inverted
/// individually.
pub fn toggle_deep(id: &str, registry: &mut Registry, visited: &mut Visited) -> Result<usize> {
    match registry.mods.get(id) {
        Some(record) if record.enabled => disable_deep(id, registry, visited),
        Some(_) => enable_deep(id, registry, visited),
        None => Ok(0),
    }
}

/// Single-record enable: no dependency propagation.
pub fn enable_one(id: &str, registry: &mut Registry) -> Result<usize> {
    let Some(record) = registry.mods.get_mut(id) else {
        return Ok(0);
    };
    if record.enabled {
        return Ok(0);
    }
    let target = enabled_variant(&record.file_path);
    rename_archive(&record.file_path, &target)?;
    record.file_path = target;
    record.enabled = true;
    Ok(1)
}

/// Single-record disable: no dependency propagation.
pub fn disable_one(id: &str, registry: &mut Registry) -> Result<usize> {
    let Some(record) = registry.mods.get_mut(id) else {
        return Ok(0);
    };
    if !record.enabled {
        return Ok(0);
    }
    let target = disabled_variant(&record.file_path);
    rename_archive(&record.file_path, &target)?;
    record.file_path = target;
    record.enabled = false;
    Ok(1)
}

/// Re-enable every record tagged REQUIRED_BASE, pulling its dependency
/// closure up with it. Runs after every bulk disable so the base loader
/// mods never end up off.
pub fn enable_base_mods(registry: &mut Registry) -> Result<usize> {
    let base_ids: Vec<String> = registry
        .mods
        .values()
        .filter(|record| record.has_tag(REQUIRED_BASE_TAG) && !record.enabled)
        .map(|record| record.id.clone())
        .collect();

    let mut visited = Visited::new();
    let mut changes = 0;
    for id in base_ids {
        changes += enable_deep(&id, registry, &mut visited)?;
    }
    Ok(changes)
}

/// Rename the archive on disk. A missing source path is a no-op; an actual
/// rename failure propagates, since continuing would let the stored enabled
/// flag diverge from the path marker.
fn rename_archive(old_path: &Path, new_path: &Path) -> Result<()> {
    if old_path == new_path || !old_path.exists() {
        return Ok(());
    }
    fs::rename(old_path, new_path).with_context(|| {
        format!(
            "rename {} -> {}",
            old_path.display(),
            new_path.display()
        )
    })?;
    Ok(())
}
