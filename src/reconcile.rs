use crate::{
    extract::ExtractedIdentity,
    registry::{ModRecord, Registry},
};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};
use tracing::warn;

/// Merge freshly extracted identities into the registry, then rebuild the
/// derived `wanted_by` back-edges from the `wants` edges. Records whose
/// archive no longer exists are reported but kept.
pub fn reconcile(extracted: &BTreeMap<PathBuf, ExtractedIdentity>, registry: &mut Registry) {
    for (path, identity) in extracted {
        let Some(id) = identity.id.as_deref() else {
            continue;
        };
        match registry.mods.get_mut(id) {
            Some(record) => merge_record(record, path, identity),
            None => {
                let mut record = ModRecord::with_defaults(id);
                record.file_path = path.clone();
                record.enabled = identity.enabled;
                record.other_ids = identity.other_ids.clone();
                record.wants = identity.wants.clone();
                record.update_state.version = identity.version.clone();
                registry.mods.insert(id.to_string(), record);
            }
        }
    }

    report_orphans(extracted, registry);
    rebuild_edges(registry);
}

/// Filesystem-derived fields are always fresh; identity-derived array
/// fields merge (union when both sides are non-empty, extracted value when
/// the stored side is empty); operator fields are never touched.
fn merge_record(record: &mut ModRecord, path: &Path, identity: &ExtractedIdentity) {
    record.file_path = path.to_path_buf();
    record.enabled = identity.enabled;

    merge_string_list(&mut record.other_ids, &identity.other_ids);
    merge_string_list(&mut record.wants, &identity.wants);
    if record.update_state.version.is_empty() {
        record.update_state.version = identity.version.clone();
    }
}

fn merge_string_list(existing: &mut Vec<String>, extracted: &[String]) {
    if existing.is_empty() {
        existing.extend(extracted.iter().cloned());
        return;
    }
    for value in extracted {
        if !existing.iter().any(|seen| seen.eq_ignore_ascii_case(value)) {
            existing.push(value.clone());
        }
    }
}

fn report_orphans(extracted: &BTreeMap<PathBuf, ExtractedIdentity>, registry: &Registry) {
    let scanned: HashSet<&Path> = extracted.keys().map(PathBuf::as_path).collect();
    for record in registry.mods.values() {
        if !scanned.contains(record.file_path.as_path()) {
            warn!(
                id = %record.id,
                path = %record.file_path.display(),
                "no archive maps to this record; possibly renamed or removed"
            );
        }
    }
}

/// Resolve every declared dependency to a canonical record id and make sure
/// the reverse edge exists. The rebuild is additive: stale back-edges from
/// earlier passes are tolerated, never pruned.
fn rebuild_edges(registry: &mut Registry) {
    let ids = registry.ordered_ids();
    for id in ids {
        let wants = match registry.mods.get(&id) {
            Some(record) => record.wants.clone(),
            None => continue,
        };

        let mut normalized: Vec<String> = Vec::new();
        for dep in wants {
            match registry.resolve_id(&dep) {
                None => {
                    warn!(id = %id, dependency = %dep, "possibly missing dependency");
                    if !normalized.iter().any(|seen| seen.eq_ignore_ascii_case(&dep)) {
                        normalized.push(dep);
                    }
                }
                Some(canonical) => {
                    // Self references never become edges.
                    let is_self = registry
                        .mods
                        .get(&id)
                        .is_some_and(|record| record.is_alias(&canonical));
                    if is_self {
                        continue;
                    }
                    if !normalized
                        .iter()
                        .any(|seen| seen.eq_ignore_ascii_case(&canonical))
                    {
                        normalized.push(canonical.clone());
                    }
                    if let Some(target) = registry.mods.get_mut(&canonical) {
                        if !target.wanted_by.contains(&id) {
                            target.wanted_by.push(id.clone());
                        }
                    }
                }
            }
        }
        if let Some(record) = registry.mods.get_mut(&id) {
            record.wants = normalized;
        }
    }
}
