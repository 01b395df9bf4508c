use crate::registry::enabled_from_path;
use regex::Regex;
use serde_json::Value;
use std::{
    fs,
    io::Read,
    path::Path,
    sync::OnceLock,
};
use tracing::debug;

/// Entry holding structured mod metadata inside the archive.
const METADATA_ENTRY: &str = "mcmod.info";

/// Constant-pool descriptors marking the loader's mod-registration
/// annotation inside compiled class files.
const ANNOTATION_MARKERS: [&[u8]; 2] = [
    b"Lnet/minecraftforge/fml/common/Mod;",
    b"Lcpw/mods/fml/common/Mod;",
];

/// Loader/runtime names that never count as real dependencies.
const LOADER_NAMES: [&str; 5] = ["forge", "fml", "minecraft forge", "minecraft", "mcp"];

/// Runtime version tokens that leak into mod version strings and carry no
/// information about the mod itself.
const LEGACY_RUNTIME_VERSIONS: [&str; 6] =
    ["1.7.10", "1.8.9", "1.10.2", "1.11.2", "1.12.2", "1.16.5"];

/// Class files past this size are skipped by the annotation scan.
const MAX_CLASS_SCAN_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedIdentity {
    pub id: Option<String>,
    pub other_ids: Vec<String>,
    pub wants: Vec<String>,
    pub version: String,
    pub enabled: bool,
}

/// Best-effort identity extraction. Never fails: when no fallback resolves
/// an id the result carries `id: None` and the caller skips the archive.
pub fn extract(path: &Path) -> ExtractedIdentity {
    let mut out = ExtractedIdentity {
        enabled: enabled_from_path(path),
        ..ExtractedIdentity::default()
    };

    let mut meta_version = String::new();
    if let Some(bytes) = read_archive_entry(path, METADATA_ENTRY) {
        match parse_mod_info(&bytes) {
            Some(info) => {
                out.id = info.id;
                out.other_ids = info.other_ids;
                out.wants = info.wants;
                meta_version = info.version;
            }
            None if !bytes.is_empty() => {
                let (first, rest) = scan_loose_mod_ids(&bytes);
                out.id = first;
                out.other_ids = rest;
            }
            None => {}
        }
    }

    let (file_id, file_version) = parse_filename(path);
    if out.id.is_none() {
        out.id = file_id;
    }

    let annotation = scan_annotations(path);
    out.wants.extend(annotation.wants);

    out.version = resolve_version(&meta_version, &annotation.version, &file_version);
    out.wants = filter_faulty_dependencies(
        out.wants,
        out.id.as_deref().unwrap_or(""),
        &out.other_ids,
    );
    debug!(path = %path.display(), id = ?out.id, "extracted identity");
    out
}

struct ModInfo {
    id: Option<String>,
    other_ids: Vec<String>,
    wants: Vec<String>,
    version: String,
}

/// Structured metadata: a single object, a bare list, or a `modList`
/// wrapper. The first entry is authoritative for id and version; later
/// entries contribute alternate ids and union into the dependency list.
fn parse_mod_info(bytes: &[u8]) -> Option<ModInfo> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let entries: Vec<&Value> = match &value {
        Value::Array(list) => list.iter().collect(),
        Value::Object(obj) => match obj.get("modList").and_then(Value::as_array) {
            Some(list) => list.iter().collect(),
            None => vec![&value],
        },
        _ => return None,
    };

    let mut info = ModInfo {
        id: None,
        other_ids: Vec::new(),
        wants: Vec::new(),
        version: String::new(),
    };
    for (index, entry) in entries.iter().enumerate() {
        let modid = entry
            .get("modid")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if index == 0 {
            info.id = modid.map(str::to_string);
            info.version = entry
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
        } else if let Some(modid) = modid {
            info.other_ids.push(modid.to_string());
        }
        for key in ["requiredMods", "dependencies"] {
            if let Some(deps) = entry.get(key).and_then(Value::as_array) {
                info.wants.extend(
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                );
            }
        }
    }
    info.id.as_ref()?;
    Some(info)
}

fn modid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""modid"\s*:\s*"([^"]+)""#).expect("modid pattern compiles")
    })
}

/// Permissive textual fallback when the metadata entry is not valid JSON:
/// every `"modid": "..."` occurrence is collected, first match wins.
fn scan_loose_mod_ids(bytes: &[u8]) -> (Option<String>, Vec<String>) {
    let text = String::from_utf8_lossy(bytes);
    let mut matches = modid_pattern()
        .captures_iter(&text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|id| !id.is_empty());
    let first = matches.next();
    (first, matches.collect())
}

/// Derive an id candidate from the archive filename. Leading bracketed tag
/// groups and separator/digit noise are skipped, then the longest run of
/// separator-joined word fragments is captured, stopping at the first
/// digit-led version-like fragment. The remainder is a version candidate.
pub fn parse_filename(path: &Path) -> (Option<String>, String) {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(crate::registry::DISABLED_SUFFIX)
        .unwrap_or(&name);
    let stem = stem.strip_suffix(".jar").unwrap_or(stem);

    let chars: Vec<char> = stem.chars().collect();
    let mut pos = 0;

    // Skip [tag] / (tag) groups and noise before the first name letter.
    while pos < chars.len() {
        match chars[pos] {
            '[' => {
                while pos < chars.len() && chars[pos] != ']' {
                    pos += 1;
                }
                pos += 1;
            }
            '(' => {
                while pos < chars.len() && chars[pos] != ')' {
                    pos += 1;
                }
                pos += 1;
            }
            c if c.is_ascii_alphabetic() => break,
            _ => pos += 1,
        }
    }

    let name_start = pos;
    let mut name_end = pos;
    while pos < chars.len() {
        if !chars[pos].is_ascii_alphabetic() {
            break;
        }
        // One word fragment: letters and trailing digits.
        // A fragment like "v2" is treated as the start of a version.
        if is_version_fragment(&chars[pos..]) {
            break;
        }
        while pos < chars.len() && chars[pos].is_ascii_alphanumeric() {
            pos += 1;
        }
        name_end = pos;
        // Cross a single joining separator only when a letter follows.
        if pos < chars.len() && matches!(chars[pos], '-' | '+' | '_' | ' ' | '\'') {
            let next = chars.get(pos + 1);
            if next.is_some_and(|c| c.is_ascii_alphabetic())
                && !is_version_fragment(&chars[pos + 1..])
            {
                pos += 1;
                continue;
            }
        }
        break;
    }

    if name_end <= name_start {
        return (None, String::new());
    }
    let id: String = chars[name_start..name_end].iter().collect();
    let remainder: String = chars[name_end..].iter().collect();
    let version = remainder
        .trim_matches(|c: char| matches!(c, '-' | '+' | '_' | ' ' | '.'))
        .to_string();
    (Some(id), version)
}

fn is_version_fragment(chars: &[char]) -> bool {
    matches!(chars.first(), Some('v' | 'V'))
        && chars.get(1).is_some_and(|c| c.is_ascii_digit())
}

#[derive(Debug, Default)]
struct AnnotationScan {
    wants: Vec<String>,
    version: String,
}

/// Heuristic scan of compiled class files for the loader's registration
/// annotation. Not a bytecode parser: printable string runs are pulled out
/// of any class containing the marker, then mined for `required-after:`
/// dependency tokens and a `version` key/value pair.
fn scan_annotations(path: &Path) -> AnnotationScan {
    let mut out = AnnotationScan::default();
    let Ok(file) = fs::File::open(path) else {
        return out;
    };
    let Ok(mut archive) = zip::ZipArchive::new(file) else {
        return out;
    };

    let names: Vec<String> = archive
        .file_names()
        .filter(|name| name.ends_with(".class"))
        .map(str::to_string)
        .collect();

    for name in names {
        let Ok(mut entry) = archive.by_name(&name) else {
            continue;
        };
        if entry.size() > MAX_CLASS_SCAN_BYTES {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        if entry.read_to_end(&mut bytes).is_err() {
            continue;
        }
        if !ANNOTATION_MARKERS
            .iter()
            .any(|marker| contains_bytes(&bytes, marker))
        {
            continue;
        }

        let strings = printable_strings(&bytes);
        for (index, text) in strings.iter().enumerate() {
            for part in text.split(';') {
                if let Some(dep) = part.trim().strip_prefix("required-after:") {
                    if !dep.is_empty() {
                        out.wants.push(dep.to_string());
                    }
                }
            }
            if out.version.is_empty() && text == "version" {
                if let Some(value) = strings.get(index + 1) {
                    if value.chars().any(|c| c.is_ascii_digit()) {
                        out.version = value.clone();
                    }
                }
            }
        }
    }
    out
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

fn printable_strings(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for &byte in bytes {
        if (0x20..0x7f).contains(&byte) {
            current.push(byte as char);
        } else {
            if current.len() >= 3 {
                out.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= 3 {
        out.push(current);
    }
    out
}

/// Version resolution order: structured metadata, then the annotation scan,
/// then the filename remainder. A metadata value that says "version" but
/// carries no digit is a template placeholder and falls through. A value
/// that is nothing but a runtime version token is stripped.
fn resolve_version(meta: &str, annotation: &str, filename: &str) -> String {
    let malformed =
        |v: &str| v.to_ascii_lowercase().contains("version") && !v.chars().any(|c| c.is_ascii_digit());

    let candidate = if !meta.is_empty() && !malformed(meta) {
        meta.to_string()
    } else if !annotation.is_empty() && !malformed(annotation) {
        annotation.to_string()
    } else {
        filename.to_string()
    };

    strip_runtime_token(&candidate, filename)
}

fn strip_runtime_token(candidate: &str, fallback: &str) -> String {
    for token in LEGACY_RUNTIME_VERSIONS {
        let stripped = if candidate == token {
            String::new()
        } else if let Some(rest) = candidate
            .strip_prefix(token)
            .and_then(|rest| rest.strip_prefix(['-', '_', '+', ' ']))
        {
            rest.to_string()
        } else if let Some(rest) = candidate
            .strip_suffix(token)
            .and_then(|rest| rest.strip_suffix(['-', '_', '+', ' ']))
        {
            rest.to_string()
        } else {
            continue;
        };

        if !stripped.is_empty() && stripped.chars().any(|c| c.is_ascii_digit()) {
            return stripped;
        }
        // Nothing meaningful left after the runtime token; fall back to the
        // filename-derived remainder, which may itself carry the token.
        if fallback != candidate {
            return strip_runtime_token(fallback, "");
        }
        return String::new();
    }
    candidate.to_string()
}

/// Clean a raw dependency list: split comma-joined entries, drop version
/// qualifiers, loader names, and self references, and dedupe
/// case-insensitively while keeping first-seen casing.
pub fn filter_faulty_dependencies(
    raw: Vec<String>,
    own_id: &str,
    other_ids: &[String],
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw {
        for piece in entry.split(',') {
            let piece = piece.split('@').next().unwrap_or("").trim();
            // Version-range leftovers like "[1.0" or ")" carry no letters.
            if !piece.chars().any(|c| c.is_ascii_alphabetic()) {
                continue;
            }
            if is_loader_name(piece) {
                continue;
            }
            if piece.eq_ignore_ascii_case(own_id)
                || other_ids.iter().any(|o| o.eq_ignore_ascii_case(piece))
            {
                continue;
            }
            if out.iter().any(|seen| seen.eq_ignore_ascii_case(piece)) {
                continue;
            }
            out.push(piece.to_string());
        }
    }
    out
}

fn is_loader_name(candidate: &str) -> bool {
    let normalized: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    LOADER_NAMES.iter().any(|name| {
        let name: String = name.chars().filter(|c| !c.is_whitespace()).collect();
        normalized == name
    })
}

fn read_archive_entry(path: &Path, entry_name: &str) -> Option<Vec<u8>> {
    let file = fs::File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let name = archive
        .file_names()
        .find(|name| name.eq_ignore_ascii_case(entry_name))
        .map(str::to_string)?;
    let mut entry = archive.by_name(&name).ok()?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).ok()?;
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn filename_extraction_skips_tags_and_captures_version() {
        let (id, version) = parse_filename(Path::new("[CLIENT]AwesomeMod-1.2.3.jar"));
        assert_eq!(id.as_deref(), Some("AwesomeMod"));
        assert_eq!(version, "1.2.3");
    }

    #[test]
    fn filename_extraction_keeps_joined_fragments() {
        let (id, version) = parse_filename(Path::new("iron-chests-plus-4.0.1.jar"));
        assert_eq!(id.as_deref(), Some("iron-chests-plus"));
        assert_eq!(version, "4.0.1");

        let (id, version) = parse_filename(Path::new("OptiFabric_v2.1.jar.disabled"));
        assert_eq!(id.as_deref(), Some("OptiFabric"));
        assert_eq!(version, "v2.1");
    }

    #[test]
    fn filename_extraction_handles_pure_noise() {
        let (id, version) = parse_filename(Path::new("[1.12]-3.jar"));
        assert_eq!(id, None);
        assert_eq!(version, "");
    }

    #[test]
    fn structured_metadata_wins_over_filename() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("Something-9.9.jar");
        write_jar(
            &jar,
            &[(
                "mcmod.info",
                br#"[{"modid": "alpha", "version": "2.0", "requiredMods": ["beta"]},
                    {"modid": "alphalib", "dependencies": ["gamma"]}]"#,
            )],
        );

        let identity = extract(&jar);
        assert_eq!(identity.id.as_deref(), Some("alpha"));
        assert_eq!(identity.version, "2.0");
        assert_eq!(identity.other_ids, vec!["alphalib"]);
        assert_eq!(identity.wants, vec!["beta", "gamma"]);
        assert!(identity.enabled);
    }

    #[test]
    fn mod_list_wrapper_is_accepted() {
        let info = parse_mod_info(
            br#"{"modListVersion": 2, "modList": [{"modid": "core", "version": "1.1"}]}"#,
        )
        .unwrap();
        assert_eq!(info.id.as_deref(), Some("core"));
        assert_eq!(info.version, "1.1");
    }

    #[test]
    fn loose_scan_recovers_ids_from_broken_metadata() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("Broken-1.0.jar");
        // Trailing comma makes this invalid JSON.
        write_jar(
            &jar,
            &[(
                "mcmod.info",
                br#"[{"modid": "brokenmod", "extra": [1,2,],}, {"modid": "brokensub"}]"#,
            )],
        );

        let identity = extract(&jar);
        assert_eq!(identity.id.as_deref(), Some("brokenmod"));
        assert_eq!(identity.other_ids, vec!["brokensub"]);
    }

    #[test]
    fn annotation_scan_finds_dependencies_and_version() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("AnnMod-1.0.jar");
        let mut class = Vec::new();
        class.extend_from_slice(&[0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00]);
        class.extend_from_slice(b"Lnet/minecraftforge/fml/common/Mod;");
        class.push(0x00);
        class.extend_from_slice(b"required-after:libcore@[1.0,);required-after:otherlib");
        class.push(0x00);
        class.extend_from_slice(b"version");
        class.push(0x00);
        class.extend_from_slice(b"3.4.5");
        class.push(0x00);
        write_jar(&jar, &[("com/example/AnnMod.class", &class)]);

        let identity = extract(&jar);
        assert_eq!(identity.id.as_deref(), Some("AnnMod"));
        assert_eq!(identity.wants, vec!["libcore", "otherlib"]);
        // mcmod.info is absent, annotation version beats filename remainder.
        assert_eq!(identity.version, "3.4.5");
    }

    #[test]
    fn missing_metadata_falls_back_to_filename() {
        let dir = tempdir().unwrap();
        let jar = dir.path().join("[SERVER] Carts_And_Rails-0.9.jar.disabled");
        write_jar(&jar, &[("assets/texture.png", b"png")]);

        let identity = extract(&jar);
        assert_eq!(identity.id.as_deref(), Some("Carts_And_Rails"));
        assert_eq!(identity.version, "0.9");
        assert!(!identity.enabled);
    }

    #[test]
    fn unreadable_archive_yields_no_id() {
        let dir = tempdir().unwrap();
        let junk = dir.path().join("---.jar");
        fs::write(&junk, b"not a zip").unwrap();
        let identity = extract(&junk);
        assert_eq!(identity.id, None);
    }

    #[test]
    fn version_policy_prefers_meta_then_annotation_then_filename() {
        assert_eq!(resolve_version("2.0", "3.0", "4.0"), "2.0");
        assert_eq!(resolve_version("", "3.0", "4.0"), "3.0");
        assert_eq!(resolve_version("", "", "4.0"), "4.0");
        // "${version}" style placeholders fall through.
        assert_eq!(resolve_version("@VERSION@", "3.0", "4.0"), "3.0");
        assert_eq!(resolve_version("${version}", "", "4.0"), "4.0");
    }

    #[test]
    fn runtime_token_is_stripped_from_versions() {
        assert_eq!(resolve_version("1.12.2-4.5.6", "", ""), "4.5.6");
        assert_eq!(resolve_version("4.5.6-1.12.2", "", ""), "4.5.6");
        // Token-only version reverts to the filename remainder.
        assert_eq!(resolve_version("1.12.2", "", "0.3"), "0.3");
        assert_eq!(resolve_version("1.12.2", "", ""), "");
    }

    #[test]
    fn dependency_cleanup_rules() {
        let raw = vec![
            "libcore@2.0, extras".to_string(),
            "Forge".to_string(),
            "minecraft_forge".to_string(),
            "self".to_string(),
            "SubSelf".to_string(),
            "LIBCORE".to_string(),
        ];
        let cleaned =
            filter_faulty_dependencies(raw, "Self", &["subself".to_string()]);
        assert_eq!(cleaned, vec!["libcore", "extras"]);
    }

    #[test]
    fn enabled_comes_from_path_not_metadata() {
        let dir = tempdir().unwrap();
        let jar: PathBuf = dir.path().join("Thing-1.0.jar.disabled");
        write_jar(&jar, &[("mcmod.info", br#"[{"modid": "thing"}]"#)]);
        let identity = extract(&jar);
        assert!(!identity.enabled);
    }
}
