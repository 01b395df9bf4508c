use crate::{
    config::AppConfig,
    registry::{ModRecord, Registry, SourceType, UpdateFrequency},
};
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::{
    fs,
    io::{self, Read},
    path::Path,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::warn;

const USER_AGENT: &str = "modvault";
/// Remote checks run in batches of this many worker threads.
const CHECK_BATCH_SIZE: usize = 4;
/// RARE-frequency records are rechecked at most this often.
const RARE_CHECK_DAYS: i64 = 30;

pub const STATUS_UP_TO_DATE: &str = "up_to_date";
pub const STATUS_RATE_LIMITED: &str = "rate_limited";

#[derive(Debug, Clone)]
pub struct RemoteRelease {
    pub version: String,
    pub file_name: String,
    pub download_url: String,
    pub sha512: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CheckOutcome {
    UpToDate,
    UpdateAvailable(RemoteRelease),
    Skipped(String),
    Failed(String),
    RateLimited { cooldown_minutes: i64 },
}

#[derive(Debug)]
pub struct CheckReport {
    pub id: String,
    pub outcome: CheckOutcome,
}

/// Snapshot of the record fields one remote check needs, so the check can
/// run off-thread without touching the registry.
#[derive(Debug, Clone)]
struct CheckTask {
    id: String,
    source: String,
    source_type: SourceType,
    current_version: String,
    file_pattern: String,
}

/// Poll every eligible record's release feed and record the outcome on the
/// record. Failures are per-mod and never abort the batch. With `apply`
/// set, available updates are downloaded into the mod folder and the old
/// archive is replaced.
pub fn check_all(
    registry: &mut Registry,
    config: &AppConfig,
    folder: &Path,
    apply: bool,
) -> Result<Vec<CheckReport>> {
    let tasks: Vec<CheckTask> = registry
        .mods
        .values()
        .filter(|record| should_check(record))
        .map(|record| CheckTask {
            id: record.id.clone(),
            source: record.source.clone(),
            source_type: record.source_type(),
            current_version: record.update_state.version.clone(),
            file_pattern: record.update_state.file_pattern.clone(),
        })
        .collect();

    let mut reports = Vec::with_capacity(tasks.len());
    for batch in tasks.chunks(CHECK_BATCH_SIZE) {
        let outcomes: Vec<(String, CheckOutcome)> = std::thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|task| scope.spawn(move || (task.id.clone(), check_one(task, config))))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        (
                            "?".to_string(),
                            CheckOutcome::Failed("check worker panicked".into()),
                        )
                    })
                })
                .collect()
        });

        for (id, outcome) in outcomes {
            record_outcome(registry, &id, &outcome);
            if apply {
                if let CheckOutcome::UpdateAvailable(release) = &outcome {
                    if let Err(err) = apply_update(registry, &id, release, folder) {
                        warn!(id = %id, error = %err, "failed to apply update");
                    }
                }
            }
            reports.push(CheckReport { id, outcome });
        }
    }
    Ok(reports)
}

fn should_check(record: &ModRecord) -> bool {
    if record.source.is_empty() || record.update_state.disable_check {
        return false;
    }
    match record.update_state.frequency {
        UpdateFrequency::Eol => false,
        UpdateFrequency::Common => true,
        UpdateFrequency::Rare => {
            let Ok(last) = OffsetDateTime::parse(&record.update_state.last_updated_at, &Rfc3339)
            else {
                return true;
            };
            let age = OffsetDateTime::now_utc() - last;
            age.whole_days() >= RARE_CHECK_DAYS
        }
    }
}

fn record_outcome(registry: &mut Registry, id: &str, outcome: &CheckOutcome) {
    let Some(record) = registry.mods.get_mut(id) else {
        return;
    };
    record.update_state.last_status = match outcome {
        CheckOutcome::UpToDate => STATUS_UP_TO_DATE.to_string(),
        CheckOutcome::UpdateAvailable(release) => {
            format!("update_available:{}", release.version)
        }
        CheckOutcome::Skipped(reason) => format!("skipped:{reason}"),
        CheckOutcome::Failed(reason) => format!("error:{reason}"),
        CheckOutcome::RateLimited { .. } => STATUS_RATE_LIMITED.to_string(),
    };
    record.update_state.last_updated_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
}

fn check_one(task: &CheckTask, config: &AppConfig) -> CheckOutcome {
    let release = match task.source_type {
        SourceType::GhRelease => fetch_github_release(task, config),
        SourceType::Modrinth => fetch_modrinth_release(task),
        SourceType::Curseforge => fetch_curseforge_release(task, config),
        SourceType::Other => {
            return CheckOutcome::Skipped("unsupported source".to_string());
        }
    };
    match release {
        Ok(Some(release)) => {
            if is_newer_version(&release.version, &task.current_version) {
                CheckOutcome::UpdateAvailable(release)
            } else {
                CheckOutcome::UpToDate
            }
        }
        Ok(None) => CheckOutcome::Skipped("no matching release asset".to_string()),
        Err(err) => classify_failure(err),
    }
}

fn classify_failure(err: anyhow::Error) -> CheckOutcome {
    match err.downcast::<ureq::Error>() {
        Ok(ureq::Error::Status(code, response)) if code == 403 || code == 429 => {
            let reset = response
                .header("x-ratelimit-reset")
                .and_then(|raw| raw.parse::<i64>().ok());
            let cooldown_minutes = reset
                .map(|reset| {
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    ((reset - now).max(0) + 59) / 60
                })
                .unwrap_or(60);
            CheckOutcome::RateLimited { cooldown_minutes }
        }
        Ok(other) => CheckOutcome::Failed(other.to_string()),
        Err(err) => CheckOutcome::Failed(err.to_string()),
    }
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(Duration::from_secs(15))
        .timeout_write(Duration::from_secs(15))
        .build()
}

/// GitHub: `/repos/{owner}/{repo}/releases/latest`, tag as version, asset
/// picked by file pattern.
fn fetch_github_release(task: &CheckTask, config: &AppConfig) -> Result<Option<RemoteRelease>> {
    let (owner, repo) = parse_github_repo(&task.source)
        .with_context(|| format!("unrecognized GitHub url {}", task.source))?;
    let url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");

    let mut request = agent().get(&url).set("User-Agent", USER_AGENT);
    if let Some(token) = &config.github_token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    let body: Value = request.call()?.into_json().context("decode release")?;

    let version = body
        .get("tag_name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim_start_matches('v')
        .to_string();
    let empty = Vec::new();
    let assets = body
        .get("assets")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let asset = select_asset(
        assets.iter().filter_map(|asset| {
            Some((
                asset.get("name")?.as_str()?.to_string(),
                asset.get("browser_download_url")?.as_str()?.to_string(),
            ))
        }),
        &task.file_pattern,
    );
    Ok(asset.map(|(file_name, download_url)| RemoteRelease {
        version,
        file_name,
        download_url,
        sha512: None,
    }))
}

/// Modrinth: `/v2/project/{slug}/version`, first entry is the latest.
fn fetch_modrinth_release(task: &CheckTask) -> Result<Option<RemoteRelease>> {
    let slug = task
        .source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    if slug.is_empty() {
        anyhow::bail!("unrecognized Modrinth url {}", task.source);
    }
    let url = format!("https://api.modrinth.com/v2/project/{slug}/version");
    let body: Value = agent()
        .get(&url)
        .set("User-Agent", USER_AGENT)
        .call()?
        .into_json()
        .context("decode versions")?;

    let Some(latest) = body.as_array().and_then(|list| list.first()) else {
        return Ok(None);
    };
    let version = latest
        .get("version_number")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let empty = Vec::new();
    let files = latest
        .get("files")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let file = files
        .iter()
        .find(|file| {
            file.get("primary")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
        .or_else(|| files.first());
    let Some(file) = file else {
        return Ok(None);
    };
    Ok(Some(RemoteRelease {
        version,
        file_name: file
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("update.jar")
            .to_string(),
        download_url: file
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        sha512: file
            .get("hashes")
            .and_then(|hashes| hashes.get("sha512"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }))
}

/// CurseForge needs an API key; the project slug is looked up first, then
/// the newest listed file of the project is taken.
fn fetch_curseforge_release(task: &CheckTask, config: &AppConfig) -> Result<Option<RemoteRelease>> {
    let Some(key) = &config.curseforge_key else {
        anyhow::bail!("no CurseForge API key configured");
    };
    let slug = task
        .source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    let search_url =
        format!("https://api.curseforge.com/v1/mods/search?gameId=432&slug={slug}");
    let body: Value = agent()
        .get(&search_url)
        .set("User-Agent", USER_AGENT)
        .set("x-api-key", key)
        .call()?
        .into_json()
        .context("decode mod search")?;
    let Some(latest) = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|mods| mods.first())
        .and_then(|entry| entry.get("latestFiles"))
        .and_then(Value::as_array)
        .and_then(|files| files.last())
    else {
        return Ok(None);
    };

    let file_name = latest
        .get("fileName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    // CurseForge carries no clean version field; derive one from the file
    // name the same way the extractor does.
    let (_, version) = crate::extract::parse_filename(Path::new(&file_name));
    Ok(Some(RemoteRelease {
        version,
        file_name,
        download_url: latest
            .get("downloadUrl")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        sha512: None,
    }))
}

fn parse_github_repo(url: &str) -> Option<(String, String)> {
    let rest = url.split("github.com/").nth(1)?;
    let mut parts = rest.split('/').filter(|part| !part.is_empty());
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.trim_end_matches(".git").to_string();
    Some((owner, repo))
}

/// Pick the release asset the file pattern names, or the first jar.
fn select_asset<I>(assets: I, file_pattern: &str) -> Option<(String, String)>
where
    I: Iterator<Item = (String, String)>,
{
    let assets: Vec<(String, String)> = assets.collect();
    if !file_pattern.is_empty() {
        match Regex::new(file_pattern) {
            Ok(pattern) => {
                if let Some(found) = assets.iter().find(|(name, _)| pattern.is_match(name)) {
                    return Some(found.clone());
                }
            }
            // A pattern that fails to compile degrades to substring match.
            Err(_) => {
                if let Some(found) =
                    assets.iter().find(|(name, _)| name.contains(file_pattern))
                {
                    return Some(found.clone());
                }
            }
        }
    }
    assets
        .into_iter()
        .find(|(name, _)| name.to_ascii_lowercase().ends_with(".jar"))
}

/// Tolerant version comparison: numeric segments compared left to right,
/// missing segments count as zero. An empty local version always loses.
pub fn is_newer_version(remote: &str, local: &str) -> bool {
    if remote.is_empty() {
        return false;
    }
    if local.is_empty() {
        return true;
    }
    let remote = numeric_segments(remote);
    let local = numeric_segments(local);
    let len = remote.len().max(local.len());
    for index in 0..len {
        let r = remote.get(index).copied().unwrap_or(0);
        let l = local.get(index).copied().unwrap_or(0);
        if r != l {
            return r > l;
        }
    }
    false
}

fn numeric_segments(raw: &str) -> Vec<u64> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Download the release into the folder, verify it when a checksum came
/// with it, drop the old archive, and point the record at the new file.
fn apply_update(
    registry: &mut Registry,
    id: &str,
    release: &RemoteRelease,
    folder: &Path,
) -> Result<()> {
    if release.download_url.is_empty() {
        anyhow::bail!("release has no download url");
    }
    let Some(record) = registry.mods.get(id) else {
        return Ok(());
    };
    let was_enabled = record.enabled;
    let old_path = record.file_path.clone();

    let staged = folder.join(format!(".modvault-{}", release.file_name));
    download(&release.download_url, &staged)?;
    if let Some(expected) = &release.sha512 {
        if let Err(err) = verify_sha512(&staged, expected) {
            let _ = fs::remove_file(&staged);
            return Err(err);
        }
    }

    let mut final_path = folder.join(&release.file_name);
    if !was_enabled {
        final_path = crate::registry::disabled_variant(&final_path);
    }
    fs::rename(&staged, &final_path).context("move downloaded archive into place")?;
    if old_path != final_path && old_path.exists() {
        fs::remove_file(&old_path).context("remove replaced archive")?;
    }

    if let Some(record) = registry.mods.get_mut(id) {
        record.file_path = final_path;
        record.update_state.version = release.version.clone();
    }
    Ok(())
}

fn download(url: &str, dest: &Path) -> Result<u64> {
    let response = agent()
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .context("download release asset")?;
    let mut reader = response.into_reader();
    let mut file = fs::File::create(dest).context("create downloaded archive")?;
    let written = io::copy(&mut reader, &mut file).context("write downloaded archive")?;
    Ok(written)
}

fn verify_sha512(path: &Path, expected: &str) -> Result<()> {
    let mut file = fs::File::open(path).context("open archive for checksum")?;
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected.to_ascii_lowercase() {
        anyhow::bail!("checksum mismatch for {}", path.display());
    }
    Ok(())
}

/// Human-readable line for one check outcome.
pub fn describe_outcome(report: &CheckReport) -> String {
    match &report.outcome {
        CheckOutcome::UpToDate => format!("{}: up to date", report.id),
        CheckOutcome::UpdateAvailable(release) => format!(
            "{}: update available -> {} ({})",
            report.id, release.version, release.file_name
        ),
        CheckOutcome::Skipped(reason) => format!("{}: skipped ({reason})", report.id),
        CheckOutcome::Failed(reason) => format!("{}: check failed ({reason})", report.id),
        CheckOutcome::RateLimited { cooldown_minutes } => format!(
            "{}: rate limited, retry in ~{cooldown_minutes} min",
            report.id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModRecord;

    #[test]
    fn version_comparison_is_tolerant() {
        assert!(is_newer_version("1.2.3", "1.2.2"));
        assert!(is_newer_version("2.0", "1.9.9"));
        assert!(is_newer_version("1.2.3.1", "1.2.3"));
        assert!(!is_newer_version("1.2.3", "1.2.3"));
        assert!(!is_newer_version("1.2", "1.2.0"));
        // Prefixes and junk are shrugged off.
        assert!(is_newer_version("v1.3", "release-1.2"));
        assert!(is_newer_version("4.5.6", ""));
        assert!(!is_newer_version("", "1.0"));
    }

    #[test]
    fn asset_selection_prefers_pattern_then_jar() {
        let assets = vec![
            ("Sources.zip".to_string(), "u1".to_string()),
            ("Mod-fabric-1.0.jar".to_string(), "u2".to_string()),
            ("Mod-forge-1.0.jar".to_string(), "u3".to_string()),
        ];
        let picked = select_asset(assets.clone().into_iter(), "forge.*\\.jar");
        assert_eq!(picked.unwrap().1, "u3");

        let picked = select_asset(assets.clone().into_iter(), "");
        assert_eq!(picked.unwrap().1, "u2");

        // Broken regex degrades to substring matching.
        let picked = select_asset(assets.into_iter(), "forge(");
        assert_eq!(picked.unwrap().1, "u3");
    }

    #[test]
    fn github_url_parsing() {
        assert_eq!(
            parse_github_repo("https://github.com/owner/repo"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(
            parse_github_repo("https://github.com/owner/repo/releases"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(parse_github_repo("https://example.com/x"), None);
    }

    #[test]
    fn check_policy_respects_frequency_and_flags() {
        let mut record = ModRecord::with_defaults("a");
        assert!(!should_check(&record), "no source means no check");

        record.source = "https://github.com/a/b".to_string();
        assert!(should_check(&record));

        record.update_state.disable_check = true;
        assert!(!should_check(&record));
        record.update_state.disable_check = false;

        record.update_state.frequency = UpdateFrequency::Eol;
        assert!(!should_check(&record));

        record.update_state.frequency = UpdateFrequency::Rare;
        record.update_state.last_updated_at =
            OffsetDateTime::now_utc().format(&Rfc3339).unwrap();
        assert!(!should_check(&record), "fresh rare check is skipped");
        record.update_state.last_updated_at = "2001-01-01T00:00:00Z".to_string();
        assert!(should_check(&record), "stale rare check runs");
    }

    #[test]
    fn outcome_lands_on_the_record() {
        let mut registry = Registry::default();
        registry
            .mods
            .insert("a".to_string(), ModRecord::with_defaults("a"));
        record_outcome(&mut registry, "a", &CheckOutcome::UpToDate);
        let state = &registry.mods["a"].update_state;
        assert_eq!(state.last_status, STATUS_UP_TO_DATE);
        assert!(!state.last_updated_at.is_empty());

        record_outcome(
            &mut registry,
            "a",
            &CheckOutcome::UpdateAvailable(RemoteRelease {
                version: "2.0".to_string(),
                file_name: "a-2.0.jar".to_string(),
                download_url: "https://example.com/a.jar".to_string(),
                sha512: None,
            }),
        );
        assert_eq!(
            registry.mods["a"].update_state.last_status,
            "update_available:2.0"
        );
    }
}
