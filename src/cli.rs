use crate::{
    config::AppConfig,
    extract, graph,
    partition::{self, Fraction},
    reconcile,
    registry::Registry,
    scan, toggle, update,
};
use anyhow::{bail, Result};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf};
use tracing::warn;

const STORE_FILE: &str = "modlist.json";

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

struct GlobalOptions {
    format: OutputFormat,
    folder: Option<PathBuf>,
}

enum CliCommand {
    Refresh,
    List,
    Enable { id: String, deep: bool },
    Disable { id: String, deep: bool },
    Toggle { id: String, deep: bool },
    EnableAll,
    DisableAll,
    Binary { fractions: Vec<Fraction>, dry: bool },
    Graph { out: Option<PathBuf> },
    Update { apply: bool },
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args);
    let command = parse_command(&tokens)?;

    match command {
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
        CliCommand::Version => {
            println!("modvault v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load_or_create()?;
    let folder = global
        .folder
        .clone()
        .unwrap_or_else(|| config.mods_folder.clone());
    if !folder.is_dir() {
        bail!("mods folder {} does not exist", folder.display());
    }
    let ctx = Ctx {
        config,
        store: folder.join(STORE_FILE),
        folder,
        format: global.format,
    };
    run_command(&ctx, command)
}

struct Ctx {
    config: AppConfig,
    folder: PathBuf,
    store: PathBuf,
    format: OutputFormat,
}

fn parse_global_options(args: &[String]) -> (GlobalOptions, Vec<String>) {
    let mut format = OutputFormat::Text;
    let mut folder = None;
    let mut tokens = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            if let Some(parsed) = OutputFormat::parse(value) {
                format = parsed;
            }
            continue;
        }
        if arg == "--format" {
            if let Some(value) = iter.next() {
                if let Some(parsed) = OutputFormat::parse(value) {
                    format = parsed;
                }
            }
            continue;
        }
        if let Some(value) = arg.strip_prefix("--folder=") {
            folder = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--folder" {
            if let Some(value) = iter.next() {
                folder = Some(PathBuf::from(value));
            }
            continue;
        }
        tokens.push(arg.to_string());
    }
    (GlobalOptions { format, folder }, tokens)
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "refresh" => Ok(CliCommand::Refresh),
        "list" => Ok(CliCommand::List),
        "enable" | "disable" | "toggle" => {
            let mut id = None;
            let mut deep = false;
            for arg in rest {
                match arg.as_str() {
                    "--deep" | "-d" => deep = true,
                    value if id.is_none() => id = Some(value.to_string()),
                    value => bail!("unexpected argument: {value}"),
                }
            }
            let Some(id) = id else {
                bail!("{head} requires a mod id");
            };
            Ok(match head.as_str() {
                "enable" => CliCommand::Enable { id, deep },
                "disable" => CliCommand::Disable { id, deep },
                _ => CliCommand::Toggle { id, deep },
            })
        }
        "enable-all" => Ok(CliCommand::EnableAll),
        "disable-all" => Ok(CliCommand::DisableAll),
        "binary" => {
            let mut fractions = Vec::new();
            let mut dry = false;
            for arg in rest {
                match arg.as_str() {
                    "--dry" => dry = true,
                    value => fractions.push(Fraction::parse(value)?),
                }
            }
            if fractions.is_empty() {
                bail!("binary requires at least one section/scope fraction");
            }
            Ok(CliCommand::Binary { fractions, dry })
        }
        "graph" => {
            let mut out = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--out" => out = iter.next().map(PathBuf::from),
                    value if value.starts_with("--out=") => {
                        out = Some(PathBuf::from(value.trim_start_matches("--out=")));
                    }
                    value => bail!("unexpected argument: {value}"),
                }
            }
            Ok(CliCommand::Graph { out })
        }
        "update" => {
            let apply = rest.iter().any(|arg| arg == "--apply");
            Ok(CliCommand::Update { apply })
        }
        "help" | "--help" | "-h" => Ok(CliCommand::Help),
        "version" | "--version" | "-V" => Ok(CliCommand::Version),
        other => bail!("unknown command: {other} (try 'modvault help')"),
    }
}

fn run_command(ctx: &Ctx, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Refresh => refresh(ctx),
        CliCommand::List => list(ctx),
        CliCommand::Enable { id, deep } => {
            with_registry(ctx, |registry| {
                let id = resolve(registry, &id)?;
                let changes = if deep {
                    toggle::enable_deep(&id, registry, &mut toggle::Visited::new())?
                } else {
                    toggle::enable_one(&id, registry)?
                };
                println!("{changes} mod(s) enabled");
                Ok(())
            })
        }
        CliCommand::Disable { id, deep } => {
            with_registry(ctx, |registry| {
                let id = resolve(registry, &id)?;
                let changes = if deep {
                    let count =
                        toggle::disable_deep(&id, registry, &mut toggle::Visited::new())?;
                    toggle::enable_base_mods(registry)?;
                    count
                } else {
                    toggle::disable_one(&id, registry)?
                };
                println!("{changes} mod(s) disabled");
                Ok(())
            })
        }
        CliCommand::Toggle { id, deep } => {
            with_registry(ctx, |registry| {
                let id = resolve(registry, &id)?;
                let changes = if deep {
                    toggle::toggle_deep(&id, registry, &mut toggle::Visited::new())?
                } else {
                    match registry.mods.get(&id).map(|r| r.enabled) {
                        Some(true) => toggle::disable_one(&id, registry)?,
                        Some(false) => toggle::enable_one(&id, registry)?,
                        None => 0,
                    }
                };
                println!("{changes} mod(s) toggled");
                Ok(())
            })
        }
        CliCommand::EnableAll => {
            with_registry(ctx, |registry| {
                let mut visited = toggle::Visited::new();
                let mut changes = 0;
                for id in registry.ordered_ids() {
                    changes += toggle::enable_deep(&id, registry, &mut visited)?;
                }
                println!("{changes} mod(s) enabled");
                Ok(())
            })
        }
        CliCommand::DisableAll => {
            with_registry(ctx, |registry| {
                let mut visited = toggle::Visited::new();
                let mut changes = 0;
                for id in registry.ordered_ids() {
                    changes += toggle::disable_deep(&id, registry, &mut visited)?;
                }
                let restored = toggle::enable_base_mods(registry)?;
                println!("{changes} mod(s) disabled, {restored} base mod(s) restored");
                Ok(())
            })
        }
        CliCommand::Binary { fractions, dry } => binary(ctx, &fractions, dry),
        CliCommand::Graph { out } => {
            let registry = Registry::load(&ctx.store)?;
            let out = out.unwrap_or_else(|| ctx.folder.join("mods.dot"));
            graph::write_dot(&registry, &out)?;
            println!("dependency graph written to {}", out.display());
            Ok(())
        }
        CliCommand::Update { apply } => {
            with_registry(ctx, |registry| {
                let reports =
                    update::check_all(registry, &ctx.config, &ctx.folder, apply)?;
                if reports.is_empty() {
                    println!("no mods eligible for update checks");
                }
                for report in &reports {
                    println!("{}", update::describe_outcome(report));
                }
                Ok(())
            })
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

/// Load the registry, run the mutation, persist once at the end.
fn with_registry<F>(ctx: &Ctx, op: F) -> Result<()>
where
    F: FnOnce(&mut Registry) -> Result<()>,
{
    let mut registry = Registry::load(&ctx.store)?;
    op(&mut registry)?;
    registry.save(&ctx.store)
}

fn resolve(registry: &Registry, raw: &str) -> Result<String> {
    registry
        .resolve_id(raw)
        .ok_or_else(|| anyhow::anyhow!("unknown mod: {raw}"))
}

fn refresh(ctx: &Ctx) -> Result<()> {
    let files = scan::scan_folder(&ctx.folder, ctx.config.scan_depth, &ctx.config.ignored_dir);
    let mut extracted = BTreeMap::new();
    let scanned = files.len();
    for path in files {
        let identity = extract::extract(&path);
        if identity.id.is_none() {
            warn!(path = %path.display(), "no mod id resolvable, skipping archive");
            continue;
        }
        extracted.insert(path, identity);
    }

    let mut registry = Registry::load(&ctx.store)?;
    reconcile::reconcile(&extracted, &mut registry);
    registry.save(&ctx.store)?;
    println!(
        "{scanned} archive(s) scanned, {} mod(s) tracked",
        registry.mods.len()
    );
    Ok(())
}

#[derive(Serialize)]
struct ModListItem {
    id: String,
    version: String,
    enabled: bool,
    wants: Vec<String>,
    tags: Vec<String>,
    file: String,
}

fn list(ctx: &Ctx) -> Result<()> {
    let registry = Registry::load(&ctx.store)?;
    let items: Vec<ModListItem> = registry
        .mods
        .values()
        .map(|record| ModListItem {
            id: record.id.clone(),
            version: record.update_state.version.clone(),
            enabled: record.enabled,
            wants: record.wants.clone(),
            tags: record.tags.clone(),
            file: record.file_path.display().to_string(),
        })
        .collect();

    match ctx.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            if items.is_empty() {
                println!("no mods tracked (run 'modvault refresh')");
            }
            for item in items {
                let enabled = if item.enabled { "x" } else { " " };
                let wants = if item.wants.is_empty() {
                    String::new()
                } else {
                    format!("  wants: {}", item.wants.join(", "))
                };
                let tags = if item.tags.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", item.tags.join(","))
                };
                println!(
                    "[{enabled}] {id:<30} {version:<12}{wants}{tags}",
                    id = item.id,
                    version = item.version
                );
            }
        }
    }
    Ok(())
}

fn binary(ctx: &Ctx, fractions: &[Fraction], dry: bool) -> Result<()> {
    let mut registry = Registry::load(&ctx.store)?;
    let ordered = registry.ordered_ids();
    if ordered.is_empty() {
        bail!("registry is empty; run 'modvault refresh' first");
    }

    if dry {
        for fraction in fractions {
            let report = partition::report_groups(&registry, &ordered, *fraction);
            print_group(
                "previous",
                report.previous.as_ref(),
                report.fraction.scope,
            );
            print_group("target", Some(&report.target), report.fraction.scope);
            print_group("next", report.next.as_ref(), report.fraction.scope);
        }
        return Ok(());
    }

    let (disabled, enabled) = partition::run_bisection(&mut registry, &ordered, fractions)?;
    registry.save(&ctx.store)?;
    println!("{disabled} mod(s) disabled, {enabled} re-enabled for the target group");
    Ok(())
}

fn print_group(
    label: &str,
    group: Option<&std::collections::HashSet<String>>,
    scope: usize,
) {
    match group {
        None => println!("{label}: (none)"),
        Some(set) => {
            let mut ids: Vec<&String> = set.iter().collect();
            ids.sort();
            println!("{label} group (1/{scope} slice, {} with closure):", ids.len());
            for id in ids {
                println!("  {id}");
            }
        }
    }
}

fn print_help() {
    println!("modvault v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modvault refresh                     Rescan the folder and update the store");
    println!("  modvault list                        List tracked mods");
    println!("  modvault enable <id> [--deep]        Enable a mod (and dependencies with --deep)");
    println!("  modvault disable <id> [--deep]       Disable a mod (and dependents with --deep)");
    println!("  modvault toggle <id> [--deep]        Invert a mod's state");
    println!("  modvault enable-all                  Enable every tracked mod");
    println!("  modvault disable-all                 Disable everything, keep REQUIRED_BASE up");
    println!("  modvault binary <n/m>... [--dry]     Bisect: enable only group n of m");
    println!("  modvault graph [--out <path>]        Write the dependency graph as DOT");
    println!("  modvault update [--apply]            Check release feeds for newer versions");
    println!();
    println!("Global options:");
    println!("  --folder <path>                      Mods folder (defaults to config)");
    println!("  --format <json|text>                 Output format for list");
    println!("  -h, --help                           Show help");
    println!("  -V, --version                        Show version");
}
