use crate::{
    registry::Registry,
    toggle::{disable_deep, enable_base_mods, enable_deep, Visited},
};
use anyhow::{bail, Result};
use std::collections::HashSet;

/// Which edge direction a closure expansion follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKey {
    Wants,
    WantedBy,
}

/// One bisection target, parsed from the operator's `section/scope` form.
/// `section` is 1-based on the command line and stored 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub section: usize,
    pub scope: usize,
}

impl Fraction {
    pub fn parse(raw: &str) -> Result<Self> {
        let (section, scope) = raw
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("expected section/scope, got {raw:?}"))?;
        let section: usize = section.trim().parse()?;
        let scope: usize = scope.trim().parse()?;
        if scope == 0 {
            bail!("scope must be at least 1");
        }
        if section == 0 || section > scope {
            bail!("section must be between 1 and {scope}");
        }
        Ok(Fraction {
            section: section - 1,
            scope,
        })
    }
}

/// Split `total` items into `divisor` near-equal groups: every group holds
/// `total / divisor` items and the remainder is handed out one item each to
/// the first groups in index order. Deterministic and stable across calls.
pub fn divide_into_groups(total: usize, divisor: usize) -> Vec<usize> {
    let base = total / divisor;
    let remainder = total % divisor;
    (0..divisor)
        .map(|index| base + usize::from(index < remainder))
        .collect()
}

/// The ids in group `section` of the partition plus their full transitive
/// closure along `dep_key`, self/alias edges excluded. The closure can pull
/// in ids from neighboring groups; the groups are a slicing heuristic, not
/// a mutually exclusive partition.
pub fn mods_in_group(
    registry: &Registry,
    ordered_ids: &[String],
    groups: &[usize],
    section: usize,
    dep_key: DepKey,
) -> HashSet<String> {
    let mut set = HashSet::new();
    if section >= groups.len() {
        return set;
    }
    let offset: usize = groups[..section].iter().sum();
    let end = (offset + groups[section]).min(ordered_ids.len());
    let mut work: Vec<String> = ordered_ids
        .get(offset..end)
        .unwrap_or(&[])
        .to_vec();
    set.extend(work.iter().cloned());

    while let Some(id) = work.pop() {
        let Some(record) = registry.mods.get(&id) else {
            continue;
        };
        let edges = match dep_key {
            DepKey::Wants => &record.wants,
            DepKey::WantedBy => &record.wanted_by,
        };
        for dep in edges {
            if record.is_alias(dep) {
                continue;
            }
            let canonical = match registry.resolve_id(dep) {
                Some(canonical) => canonical,
                None => continue,
            };
            if set.insert(canonical.clone()) {
                work.push(canonical);
            }
        }
    }
    set
}

/// Dry-run report for one fraction: the target group and its immediate
/// neighbors, each with its dependency closure.
#[derive(Debug)]
pub struct GroupReport {
    pub fraction: Fraction,
    pub previous: Option<HashSet<String>>,
    pub target: HashSet<String>,
    pub next: Option<HashSet<String>>,
}

pub fn report_groups(
    registry: &Registry,
    ordered_ids: &[String],
    fraction: Fraction,
) -> GroupReport {
    let groups = divide_into_groups(ordered_ids.len(), fraction.scope);
    let closure =
        |section: usize| mods_in_group(registry, ordered_ids, &groups, section, DepKey::Wants);

    GroupReport {
        fraction,
        previous: fraction.section.checked_sub(1).map(closure),
        target: closure(fraction.section),
        next: (fraction.section + 1 < groups.len()).then(|| closure(fraction.section + 1)),
    }
}

/// Live bisection: disable everything, then re-enable the intersection of
/// every supplied fraction's closure, then restore REQUIRED_BASE records.
/// Returns (disabled count, enabled count).
pub fn run_bisection(
    registry: &mut Registry,
    ordered_ids: &[String],
    fractions: &[Fraction],
) -> Result<(usize, usize)> {
    let mut keep: Option<HashSet<String>> = None;
    for fraction in fractions {
        let groups = divide_into_groups(ordered_ids.len(), fraction.scope);
        let closure = mods_in_group(
            registry,
            ordered_ids,
            &groups,
            fraction.section,
            DepKey::Wants,
        );
        keep = Some(match keep {
            None => closure,
            Some(prev) => prev.intersection(&closure).cloned().collect(),
        });
    }
    let keep = keep.unwrap_or_default();

    let mut disabled = 0;
    let mut visited = Visited::new();
    for id in ordered_ids {
        disabled += disable_deep(id, registry, &mut visited)?;
    }

    let mut enabled = 0;
    let mut visited = Visited::new();
    let mut keep: Vec<String> = keep.into_iter().collect();
    keep.sort();
    for id in keep {
        enabled += enable_deep(&id, registry, &mut visited)?;
    }
    enabled += enable_base_mods(registry)?;
    Ok((disabled, enabled))
}
