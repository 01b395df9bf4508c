use crate::registry::{Registry, REQUIRED_BASE_TAG};
use anyhow::{Context, Result};
use std::{fs, path::Path};

/// Emit the dependency graph as Graphviz DOT. Disabled mods render dashed,
/// REQUIRED_BASE mods as boxes, everything else as ellipses.
pub fn write_dot(registry: &Registry, out: &Path) -> Result<()> {
    let dot = render_dot(registry);
    fs::write(out, dot).with_context(|| format!("write graph {}", out.display()))?;
    Ok(())
}

pub fn render_dot(registry: &Registry) -> String {
    let mut dot = String::from("digraph mods {\n    rankdir=LR;\n");
    for record in registry.mods.values() {
        let shape = if record.has_tag(REQUIRED_BASE_TAG) {
            "box"
        } else {
            "ellipse"
        };
        let style = if record.enabled { "solid" } else { "dashed" };
        dot.push_str(&format!(
            "    {} [shape={shape}, style={style}];\n",
            quote(&record.id)
        ));
    }
    for record in registry.mods.values() {
        for dep in &record.wants {
            dot.push_str(&format!(
                "    {} -> {};\n",
                quote(&record.id),
                quote(dep)
            ));
        }
    }
    dot.push_str("}\n");
    dot
}

fn quote(id: &str) -> String {
    format!("\"{}\"", id.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModRecord;

    #[test]
    fn dot_output_carries_nodes_and_edges() {
        let mut registry = Registry::default();
        let mut alpha = ModRecord::with_defaults("alpha");
        alpha.wants.push("beta".to_string());
        alpha.tags.push(REQUIRED_BASE_TAG.to_string());
        let mut beta = ModRecord::with_defaults("beta");
        beta.enabled = false;
        registry.mods.insert("alpha".into(), alpha);
        registry.mods.insert("beta".into(), beta);

        let dot = render_dot(&registry);
        assert!(dot.starts_with("digraph mods {"));
        assert!(dot.contains("\"alpha\" [shape=box, style=solid];"));
        assert!(dot.contains("\"beta\" [shape=ellipse, style=dashed];"));
        assert!(dot.contains("\"alpha\" -> \"beta\";"));
    }
}
