use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

/// Library crates that must stay free of I/O stacks and of the service crate.
const RULES: &[(&str, &[&str])] = &[
    (
        "extapi-expr",
        &["axum", "extapi-gateway", "reqwest", "sqlx", "tokio"],
    ),
    ("extapi-policy", &["axum", "extapi-gateway", "sqlx", "tokio"]),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;
    for (package_name, forbidden) in RULES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name.as_str() == *package_name)
            .with_context(|| format!("package `{}` not found in workspace", package_name))?;

        let violations = forbidden_reachable(&adjacency, &id_to_name, &package.id, forbidden);
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency path to {}",
                package_name,
                forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.into_iter().collect::<Vec<_>>().join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Names from `forbidden` reachable from `root`, following transitive edges.
fn forbidden_reachable<Id>(
    adjacency: &HashMap<Id, Vec<Id>>,
    id_to_name: &HashMap<Id, &str>,
    root: &Id,
    forbidden: &[&str],
) -> BTreeSet<String>
where
    Id: Clone + Eq + Hash,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = BTreeSet::new();
    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && forbidden.contains(name)
            {
                violations.insert((*name).to_string());
            }

            queue.push_back(dep);
        }
    }
    violations
}
