//! Dependency graph: translates module metadata into an ordered batch plan.
//!
//! The graph layer sits between registration (which modules are enabled) and
//! execution (which modules run when). It generates ordered, validated batch
//! plans: every module in batch *k* has all of its dependencies in batches
//! *0..k-1*, and modules sharing a batch are mutually independent.
//!
//! # Design
//!
//! - **Fail before execution**: cycles and unknown dependencies are detected
//!   at build time, before any module runs.
//! - **Deterministic**: ties are broken by ascending priority, then
//!   lexicographically by name, so the same module set always yields the same
//!   plan. Reproducible ordering is required for debugging flaky installs.
//! - **Conservative sequencing**: a `force_sequential` module always occupies
//!   a singleton batch, even when otherwise eligible to share one.

use crate::error::{FortifyError, Result};
use crate::module::ModuleDescriptor;
use std::collections::{BTreeMap, BTreeSet};

/// A validated module dependency DAG with its precomputed batch plan.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    descriptors: BTreeMap<String, ModuleDescriptor>,
    batches: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from the enabled module set.
    ///
    /// # Errors
    ///
    /// - `UnknownDependency` if a module depends on a name not in the set
    /// - `Cycle` if the dependency relation is not acyclic
    /// - `Config` if two descriptors share a name
    pub fn build(descriptors: &[ModuleDescriptor]) -> Result<Self> {
        let mut index: BTreeMap<String, ModuleDescriptor> = BTreeMap::new();
        for desc in descriptors {
            if index.insert(desc.name.clone(), desc.clone()).is_some() {
                return Err(FortifyError::config(format!(
                    "duplicate module name '{}'",
                    desc.name
                )));
            }
        }

        for desc in index.values() {
            for dep in &desc.depends_on {
                if !index.contains_key(dep) {
                    return Err(FortifyError::UnknownDependency {
                        module: desc.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let batches = layer_batches(&index)?;
        Ok(Self {
            descriptors: index,
            batches,
        })
    }

    /// The ordered sequence of parallel-safe batches.
    pub fn execution_batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Look up a registered descriptor by name.
    pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.get(name)
    }

    /// All registered descriptors, keyed by name.
    pub fn descriptors(&self) -> &BTreeMap<String, ModuleDescriptor> {
        &self.descriptors
    }

    /// Number of modules in the graph.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True if the graph has no modules.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Kahn's layering: each round emits the current zero-in-degree set, split so
/// that `force_sequential` modules land in singleton batches, then decrements
/// the in-degree of dependents.
fn layer_batches(index: &BTreeMap<String, ModuleDescriptor>) -> Result<Vec<Vec<String>>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for desc in index.values() {
        in_degree.insert(&desc.name, desc.depends_on.len());
        for dep in &desc.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&desc.name);
        }
    }

    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut batches: Vec<Vec<String>> = Vec::new();

    while emitted.len() < index.len() {
        let mut ready: Vec<&ModuleDescriptor> = in_degree
            .iter()
            .filter(|(name, deg)| **deg == 0 && !emitted.contains(*name))
            .map(|(name, _)| &index[*name])
            .collect();

        if ready.is_empty() {
            let remaining: BTreeSet<&str> = index
                .keys()
                .map(String::as_str)
                .filter(|n| !emitted.contains(n))
                .collect();
            return Err(FortifyError::Cycle {
                members: find_cycle(index, &remaining),
            });
        }

        // Deterministic order: ascending priority, then name.
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));

        // Walk the sorted ready set, grouping concurrent-safe modules and
        // flushing around each force_sequential singleton so batch order
        // still respects the (priority, name) key.
        let mut concurrent: Vec<String> = Vec::new();
        for desc in &ready {
            if desc.force_sequential {
                if !concurrent.is_empty() {
                    batches.push(std::mem::take(&mut concurrent));
                }
                batches.push(vec![desc.name.clone()]);
            } else {
                concurrent.push(desc.name.clone());
            }
        }
        if !concurrent.is_empty() {
            batches.push(concurrent);
        }

        for desc in ready {
            emitted.insert(&desc.name);
            if let Some(deps) = dependents.get(desc.name.as_str()) {
                for dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                    }
                }
            }
        }
    }

    Ok(batches)
}

/// Walk unsatisfied dependencies from the smallest stuck node until a node
/// repeats, returning the cycle as `[a, b, .., a]`.
fn find_cycle(
    index: &BTreeMap<String, ModuleDescriptor>,
    remaining: &BTreeSet<&str>,
) -> Vec<String> {
    let mut path: Vec<&str> = Vec::new();
    // BTreeSet iteration gives the smallest remaining name first.
    let mut current = match remaining.iter().next() {
        Some(name) => *name,
        None => return Vec::new(),
    };

    loop {
        if let Some(pos) = path.iter().position(|n| *n == current) {
            let mut members: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            members.push(current.to_string());
            return members;
        }
        path.push(current);

        let next = index[current]
            .depends_on
            .iter()
            .find(|dep| remaining.contains(dep.as_str()));
        match next {
            Some(dep) => current = dep,
            // Unreachable for a genuinely stuck set; bail with what we have.
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}
