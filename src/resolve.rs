//! Dependency resolution and compilation batch assembly.
//!
//! Turns a requested set of plugin units into a complete, consistent compile
//! set: header directives are parsed, requirements expanded transitively,
//! up-to-date dependencies short-circuited into references, libraries
//! resolved on disk, and cycles rejected. A batch is self-consistent: it
//! never emits a binary referencing a dependency unit that failed
//! resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::ForgeConfig;
use crate::error::ForgeError;
use crate::registry::{UnitHandle, UnitRegistry};
use crate::source::SourceCache;
use crate::unit::CompiledBinary;

static REQUIRES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^//\s*requires\s*:\s*([A-Za-z_][A-Za-z0-9_]*)\s*$").unwrap());
static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^//\s*reference\s*:\s*([A-Za-z0-9_.-]+)\s*$").unwrap());
static INCLUDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^//\s*include\s*:\s*(\S+)\s*$").unwrap());
static DECLARATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*plugin\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Header directives and top-level declarations parsed from one source file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Directives {
    /// Plugin names this unit requires
    pub requires: BTreeSet<String>,
    /// Library names this unit references
    pub references: BTreeSet<String>,
    /// Include-file paths
    pub includes: BTreeSet<PathBuf>,
    /// Top-level `plugin <Name>` declarations found in the body
    pub declared: Vec<String>,
}

/// Parse leading directives and scan for top-level plugin declarations.
pub fn parse_directives(text: &str) -> Directives {
    let mut directives = Directives::default();
    for line in text.lines() {
        if let Some(captures) = REQUIRES_RE.captures(line) {
            directives.requires.insert(captures[1].to_string());
        } else if let Some(captures) = REFERENCE_RE.captures(line) {
            directives.references.insert(captures[1].to_string());
        } else if let Some(captures) = INCLUDE_RE.captures(line) {
            directives.includes.insert(PathBuf::from(&captures[1]));
        } else if let Some(captures) = DECLARATION_RE.captures(line) {
            directives.declared.push(captures[1].to_string());
        }
    }
    directives
}

/// One unit confirmed compilable as part of a batch.
#[derive(Debug, Clone)]
pub struct BatchMember {
    /// Handle into the unit registry
    pub handle: UnitHandle,
    /// Plugin name (original casing)
    pub name: String,
    /// Source file name, used for diagnostic attribution
    pub file_name: String,
    /// Immutable source snapshot for this invocation
    pub source: String,
    /// Requirements declared by this unit
    pub requires: BTreeSet<String>,
    /// Whether the unit was requested directly (vs pulled in as a requirement)
    pub explicit: bool,
}

/// A requested set of units expanded into one compiler invocation.
#[derive(Debug)]
pub struct ResolvedBatch {
    /// Batch id
    pub id: u64,
    /// Members in dependency order (requirements before dependents)
    pub members: Vec<BatchMember>,
    /// Library name to on-disk path
    pub references: BTreeMap<String, PathBuf>,
    /// Requirements satisfied by already-compiled binaries
    pub satisfied: BTreeMap<String, Arc<CompiledBinary>>,
    /// Include files shared by the whole batch
    pub includes: BTreeSet<PathBuf>,
    /// Units that failed during resolution, with their diagnostics
    pub failures: Vec<ForgeError>,
}

impl ResolvedBatch {
    /// Names of the surviving members.
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

struct Candidate {
    member: BatchMember,
}

/// Expands a requested unit set into a [`ResolvedBatch`].
pub struct Resolver<'a> {
    registry: &'a UnitRegistry,
    cache: &'a SourceCache,
    config: &'a ForgeConfig,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over the given registry and cache.
    pub fn new(registry: &'a UnitRegistry, cache: &'a SourceCache, config: &'a ForgeConfig) -> Self {
        Self { registry, cache, config }
    }

    /// Run the resolution algorithm for one batch.
    pub async fn resolve(&self, id: u64, requested: Vec<String>) -> ResolvedBatch {
        let mut queue: VecDeque<(String, bool)> =
            requested.into_iter().map(|name| (name, true)).collect();

        let mut entries: HashMap<String, Candidate> = HashMap::new();
        let mut failed: HashMap<String, ForgeError> = HashMap::new();
        let mut required_by: HashMap<String, HashSet<String>> = HashMap::new();
        let mut references: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut satisfied: BTreeMap<String, Arc<CompiledBinary>> = BTreeMap::new();
        let mut includes: BTreeSet<PathBuf> = BTreeSet::new();

        while let Some((name, explicit)) = queue.pop_front() {
            let key = name.to_ascii_lowercase();
            if failed.contains_key(&key) {
                continue;
            }
            if let Some(existing) = entries.get_mut(&key) {
                existing.member.explicit |= explicit;
                continue;
            }

            let handle = self.registry.get_or_create(&name, self.config.source_path(&name));
            if let Err(e) = self.cache.refresh(&handle).await {
                failed.insert(key, e);
                continue;
            }

            let (source, _encoding) = match self.cache.snapshot(&handle) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    failed.insert(key, e);
                    continue;
                }
            };

            let directives = parse_directives(&source);
            let unit_name = handle.lock().name.clone();

            if let Err(e) = check_declaration(&unit_name, &directives.declared) {
                failed.insert(key, e);
                continue;
            }

            {
                let mut unit = handle.lock();
                unit.requires = directives.requires.clone();
                unit.references = directives.references.clone();
                unit.includes = directives.includes.clone();
            }

            let mut unit_failure: Option<ForgeError> = None;

            for library in &directives.references {
                let path = self.config.library_path(library);
                if path.exists() {
                    references.insert(library.clone(), path);
                } else {
                    unit_failure = Some(ForgeError::Dependency {
                        unit: unit_name.clone(),
                        reason: format!(
                            "referenced library '{library}' not found at {}",
                            path.display()
                        ),
                    });
                    break;
                }
            }

            if unit_failure.is_none() {
                for include in &directives.includes {
                    let path = if include.is_absolute() {
                        include.clone()
                    } else {
                        self.config.paths.include_dir.join(include)
                    };
                    if path.exists() {
                        includes.insert(path);
                    } else {
                        unit_failure = Some(ForgeError::Dependency {
                            unit: unit_name.clone(),
                            reason: format!("include file '{}' not found", include.display()),
                        });
                        break;
                    }
                }
            }

            if let Some(failure) = unit_failure {
                failed.insert(key, failure);
                continue;
            }

            for requirement in &directives.requires {
                let req_key = requirement.to_ascii_lowercase();
                required_by.entry(req_key.clone()).or_default().insert(key.clone());

                if entries.contains_key(&req_key) || failed.contains_key(&req_key) {
                    continue;
                }

                let dep_handle =
                    self.registry.get_or_create(requirement, self.config.source_path(requirement));
                match self.cache.refresh(&dep_handle).await {
                    Ok(false) if dep_handle.lock().has_current_binary() => {
                        let binary = dep_handle.lock().binary.clone();
                        if let Some(binary) = binary {
                            debug!(unit = %requirement, "requirement satisfied by up-to-date binary");
                            satisfied.insert(requirement.clone(), binary);
                        }
                    }
                    Ok(_) => queue.push_back((requirement.clone(), false)),
                    Err(e) => {
                        failed.insert(req_key, e);
                    }
                }
            }

            let file_name = handle.lock().file_name();
            entries.insert(
                key,
                Candidate {
                    member: BatchMember {
                        name: unit_name,
                        file_name,
                        source,
                        requires: directives.requires,
                        explicit,
                        handle,
                    },
                },
            );
        }

        fail_cycles(&mut entries, &mut failed);
        propagate_missing(&mut entries, &mut failed, &satisfied);
        let dropped = drop_exclusive_dependents(&mut entries, &failed, &required_by);
        for key in &dropped {
            debug!(unit = %key, "dropping requirement-only unit whose dependents all failed");
        }

        let members = topo_sort(entries);

        ResolvedBatch {
            id,
            members,
            references,
            satisfied,
            includes,
            failures: failed.into_values().collect(),
        }
    }
}

/// A unit must declare exactly one top-level type matching its own name.
fn check_declaration(name: &str, declared: &[String]) -> Result<(), ForgeError> {
    match declared {
        [single] if single == name => Ok(()),
        [] => Err(ForgeError::Structural {
            unit: name.to_string(),
            reason: format!("expected a top-level type named '{name}', found none"),
        }),
        [single] => Err(ForgeError::Structural {
            unit: name.to_string(),
            reason: format!("expected a top-level type named '{name}', found '{single}'"),
        }),
        many => Err(ForgeError::Structural {
            unit: name.to_string(),
            reason: format!(
                "expected a single top-level type named '{name}', found {}",
                many.join(", ")
            ),
        }),
    }
}

/// Detect cyclic `Requires` chains among batch members and fail every unit
/// on a cycle.
fn fail_cycles(entries: &mut HashMap<String, Candidate>, failed: &mut HashMap<String, ForgeError>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let keys: Vec<String> = entries.keys().cloned().collect();
    let edges: HashMap<String, Vec<String>> = entries
        .iter()
        .map(|(key, candidate)| {
            let deps = candidate
                .member
                .requires
                .iter()
                .map(|r| r.to_ascii_lowercase())
                .filter(|r| entries.contains_key(r))
                .collect();
            (key.clone(), deps)
        })
        .collect();

    let mut colors: HashMap<String, Color> = keys.iter().map(|k| (k.clone(), Color::White)).collect();
    let mut cycles: Vec<Vec<String>> = Vec::new();

    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        colors: &mut HashMap<String, Color>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        colors.insert(node.to_string(), Color::Gray);
        stack.push(node.to_string());
        for next in edges.get(node).into_iter().flatten() {
            match colors.get(next) {
                Some(Color::White) => visit(next, edges, colors, stack, cycles),
                Some(Color::Gray) => {
                    let start = stack.iter().position(|n| n == next).unwrap_or(0);
                    cycles.push(stack[start..].to_vec());
                }
                _ => {}
            }
        }
        stack.pop();
        colors.insert(node.to_string(), Color::Black);
    }

    let mut stack = Vec::new();
    for key in &keys {
        if colors[key] == Color::White {
            visit(key, &edges, &mut colors, &mut stack, &mut cycles);
        }
    }

    for cycle in cycles {
        let display: Vec<String> = cycle
            .iter()
            .filter_map(|k| entries.get(k).map(|c| c.member.name.clone()))
            .collect();
        let chain = display.join(" -> ");
        for key in cycle {
            if let Some(candidate) = entries.remove(&key) {
                failed.insert(
                    key,
                    ForgeError::Dependency {
                        unit: candidate.member.name,
                        reason: format!("cyclic requires chain: {chain}"),
                    },
                );
            }
        }
    }
}

/// Fail every member whose requirements cannot all be met, to a fixpoint.
fn propagate_missing(
    entries: &mut HashMap<String, Candidate>,
    failed: &mut HashMap<String, ForgeError>,
    satisfied: &BTreeMap<String, Arc<CompiledBinary>>,
) {
    let satisfied_keys: HashSet<String> =
        satisfied.keys().map(|k| k.to_ascii_lowercase()).collect();

    loop {
        let mut doomed: Option<(String, Vec<String>)> = None;
        for (key, candidate) in entries.iter() {
            let missing: Vec<String> = candidate
                .member
                .requires
                .iter()
                .filter(|r| {
                    let rk = r.to_ascii_lowercase();
                    !entries.contains_key(&rk) && !satisfied_keys.contains(&rk)
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                doomed = Some((key.clone(), missing));
                break;
            }
        }

        match doomed {
            Some((key, missing)) => {
                if let Some(candidate) = entries.remove(&key) {
                    failed.insert(
                        key,
                        ForgeError::Dependency {
                            unit: candidate.member.name,
                            reason: format!("missing dependencies: {}", missing.join(", ")),
                        },
                    );
                }
            }
            None => break,
        }
    }
}

/// Drop units kept in the batch only to satisfy requesters that all failed,
/// unless they already compiled successfully at least once.
fn drop_exclusive_dependents(
    entries: &mut HashMap<String, Candidate>,
    failed: &HashMap<String, ForgeError>,
    required_by: &HashMap<String, HashSet<String>>,
) -> Vec<String> {
    let mut dropped: HashSet<String> = HashSet::new();
    loop {
        let mut next: Option<String> = None;
        for (key, candidate) in entries.iter() {
            if candidate.member.explicit {
                continue;
            }
            let requesters = match required_by.get(key) {
                Some(set) if !set.is_empty() => set,
                _ => continue,
            };
            let all_gone = requesters
                .iter()
                .all(|r| failed.contains_key(r) || dropped.contains(r));
            let never_compiled = candidate.member.handle.lock().last_compiled.is_none();
            if all_gone && never_compiled {
                next = Some(key.clone());
                break;
            }
        }
        match next {
            Some(key) => {
                entries.remove(&key);
                dropped.insert(key);
            }
            None => break,
        }
    }
    dropped.into_iter().collect()
}

/// Order members so every requirement precedes its dependents, with a
/// stable name tiebreak.
fn topo_sort(entries: HashMap<String, Candidate>) -> Vec<BatchMember> {
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for (key, candidate) in &entries {
        in_degree.entry(key.clone()).or_insert(0);
        for req in &candidate.member.requires {
            let rk = req.to_ascii_lowercase();
            if entries.contains_key(&rk) {
                *in_degree.entry(key.clone()).or_insert(0) += 1;
                dependents.entry(rk).or_default().push(key.clone());
            }
        }
    }

    let mut ready: Vec<String> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(k, _)| k.clone()).collect();
    ready.sort_by(|a, b| b.cmp(a));

    let mut order: Vec<String> = Vec::with_capacity(entries.len());
    while let Some(key) = ready.pop() {
        order.push(key.clone());
        if let Some(deps) = dependents.get(&key) {
            for dependent in deps {
                let degree = in_degree.get_mut(dependent).expect("dependent tracked");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent.clone());
                    ready.sort_by(|a, b| b.cmp(a));
                }
            }
        }
    }

    let mut entries = entries;
    let mut members: Vec<BatchMember> = Vec::with_capacity(order.len());
    for key in order {
        if let Some(candidate) = entries.remove(&key) {
            members.push(candidate.member);
        }
    }
    members
}
