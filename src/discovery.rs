//! Kit discovery and path resolution: maps user-typed CLI segments
//! `[kit] [cookbook] recipe` onto a concrete recipe (or group) directory.
//!
//! Kits are scanned from `./.hyper/kits/*` and `./cookbooks/*`, any extra
//! search roots, and globally installed packages named `<kit>-hyper-kit` or
//! `@hyper-kits/<kit>` through the package resolver port. Local kits win
//! over global ones.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use log::debug;

use crate::ports::PackageResolver;

const KIT_ROOTS: [&str; 2] = [".hyper/kits", "cookbooks"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedKind {
    Recipe,
    Group,
}

/// A successful resolution: the target directory plus which segments were
/// consumed. Unconsumed segments become positional arguments.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub kind: ResolvedKind,
    pub full_path: PathBuf,
    pub consumed: Vec<String>,
    pub remaining: Vec<String>,
}

/// Resolution failure carrying the deepest matched prefix and nearest-name
/// suggestions for the caller's "did you mean" output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub deepest_prefix: Vec<String>,
    pub suggestions: Vec<String>,
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.deepest_prefix.is_empty() {
            write!(f, "no recipe matched")?;
        } else {
            write!(f, "no recipe matched past '{}'", self.deepest_prefix.join(" "))?;
        }
        if !self.suggestions.is_empty() {
            write!(f, " (did you mean: {}?)", self.suggestions.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for NotFound {}

fn is_recipe_dir(path: &Path) -> bool {
    path.join("recipe.yml").is_file()
}

fn is_group_dir(path: &Path) -> bool {
    path.join("group.yml").is_file()
}

fn subdirs(path: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(path) else {
        return out;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            if let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) {
                out.push((name.to_string(), entry_path));
            }
        }
    }
    out.sort();
    out
}

/// All locally discovered kits, in precedence order.
pub fn local_kits(cwd: &Path, extra_roots: &[PathBuf]) -> Vec<(String, PathBuf)> {
    let mut kits = Vec::new();
    for root in KIT_ROOTS.iter().map(|r| cwd.join(r)).chain(extra_roots.iter().cloned()) {
        for (name, path) in subdirs(&root) {
            if !kits.iter().any(|(n, _)| n == &name) {
                kits.push((name, path));
            }
        }
    }
    kits
}

fn global_kit(name: &str, packages: &dyn PackageResolver) -> Option<PathBuf> {
    packages
        .local_path_for(&format!("{name}-hyper-kit"))
        .or_else(|| packages.local_path_for(&format!("@hyper-kits/{name}")))
        .or_else(|| packages.local_path_for(name))
}

/// Resolves CLI segments to a recipe or group directory.
pub fn resolve(
    segments: &[String],
    cwd: &Path,
    packages: &dyn PackageResolver,
) -> Result<ResolvedPath, NotFound> {
    resolve_with_roots(segments, cwd, &[], packages)
}

pub fn resolve_with_roots(
    segments: &[String],
    cwd: &Path,
    extra_roots: &[PathBuf],
    packages: &dyn PackageResolver,
) -> Result<ResolvedPath, NotFound> {
    let kits = local_kits(cwd, extra_roots);

    let Some(first) = segments.first() else {
        return Err(NotFound {
            deepest_prefix: Vec::new(),
            suggestions: kits.iter().map(|(n, _)| n.clone()).take(5).collect(),
        });
    };

    // A direct filesystem path consumes exactly one segment.
    if let Some(resolved) = resolve_direct_path(first, cwd, segments) {
        return Ok(resolved);
    }

    // first segment -> kit (local before global)
    let kit_path = kits
        .iter()
        .find(|(name, _)| name == first)
        .map(|(_, path)| path.clone())
        .or_else(|| global_kit(first, packages).filter(|p| p.is_dir()));

    let Some(kit_path) = kit_path else {
        debug!("no kit matched segment '{first}'");
        return Err(NotFound {
            deepest_prefix: Vec::new(),
            suggestions: nearest(first, kits.iter().map(|(n, _)| n.as_str())),
        });
    };

    resolve_in_kit(&kit_path, first, &segments[1..])
}

fn resolve_direct_path(first: &str, cwd: &Path, segments: &[String]) -> Option<ResolvedPath> {
    if !(first.contains('/') || first.starts_with('.') || Path::new(first).is_absolute()) {
        return None;
    }
    let candidate = if Path::new(first).is_absolute() {
        PathBuf::from(first)
    } else {
        cwd.join(first)
    };

    let (kind, dir) = if candidate.is_file() && candidate.ends_with("recipe.yml") {
        (ResolvedKind::Recipe, candidate.parent()?.to_path_buf())
    } else if candidate.is_dir() && is_recipe_dir(&candidate) {
        (ResolvedKind::Recipe, candidate)
    } else if candidate.is_dir() && is_group_dir(&candidate) {
        (ResolvedKind::Group, candidate)
    } else {
        return None;
    };

    Some(ResolvedPath {
        kind,
        full_path: dir,
        consumed: vec![first.to_string()],
        remaining: segments[1..].to_vec(),
    })
}

fn resolve_in_kit(
    kit_path: &Path,
    kit_name: &str,
    rest: &[String],
) -> Result<ResolvedPath, NotFound> {
    let cookbooks = subdirs(kit_path);

    let Some(second) = rest.first() else {
        if is_group_dir(kit_path) {
            return Ok(ResolvedPath {
                kind: ResolvedKind::Group,
                full_path: kit_path.to_path_buf(),
                consumed: vec![kit_name.to_string()],
                remaining: Vec::new(),
            });
        }
        return Err(NotFound {
            deepest_prefix: vec![kit_name.to_string()],
            suggestions: cookbooks.iter().map(|(n, _)| n.clone()).take(5).collect(),
        });
    };

    if let Some((_, cookbook_path)) = cookbooks.iter().find(|(name, _)| name == second) {
        return resolve_in_cookbook(
            cookbook_path,
            &[kit_name.to_string(), second.clone()],
            &rest[1..],
        );
    }

    // the cookbook segment is optional: try the next segment as a recipe in
    // any cookbook of this kit
    for (_, cookbook_path) in &cookbooks {
        let candidate = cookbook_path.join(second);
        if is_recipe_dir(&candidate) {
            return Ok(ResolvedPath {
                kind: ResolvedKind::Recipe,
                full_path: candidate,
                consumed: vec![kit_name.to_string(), second.clone()],
                remaining: rest[1..].to_vec(),
            });
        }
    }

    let mut candidates: Vec<String> = cookbooks.iter().map(|(n, _)| n.clone()).collect();
    for (_, cookbook_path) in &cookbooks {
        candidates.extend(subdirs(cookbook_path).into_iter().map(|(n, _)| n));
    }
    Err(NotFound {
        deepest_prefix: vec![kit_name.to_string()],
        suggestions: nearest(second, candidates.iter().map(String::as_str)),
    })
}

fn resolve_in_cookbook(
    cookbook_path: &Path,
    consumed: &[String],
    rest: &[String],
) -> Result<ResolvedPath, NotFound> {
    let recipes = subdirs(cookbook_path);

    let Some(third) = rest.first() else {
        if is_group_dir(cookbook_path) {
            return Ok(ResolvedPath {
                kind: ResolvedKind::Group,
                full_path: cookbook_path.to_path_buf(),
                consumed: consumed.to_vec(),
                remaining: Vec::new(),
            });
        }
        return Err(NotFound {
            deepest_prefix: consumed.to_vec(),
            suggestions: recipes.iter().map(|(n, _)| n.clone()).take(5).collect(),
        });
    };

    if let Some((_, recipe_path)) = recipes
        .iter()
        .find(|(name, path)| name == third && is_recipe_dir(path))
    {
        let mut consumed = consumed.to_vec();
        consumed.push(third.clone());
        return Ok(ResolvedPath {
            kind: ResolvedKind::Recipe,
            full_path: recipe_path.clone(),
            consumed,
            remaining: rest[1..].to_vec(),
        });
    }

    Err(NotFound {
        deepest_prefix: consumed.to_vec(),
        suggestions: nearest(third, recipes.iter().map(|(n, _)| n.as_str())),
    })
}

/// Nearest names by edit distance, closest first, capped at three.
fn nearest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut scored: Vec<(usize, String)> = candidates
        .map(|c| (levenshtein(target, c), c.to_string()))
        .filter(|(d, _)| *d <= 3)
        .collect();
    scored.sort();
    scored.into_iter().map(|(_, c)| c).take(3).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// A discovered kit with its cookbooks and recipes, for listings.
#[derive(Debug, Clone)]
pub struct KitInfo {
    pub name: String,
    pub path: PathBuf,
    pub cookbooks: Vec<CookbookInfo>,
}

#[derive(Debug, Clone)]
pub struct CookbookInfo {
    pub name: String,
    pub recipes: Vec<String>,
}

/// Scans the kit roots and builds the full namespace tree, respecting
/// `.hyperignore` files.
pub fn scan(cwd: &Path, extra_roots: &[PathBuf]) -> Vec<KitInfo> {
    local_kits(cwd, extra_roots)
        .into_iter()
        .map(|(name, path)| {
            let mut cookbooks: Vec<CookbookInfo> = Vec::new();
            let walker = WalkBuilder::new(&path)
                .add_custom_ignore_filename(".hyperignore")
                .max_depth(Some(3))
                .build();
            for entry in walker.flatten() {
                if entry.file_name() != "recipe.yml" {
                    continue;
                }
                let Some(recipe_dir) = entry.path().parent() else {
                    continue;
                };
                let Some(cookbook_dir) = recipe_dir.parent() else {
                    continue;
                };
                let recipe = recipe_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let cookbook = cookbook_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                match cookbooks.iter_mut().find(|c| c.name == cookbook) {
                    Some(info) => info.recipes.push(recipe),
                    None => cookbooks.push(CookbookInfo {
                        name: cookbook,
                        recipes: vec![recipe],
                    }),
                }
            }
            for cookbook in &mut cookbooks {
                cookbook.recipes.sort();
            }
            cookbooks.sort_by(|a, b| a.name.cmp(&b.name));
            KitInfo {
                name,
                path,
                cookbooks,
            }
        })
        .collect()
}
