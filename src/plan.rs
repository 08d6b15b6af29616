//! Step dependency planning: build the DAG from declared `dependsOn` edges,
//! reject cycles, and layer the steps into phases that the executor can run
//! with partial parallelism.

use std::collections::HashMap;

use console::style;
use indexmap::IndexMap;
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{Graph, NodeIndex};

use crate::recipe::Step;

/// Per-step entry in the plan graph. Dependents are a derived mirror used
/// only for planning and display; steps reference each other by name only.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub deps: Vec<String>,
    pub dependents: Vec<String>,
    pub depth: usize,
}

/// One scheduling unit: steps whose dependencies all live in earlier phases.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub index: usize,
    pub step_names: Vec<String>,
    pub parallel: bool,
}

/// The phased execution plan for one recipe run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub phases: Vec<PhasePlan>,
    pub graph: IndexMap<String, NodeInfo>,
    pub estimated_duration_ms: u64,
}

impl ExecutionPlan {
    pub fn phase_of(&self, step_name: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.step_names.iter().any(|n| n == step_name))
            .map(|p| p.index)
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.step_names.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    CircularDependency { cycle: Vec<String> },
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::CircularDependency { cycle } => {
                write!(f, "circular step dependency: {}", cycle.join(" -> "))
            }
        }
    }
}

impl std::error::Error for PlanError {}

// Rough per-step cost used only for the plan's duration estimate.
const STEP_ESTIMATE_MS: u64 = 100;

/// Builds the phased execution plan for the given steps.
///
/// Guarantees that for any step A listing B in `dependsOn`, A's phase index
/// is strictly greater than B's. Declaration order is preserved within each
/// phase. A phase is parallel only when it holds at least two steps, every
/// one of them allows parallelism, and the run's concurrency permits it.
pub fn plan(steps: &[Step], max_concurrency: usize) -> Result<ExecutionPlan, PlanError> {
    if steps.is_empty() {
        return Ok(ExecutionPlan::default());
    }

    let mut graph: Graph<String, ()> = Graph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for step in steps {
        let idx = graph.add_node(step.name.clone());
        index_of.insert(step.name.as_str(), idx);
    }
    for step in steps {
        let from = index_of[step.name.as_str()];
        for dep in &step.depends_on {
            // loader guarantees deps exist; a stale name would be its bug
            if let Some(&to) = index_of.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(PlanError::CircularDependency {
            cycle: extract_cycle(&graph, steps),
        });
    }

    // Depth per node: 0 for roots, 1 + max(dep depths) otherwise. toposort
    // yields dependents before their dependencies here (edges point at
    // deps), so walk it in reverse.
    let order = toposort(&graph, None).expect("graph verified acyclic");
    let mut depth: HashMap<String, usize> = HashMap::new();
    for idx in order.iter().rev() {
        let name = &graph[*idx];
        let step = steps.iter().find(|s| &s.name == name).expect("node from steps");
        let d = step
            .depends_on
            .iter()
            .filter_map(|dep| depth.get(dep))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(name.clone(), d);
    }

    let mut node_infos: IndexMap<String, NodeInfo> = steps
        .iter()
        .map(|step| {
            (
                step.name.clone(),
                NodeInfo {
                    deps: step.depends_on.clone(),
                    dependents: Vec::new(),
                    depth: depth[&step.name],
                },
            )
        })
        .collect();
    for step in steps {
        for dep in &step.depends_on {
            if let Some(info) = node_infos.get_mut(dep) {
                info.dependents.push(step.name.clone());
            }
        }
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut phases = Vec::with_capacity(max_depth + 1);
    let mut estimated = 0u64;

    for level in 0..=max_depth {
        // declaration order is the tie-break within a phase
        let members: Vec<&Step> = steps
            .iter()
            .filter(|s| depth[&s.name] == level)
            .collect();
        if members.is_empty() {
            continue;
        }

        let parallel =
            members.len() >= 2 && members.iter().all(|s| s.parallel) && max_concurrency > 1;

        estimated += if parallel {
            let lanes = max_concurrency.min(members.len()).max(1);
            (members.len().div_ceil(lanes) as u64) * STEP_ESTIMATE_MS
        } else {
            members.len() as u64 * STEP_ESTIMATE_MS
        };

        phases.push(PhasePlan {
            index: phases.len(),
            step_names: members.iter().map(|s| s.name.clone()).collect(),
            parallel,
        });
    }

    Ok(ExecutionPlan {
        phases,
        graph: node_infos,
        estimated_duration_ms: estimated,
    })
}

/// Pulls one offending cycle out of a cyclic graph, ordered by declaration
/// and closed by repeating the first name.
fn extract_cycle(graph: &Graph<String, ()>, steps: &[Step]) -> Vec<String> {
    let declaration_index = |name: &str| {
        steps
            .iter()
            .position(|s| s.name == name)
            .unwrap_or(usize::MAX)
    };

    for scc in tarjan_scc(graph) {
        let is_cycle = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if !is_cycle {
            continue;
        }
        let mut names: Vec<String> = scc.iter().map(|idx| graph[*idx].clone()).collect();
        names.sort_by_key(|n| declaration_index(n));
        let first = names[0].clone();
        names.push(first);
        return names;
    }
    Vec::new()
}

/// Renders the phased plan as a tree, used by dry runs.
pub fn display_plan(plan: &ExecutionPlan) {
    if plan.phases.is_empty() {
        println!("Nothing to execute.");
        return;
    }

    println!("\n{}", style("Execution Plan").bold().cyan());
    println!("{}", style("━".repeat(40)).cyan());
    println!("  steps: {}", plan.total_steps());
    println!("  phases: {}", plan.phases.len());
    println!("  estimated: ~{}ms", plan.estimated_duration_ms);
    println!();

    for phase in &plan.phases {
        let indent = " ".repeat(phase.index * 3);
        for (i, name) in phase.step_names.iter().enumerate() {
            let connector = if i == phase.step_names.len() - 1 {
                "└─ "
            } else {
                "├─ "
            };
            let marker = if phase.parallel {
                style("∥").green().to_string()
            } else {
                String::new()
            };
            println!("{indent}{connector}{name} {marker}");
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        serde_yaml::from_str(&format!(
            "name: {name}\ntool: action\naction: shell\ndependsOn: [{}]\n",
            deps.join(", ")
        ))
        .unwrap()
    }

    fn serial_step(name: &str, deps: &[&str]) -> Step {
        serde_yaml::from_str(&format!(
            "name: {name}\ntool: action\naction: shell\nparallel: false\ndependsOn: [{}]\n",
            deps.join(", ")
        ))
        .unwrap()
    }

    #[test]
    fn linear_chain_yields_single_step_phases() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let plan = plan(&steps, 4).unwrap();
        assert_eq!(plan.phases.len(), 3);
        for phase in &plan.phases {
            assert_eq!(phase.step_names.len(), 1);
            assert!(!phase.parallel);
        }
        assert_eq!(plan.phases[0].step_names, vec!["a"]);
        assert_eq!(plan.phases[2].step_names, vec!["c"]);
    }

    #[test]
    fn diamond_yields_parallel_middle_phase() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let plan = plan(&steps, 2).unwrap();
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[1].step_names, vec!["b", "c"]);
        assert!(plan.phases[1].parallel);
        assert!(!plan.phases[0].parallel);
        assert!(!plan.phases[2].parallel);
    }

    #[test]
    fn dependency_phases_strictly_precede_dependents() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a", "b"]),
            step("d", &[]),
        ];
        let plan = plan(&steps, 4).unwrap();
        for s in &steps {
            for dep in &s.depends_on {
                assert!(plan.phase_of(&s.name).unwrap() > plan.phase_of(dep).unwrap());
            }
        }
    }

    #[test]
    fn direct_cycle_is_rejected_with_path() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = plan(&steps, 4).unwrap_err();
        assert_eq!(
            err,
            PlanError::CircularDependency {
                cycle: vec!["a".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn self_cycle_is_rejected() {
        let steps = vec![step("a", &["a"])];
        let err = plan(&steps, 4).unwrap_err();
        match err {
            PlanError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a".to_string(), "a".to_string()]);
            }
        }
    }

    #[test]
    fn indirect_cycle_is_rejected() {
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        assert!(plan(&steps, 4).is_err());
    }

    #[test]
    fn serial_step_degrades_its_phase() {
        let steps = vec![step("a", &[]), serial_step("b", &[])];
        let plan = plan(&steps, 4).unwrap();
        assert_eq!(plan.phases.len(), 1);
        assert!(!plan.phases[0].parallel);
    }

    #[test]
    fn concurrency_of_one_disables_parallelism() {
        let steps = vec![step("a", &[]), step("b", &[])];
        let plan = plan(&steps, 1).unwrap();
        assert!(!plan.phases[0].parallel);
    }

    #[test]
    fn declaration_order_is_preserved_within_phase() {
        let steps = vec![step("z", &[]), step("a", &[]), step("m", &[])];
        let plan = plan(&steps, 4).unwrap();
        assert_eq!(plan.phases[0].step_names, vec!["z", "a", "m"]);
    }

    #[test]
    fn graph_mirror_carries_deps_dependents_and_depth() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let plan = plan(&steps, 4).unwrap();
        assert_eq!(plan.graph["a"].dependents, vec!["b"]);
        assert_eq!(plan.graph["b"].deps, vec!["a"]);
        assert_eq!(plan.graph["a"].depth, 0);
        assert_eq!(plan.graph["b"].depth, 1);
    }

    #[test]
    fn empty_steps_produce_empty_plan() {
        let plan = plan(&[], 4).unwrap();
        assert!(plan.phases.is_empty());
        assert_eq!(plan.total_steps(), 0);
    }
}
