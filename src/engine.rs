//! The step executor and two-pass controller.
//!
//! Phases run strictly in order; within a parallel phase, steps run
//! concurrently under a semaphore up to the configured concurrency. A fatal
//! step failure stops new phases from starting while in-flight steps settle.
//! The controller on top drives the AI protocol: a serialized collect pass,
//! the transport hand-off, and the write pass.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use indexmap::IndexMap;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, error};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ai::{AiAnswers, AiCollector, AiState};
use crate::condition::{self, Scope};
use crate::defer::Deferred;
use crate::plan::{self, ExecutionPlan, PlanError};
use crate::ports::{Ports, TransportContext, TransportOutcome};
use crate::recipe::{Recipe, Step};
use crate::registry::Registries;
use crate::result::{
    aggregate, new_execution_id, now_millis, RecipeResult, StepError, StepResult, StepResults,
    StepStatus,
};
use crate::tools::{self, ToolCtx};
use crate::variables::{
    self, AskMode, Resolution, ResolutionError, ResolveOptions, VariableEnvironment,
};

/// How long in-flight steps may settle after a fatal failure or external
/// cancel before they are aborted outright.
const SETTLE_GRACE: Duration = Duration::from_secs(30);

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ask: AskMode,
    pub no_defaults: bool,
    pub force: bool,
    pub continue_on_error: bool,
    pub max_concurrency: usize,
    pub verbose: bool,
}

impl RunOptions {
    pub fn interactive(&self) -> bool {
        self.ask == AskMode::Me
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ask: AskMode::Me,
            no_defaults: false,
            force: false,
            continue_on_error: false,
            max_concurrency: default_concurrency(),
            verbose: false,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get().saturating_sub(1).max(1))
        .unwrap_or(4)
}

/// Inputs for one `Engine::run` invocation.
#[derive(Default)]
pub struct RunParams {
    pub cli_params: IndexMap<String, String>,
    pub positionals: Vec<String>,
    /// Pre-resolved AI answers (`--answers`); skips Pass 1 entirely.
    pub answers: Option<AiAnswers>,
    pub options: RunOptions,
}

/// Errors that abort a run before any step executes.
#[derive(Debug)]
pub enum EngineError {
    Resolution(ResolutionError),
    Plan(PlanError),
    Other(anyhow::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Resolution(e) => e.fmt(f),
            EngineError::Plan(e) => e.fmt(f),
            EngineError::Other(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ResolutionError> for EngineError {
    fn from(e: ResolutionError) -> Self {
        EngineError::Resolution(e)
    }
}

impl From<PlanError> for EngineError {
    fn from(e: PlanError) -> Self {
        EngineError::Plan(e)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Other(e)
    }
}

/// What a run produced: a finished result, or a deferral to the user after
/// the transport printed its prompt document.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RecipeResult),
    Deferred { exit_code: i32 },
}

/// The recipe execution engine. Cheap to clone; ports and registries are
/// shared.
#[derive(Clone)]
pub struct Engine {
    ports: Ports,
    registries: Arc<Registries>,
}

impl Engine {
    pub fn new(ports: Ports, registries: Registries) -> Self {
        Self {
            ports,
            registries: Arc::new(registries),
        }
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    /// Runs one recipe end to end: variable resolution, planning, and the
    /// two-pass AI protocol around step execution.
    pub async fn run(
        &self,
        recipe: Arc<Recipe>,
        project_root: &Path,
        params: RunParams,
    ) -> Result<RunOutcome, EngineError> {
        let transport_ctx = TransportContext {
            recipe_name: recipe.name.clone(),
            recipe_description: recipe.description.clone(),
            working_dir: project_root.to_path_buf(),
        };

        let resolve_opts = ResolveOptions {
            ask: params.options.ask,
            no_defaults: params.options.no_defaults,
            answers: None,
            cli_params: &params.cli_params,
            positionals: &params.positionals,
        };
        let env = match variables::resolve(
            &recipe,
            &resolve_opts,
            &*self.ports.prompter,
            &*self.ports.transport,
            &transport_ctx,
        )
        .await?
        {
            Resolution::Resolved(env) => env,
            Resolution::Deferred { exit_code } => return Ok(RunOutcome::Deferred { exit_code }),
        };

        let opts = Arc::new(params.options);
        let full_plan = plan::plan(&recipe.steps, opts.max_concurrency)?;

        // Pass 2 directly: the user supplied answers, Pass 1 is skipped.
        if let Some(answers) = params.answers {
            let result = self
                .execute(
                    recipe,
                    project_root,
                    full_plan,
                    Arc::new(env.with_collect_mode(false)),
                    AiState::writing(Arc::new(answers)),
                    opts,
                    CancellationToken::new(),
                )
                .await;
            return Ok(RunOutcome::Completed(result));
        }

        // Pass 1: collect with concurrency one so the collector is never
        // touched across a parallel boundary. The collector lives for this
        // run only.
        let collector = Arc::new(AiCollector::new());
        let mut run_scope = Deferred::new();
        {
            let collector = collector.clone();
            run_scope.push(move || collector.clear());
        }

        let collect_plan = plan::plan(&recipe.steps, 1)?;
        let collect_opts = Arc::new(RunOptions {
            max_concurrency: 1,
            ..(*opts).clone()
        });
        let pass1 = self
            .execute(
                recipe.clone(),
                project_root,
                collect_plan,
                Arc::new(env.with_collect_mode(true)),
                AiState::collecting(collector.clone()),
                collect_opts,
                CancellationToken::new(),
            )
            .await;

        if !pass1.success {
            return Ok(RunOutcome::Completed(pass1));
        }

        let write_env = Arc::new(env.with_collect_mode(false));

        if collector.is_empty() {
            // No @ai usage: Pass 1 was a dry discovery, re-run once to
            // materialize files. Variables are carried over.
            debug!("collector empty after pass 1, re-running to materialize files");
            let result = self
                .execute(
                    recipe,
                    project_root,
                    full_plan,
                    write_env,
                    AiState::writing(Arc::new(AiAnswers::new())),
                    opts,
                    CancellationToken::new(),
                )
                .await;
            return Ok(RunOutcome::Completed(result));
        }

        debug!("pass 1 collected {} AI entries", collector.len());
        let outcome = self
            .ports
            .transport
            .resolve(&collector, &transport_ctx)
            .await
            .map_err(EngineError::Other)?;

        match outcome {
            TransportOutcome::Deferred { exit_code } => Ok(RunOutcome::Deferred { exit_code }),
            TransportOutcome::Resolved(answers) => {
                let result = self
                    .execute(
                        recipe,
                        project_root,
                        full_plan,
                        write_env,
                        AiState::writing(Arc::new(answers)),
                        opts,
                        CancellationToken::new(),
                    )
                    .await;
                Ok(RunOutcome::Completed(result))
            }
        }
    }

    /// Executes one pass over the plan.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute(
        &self,
        recipe: Arc<Recipe>,
        project_root: &Path,
        plan: ExecutionPlan,
        env: Arc<VariableEnvironment>,
        ai: AiState,
        opts: Arc<RunOptions>,
        cancel: CancellationToken,
    ) -> RecipeResult {
        let started_at = now_millis();
        let execution_id = new_execution_id();
        let multi = MultiProgress::new();
        let mut results = StepResults::new();
        let mut fatal = false;

        for phase in &plan.phases {
            // published results from earlier phases; single writer, many
            // readers across the phase barrier
            let snapshot = Arc::new(results.clone());

            let mut runnable: Vec<(Step, Option<bool>)> = Vec::new();
            for name in &phase.step_names {
                let step = recipe
                    .step(name)
                    .expect("plan only references recipe steps")
                    .clone();
                match gate(&step, &env, &snapshot, &opts) {
                    Gate::Run(condition_result) => runnable.push((step, condition_result)),
                    Gate::Skip(result) => {
                        debug!("skipping step '{}': {:?}", name, result.skip_reason);
                        results.insert(name.clone(), result);
                    }
                    Gate::Fail(result) => {
                        if !opts.continue_on_error {
                            fatal = true;
                        }
                        results.insert(name.clone(), result);
                    }
                }
            }

            // after a fatal failure no new step starts; remaining steps
            // still settle into a terminal skipped status
            if cancel.is_cancelled() || (fatal && !opts.continue_on_error) {
                for (step, _) in runnable {
                    results.insert(
                        step.name.clone(),
                        StepResult::skipped(&step.name, step.tool.kind(), "run aborted"),
                    );
                }
                continue;
            }

            if phase.parallel && runnable.len() > 1 {
                let semaphore = Arc::new(Semaphore::new(opts.max_concurrency.max(1)));
                let mut join_set: JoinSet<StepResult> = JoinSet::new();

                for (step, condition_result) in runnable {
                    let semaphore = semaphore.clone();
                    let ctx = self.tool_ctx(&step, &recipe, project_root, &env, &snapshot, &ai, &opts, &cancel);
                    let progress = progress_for(&multi, &opts, &step.name);
                    join_set.spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("semaphore is never closed");
                        if ctx.cancel.is_cancelled() {
                            // queued but never started; not an in-flight step
                            return StepResult::skipped(
                                &ctx.step.name,
                                ctx.step.tool.kind(),
                                "run aborted",
                            );
                        }
                        run_step(ctx, condition_result, progress).await
                    });
                }

                loop {
                    let joined = if cancel.is_cancelled() {
                        match tokio::time::timeout(SETTLE_GRACE, join_set.join_next()).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                error!("in-flight steps did not settle within grace, aborting");
                                join_set.abort_all();
                                break;
                            }
                        }
                    } else {
                        join_set.join_next().await
                    };
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(result) => {
                            if result.status == StepStatus::Failed && !opts.continue_on_error {
                                fatal = true;
                                cancel.cancel();
                            }
                            results.insert(result.step_name.clone(), result);
                        }
                        Err(e) => error!("step task failed to join: {e}"),
                    }
                }
            } else {
                for (step, condition_result) in runnable {
                    if cancel.is_cancelled() || (fatal && !opts.continue_on_error) {
                        results.insert(
                            step.name.clone(),
                            StepResult::skipped(&step.name, step.tool.kind(), "run aborted"),
                        );
                        continue;
                    }
                    let ctx = self.tool_ctx(&step, &recipe, project_root, &env, &snapshot, &ai, &opts, &cancel);
                    let progress = progress_for(&multi, &opts, &step.name);
                    let result = run_step(ctx, condition_result, progress).await;
                    if result.status == StepStatus::Failed && !opts.continue_on_error {
                        fatal = true;
                        cancel.cancel();
                    }
                    results.insert(step.name.clone(), result);
                }
            }
        }

        // steps that never started stay pending in the result map
        for step in &recipe.steps {
            if !results.contains_key(&step.name) {
                results.insert(step.name.clone(), StepResult::new(&step.name, step.tool.kind()));
            }
        }

        aggregate(
            results,
            env.values().clone(),
            Vec::new(),
            started_at,
            project_root.to_path_buf(),
            execution_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn tool_ctx(
        &self,
        step: &Step,
        recipe: &Arc<Recipe>,
        project_root: &Path,
        env: &Arc<VariableEnvironment>,
        snapshot: &Arc<StepResults>,
        ai: &AiState,
        opts: &Arc<RunOptions>,
        cancel: &CancellationToken,
    ) -> ToolCtx {
        ToolCtx {
            step: step.clone(),
            env: env.clone(),
            snapshot: snapshot.clone(),
            recipe_dir: recipe.dir.clone(),
            project_root: project_root.to_path_buf(),
            ports: self.ports.clone(),
            registries: self.registries.clone(),
            ai: ai.clone(),
            opts: opts.clone(),
            cancel: cancel.clone(),
        }
    }
}

enum Gate {
    Run(Option<bool>),
    Skip(StepResult),
    Fail(StepResult),
}

/// Decides whether a step runs, skips, or fails before dispatch. A failed
/// dependency skips the step (unless the run continues on error); a skipped
/// dependency does not.
fn gate(
    step: &Step,
    env: &VariableEnvironment,
    snapshot: &StepResults,
    opts: &RunOptions,
) -> Gate {
    let failed_dep = step.depends_on.iter().any(|dep| {
        snapshot
            .get(dep)
            .map(|r| r.status == StepStatus::Failed)
            .unwrap_or(false)
    });
    if failed_dep && !opts.continue_on_error {
        let mut result = StepResult::skipped(&step.name, step.tool.kind(), "upstream failure");
        result.dependencies_satisfied = false;
        return Gate::Skip(result);
    }

    if let Some(expr) = &step.when {
        let scope = Scope::new(env, snapshot);
        match condition::evaluate(expr, &scope) {
            Ok(true) => {
                return Gate::Run(Some(true));
            }
            Ok(false) => {
                let mut result =
                    StepResult::skipped(&step.name, step.tool.kind(), "condition false");
                result.condition_result = Some(false);
                return Gate::Skip(result);
            }
            Err(e) => {
                let mut result = StepResult::new(&step.name, step.tool.kind());
                result.status = StepStatus::Failed;
                result.started_at = now_millis();
                result.ended_at = result.started_at;
                result.error = Some(StepError::condition(e.to_string()));
                return Gate::Fail(result);
            }
        }
    }
    Gate::Run(None)
}

fn progress_for(multi: &MultiProgress, opts: &RunOptions, name: &str) -> Option<ProgressBar> {
    if opts.verbose {
        return None;
    }
    let bar = multi.add(ProgressBar::new_spinner().with_message(format!("Running step {name}...")));
    bar.enable_steady_tick(Duration::from_millis(100));
    Some(bar)
}

/// Runs one step through its attempts, recording timing, retries and file
/// effects. Failures clear file lists before the next attempt.
async fn run_step(
    ctx: ToolCtx,
    condition_result: Option<bool>,
    progress: Option<ProgressBar>,
) -> StepResult {
    let mut result = StepResult::new(&ctx.step.name, ctx.step.tool.kind());
    result.condition_result = condition_result;
    result.status = StepStatus::Running;
    result.started_at = now_millis();
    debug!("running step '{}' ({})", ctx.step.name, ctx.step.tool.kind());

    for attempt in 0..=ctx.step.retries {
        result.retry_count = attempt;

        if ctx.cancel.is_cancelled() {
            result.error = Some(StepError::cancelled());
            break;
        }

        let outcome = match ctx.step.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), tools::dispatch(&ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StepError::timeout(ms)),
                }
            }
            None => tools::dispatch(&ctx).await,
        };

        match outcome {
            Ok(out) => {
                result.output = out.output;
                result.files_created = out.files_created;
                result.files_modified = out.files_modified;
                result.files_deleted = out.files_deleted;
                result.error = None;
                result.status = StepStatus::Completed;
                break;
            }
            Err(e) => {
                debug!(
                    "step '{}' attempt {} failed: {e}",
                    ctx.step.name,
                    attempt + 1
                );
                result.error = Some(e);
                result.files_created.clear();
                result.files_modified.clear();
                result.files_deleted.clear();
            }
        }
    }

    if result.status != StepStatus::Completed {
        result.status = StepStatus::Failed;
    }
    result.ended_at = now_millis();
    result.duration_ms = result.ended_at.saturating_sub(result.started_at);

    if let Some(bar) = progress {
        let mark = match result.status {
            StepStatus::Completed => style("✓").green().to_string(),
            StepStatus::Failed => style("✗").red().to_string(),
            _ => style("-").dim().to_string(),
        };
        bar.finish_with_message(format!("Running step {}... {mark}", ctx.step.name));
    }
    result
}

/// Runs a nested recipe for the recipe tool. The child sees only the params
/// explicitly passed to it, shares the parent's AI pass and cancellation,
/// and reports its aggregate back to the parent step.
// Returns a boxed future rather than being declared `async fn` so the
// compiler doesn't need to resolve this function's opaque return type while
// it's still resolving `Engine::execute`'s: this function calls `execute`,
// and `execute` (via the recipe tool) calls back into this function.
pub(crate) fn run_child(
    parent: ToolCtx,
    child_dir: PathBuf,
    params: IndexMap<String, JsonValue>,
) -> Pin<Box<dyn Future<Output = Result<RecipeResult, StepError>> + Send>> {
    Box::pin(run_child_inner(parent, child_dir, params))
}

async fn run_child_inner(
    parent: ToolCtx,
    child_dir: PathBuf,
    params: IndexMap<String, JsonValue>,
) -> Result<RecipeResult, StepError> {
    let recipe = crate::recipe::load(&child_dir)
        .map_err(|e| StepError::tool_with_cause("failed to load child recipe", e.to_string()))?;
    let recipe = Arc::new(recipe);

    let transport_ctx = TransportContext {
        recipe_name: recipe.name.clone(),
        recipe_description: recipe.description.clone(),
        working_dir: parent.project_root.clone(),
    };

    let empty_params: IndexMap<String, String> = IndexMap::new();
    let resolve_opts = ResolveOptions {
        ask: parent.opts.ask,
        no_defaults: parent.opts.no_defaults,
        answers: Some(&params),
        cli_params: &empty_params,
        positionals: &[],
    };
    let env = match variables::resolve(
        &recipe,
        &resolve_opts,
        &*parent.ports.prompter,
        &*parent.ports.transport,
        &transport_ctx,
    )
    .await
    {
        Ok(Resolution::Resolved(env)) => env,
        Ok(Resolution::Deferred { .. }) => {
            return Err(StepError::tool(
                "child recipe deferred to the AI transport mid-run",
            ));
        }
        Err(e) => {
            return Err(StepError::tool_with_cause(
                "child variable resolution failed",
                e.to_string(),
            ));
        }
    };

    let max_concurrency = if parent.ai.collect_mode {
        1
    } else {
        parent.opts.max_concurrency
    };
    let child_plan =
        plan::plan(&recipe.steps, max_concurrency).map_err(|e| StepError::tool(e.to_string()))?;

    let engine = Engine {
        ports: parent.ports.clone(),
        registries: parent.registries.clone(),
    };
    let env = Arc::new(env.with_collect_mode(parent.ai.collect_mode));
    Ok(engine
        .execute(
            recipe,
            &parent.project_root,
            child_plan,
            env,
            parent.ai.clone(),
            parent.opts.clone(),
            parent.cancel.clone(),
        )
        .await)
}
