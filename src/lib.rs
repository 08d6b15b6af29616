//! Hypergen executes declarative, multi-step scaffolding recipes: template
//! rendering, action functions, code modifications and nested recipes, with
//! variable resolution, dependency-ordered phases and optional AI
//! assistance.

pub mod ai;
pub mod condition;
pub mod defer;
pub mod discovery;
pub mod engine;
pub mod plan;
pub mod ports;
pub mod recipe;
pub mod registry;
pub mod result;
pub mod tools;
pub mod variables;

#[cfg(test)]
pub mod test_utils;

pub use engine::{Engine, RunOptions, RunOutcome};
pub use recipe::Recipe;
pub use result::RecipeResult;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use console::style;
use env_logger::Env;
use indexmap::IndexMap;

use crate::engine::{EngineError, RunParams};
use crate::ports::{NoPackages, Ports};
use crate::registry::Registries;
use crate::variables::{AskMode, ResolutionError};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_DEFERRED: i32 = 2;
pub const EXIT_INVALID: i32 = 3;
pub const EXIT_MISSING_VARIABLE: i32 = 4;

const DEFAULT_LOG_LEVEL: &str = "warn";

/// Hypergen is a code-scaffolding engine that runs declarative, multi-step
/// recipes against a target project.
///
/// Recipes live in kits (directories of cookbooks, each holding recipes) and
/// compose templates, actions, code modifications and nested recipes.
#[derive(Parser, Debug)]
#[command(name = "hypergen", version, about, long_about)]
pub enum Cli {
    /// Execute a recipe
    Run(RunArgs),
    /// List discovered kits, cookbooks and recipes
    List(ListArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Recipe path segments `[kit] [cookbook] recipe`, followed by
    /// `--key=value` variable params and positional variable values
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub tokens: Vec<String>,

    /// Show the execution plan without writing anything
    #[arg(long)]
    pub dry: bool,

    /// Overwrite existing files without asking
    #[arg(long)]
    pub force: bool,

    /// JSON file with AI answers; skips the collect pass
    #[arg(long)]
    pub answers: Option<PathBuf>,

    /// Who fills unresolved variables: me, ai, stdout or nobody
    #[arg(long, default_value = "me")]
    pub ask: String,

    /// Never apply declared defaults; unresolved variables are asked for
    /// with the default shown as a suggestion
    #[arg(long = "no-defaults")]
    pub no_defaults: bool,

    /// Keep executing steps after a failure
    #[arg(long)]
    pub continue_on_error: bool,

    /// Maximum number of steps to execute concurrently
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Project root to operate on (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Restrict the listing to one kit
    pub kit: Option<String>,

    #[arg(long)]
    pub cwd: Option<PathBuf>,
}

pub fn parse_ask(s: &str) -> anyhow::Result<AskMode> {
    match s {
        "me" => Ok(AskMode::Me),
        // "stdout" is the ai mode wired to the default stdout transport
        "ai" | "stdout" => Ok(AskMode::Ai),
        "nobody" => Ok(AskMode::Nobody),
        other => bail!("invalid --ask mode '{other}', expected me, ai, stdout or nobody"),
    }
}

/// The fully partitioned `run` invocation: recipe segments and positionals
/// in one list (the path resolver decides where segments end), `--key=value`
/// variable params, and engine flags.
#[derive(Debug, Default)]
pub struct RunInvocation {
    pub segments: Vec<String>,
    pub params: IndexMap<String, String>,
    pub args: RunArgs,
}

/// Splits the trailing tokens into bare segments/positionals, `--key=value`
/// params, and engine flags that appeared after the first segment (clap only
/// sees flags placed before it).
pub fn partition_tokens(mut args: RunArgs) -> anyhow::Result<RunInvocation> {
    let tokens = std::mem::take(&mut args.tokens);
    let mut segments = Vec::new();
    let mut params = IndexMap::new();

    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        let Some(flag) = token.strip_prefix("--") else {
            segments.push(token);
            continue;
        };

        if let Some((key, value)) = flag.split_once('=') {
            match key {
                "ask" => args.ask = value.to_string(),
                "answers" => args.answers = Some(PathBuf::from(value)),
                "jobs" => args.jobs = Some(value.parse()?),
                "cwd" => args.cwd = Some(PathBuf::from(value)),
                _ => {
                    params.insert(key.to_string(), value.to_string());
                }
            }
            continue;
        }

        match flag {
            "dry" => args.dry = true,
            "force" => args.force = true,
            "no-defaults" => args.no_defaults = true,
            "continue-on-error" => args.continue_on_error = true,
            "verbose" => args.verbose += 1,
            "ask" | "answers" | "jobs" | "cwd" => {
                let Some(value) = iter.next() else {
                    bail!("flag --{flag} requires a value");
                };
                match flag {
                    "ask" => args.ask = value,
                    "answers" => args.answers = Some(PathBuf::from(value)),
                    "jobs" => args.jobs = Some(value.parse()?),
                    "cwd" => args.cwd = Some(PathBuf::from(value)),
                    _ => unreachable!(),
                }
            }
            other => bail!("unknown flag --{other}; variable params use --name=value"),
        }
    }

    Ok(RunInvocation {
        segments,
        params,
        args,
    })
}

fn resolve_cwd(cwd: &Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match cwd {
        Some(path) => Ok(std::path::absolute(path)?),
        None => Ok(std::env::current_dir()?),
    }
}

/// Main entry point for the binary: parses arguments, runs the requested
/// command, and maps the outcome to an exit code.
pub async fn run() -> i32 {
    env_logger::Builder::from_env(Env::default().default_filter_or(DEFAULT_LOG_LEVEL)).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return EXIT_INVALID;
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return EXIT_SUCCESS;
        }
    };

    match cli {
        Cli::Run(args) => match handle_run(args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{} {e:#}", style("✗").red());
                EXIT_INVALID
            }
        },
        Cli::List(args) => match handle_list(args) {
            Ok(()) => EXIT_SUCCESS,
            Err(e) => {
                eprintln!("{} {e:#}", style("✗").red());
                EXIT_INVALID
            }
        },
    }
}

async fn handle_run(args: RunArgs) -> anyhow::Result<i32> {
    let invocation = partition_tokens(args)?;
    let args = &invocation.args;
    let cwd = resolve_cwd(&args.cwd)?;
    let ask = parse_ask(&args.ask)?;

    let resolved = match discovery::resolve(&invocation.segments, &cwd, &NoPackages) {
        Ok(resolved) => resolved,
        Err(not_found) => {
            eprintln!("{} {not_found}", style("✗").red());
            return Ok(EXIT_INVALID);
        }
    };

    if resolved.kind == discovery::ResolvedKind::Group {
        eprintln!(
            "'{}' is a recipe group; pick one of its recipes",
            resolved.consumed.join(" ")
        );
        return Ok(EXIT_INVALID);
    }

    let recipe = match recipe::load(&resolved.full_path) {
        Ok(recipe) => Arc::new(recipe),
        Err(e) => {
            eprintln!("{} {e}", style("✗").red());
            return Ok(EXIT_INVALID);
        }
    };

    let options = RunOptions {
        ask,
        no_defaults: args.no_defaults,
        force: args.force,
        continue_on_error: args.continue_on_error,
        max_concurrency: args
            .jobs
            .unwrap_or_else(|| RunOptions::default().max_concurrency),
        verbose: args.verbose > 0,
    };

    if args.dry {
        match plan::plan(&recipe.steps, options.max_concurrency) {
            Ok(execution_plan) => {
                plan::display_plan(&execution_plan);
                return Ok(EXIT_SUCCESS);
            }
            Err(e) => {
                eprintln!("{} {e}", style("✗").red());
                return Ok(EXIT_INVALID);
            }
        }
    }

    let answers = match &args.answers {
        Some(path) => Some(ai::load_answers(path)?),
        None => None,
    };

    let engine = Engine::new(
        Ports::local_defaults(&cwd, false),
        Registries::with_builtins(),
    );

    let params = RunParams {
        cli_params: invocation.params,
        positionals: resolved.remaining,
        answers,
        options,
    };

    match engine.run(recipe, &cwd, params).await {
        Ok(RunOutcome::Completed(result)) => {
            print_result(&result);
            Ok(if result.success {
                EXIT_SUCCESS
            } else {
                EXIT_FAILED
            })
        }
        Ok(RunOutcome::Deferred { exit_code }) => Ok(exit_code),
        Err(EngineError::Resolution(e)) => {
            eprintln!("{} {e}", style("✗").red());
            Ok(match e {
                ResolutionError::MissingRequired { .. } => EXIT_MISSING_VARIABLE,
                _ => EXIT_INVALID,
            })
        }
        Err(EngineError::Plan(e)) => {
            eprintln!("{} {e}", style("✗").red());
            Ok(EXIT_INVALID)
        }
        Err(EngineError::Other(e)) => {
            eprintln!("{} {e:#}", style("✗").red());
            Ok(EXIT_FAILED)
        }
    }
}

fn print_result(result: &RecipeResult) {
    for path in &result.files_created {
        println!("{} created   {}", style("+").green(), path.display());
    }
    for path in &result.files_modified {
        println!("{} modified  {}", style("~").yellow(), path.display());
    }
    for path in &result.files_deleted {
        println!("{} deleted   {}", style("-").red(), path.display());
    }
    for error in &result.errors {
        eprintln!("{} {error}", style("✗").red());
    }

    let meta = &result.metadata;
    let mark = if result.success {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "{mark} {} of {} steps completed ({} failed, {} skipped) in {}ms",
        meta.completed_steps,
        meta.total_steps,
        meta.failed_steps,
        meta.skipped_steps,
        meta.duration_ms
    );
}

fn handle_list(args: ListArgs) -> anyhow::Result<()> {
    let cwd = resolve_cwd(&args.cwd)?;
    let kits = discovery::scan(&cwd, &[]);

    let kits: Vec<_> = match &args.kit {
        Some(name) => kits.into_iter().filter(|k| &k.name == name).collect(),
        None => kits,
    };

    if kits.is_empty() {
        println!("No kits found under {}", cwd.display());
        return Ok(());
    }

    for kit in kits {
        println!("{}", style(&kit.name).bold().cyan());
        for cookbook in &kit.cookbooks {
            println!("  {}", style(&cookbook.name).bold());
            for recipe_name in &cookbook.recipes {
                println!("    {recipe_name}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(tokens: &[&str]) -> RunArgs {
        RunArgs {
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn partition_splits_segments_params_and_flags() {
        let invocation = partition_tokens(run_args(&[
            "starter",
            "crud",
            "api",
            "--name=MyThing",
            "Positional",
            "--force",
            "--ask=nobody",
        ]))
        .unwrap();
        assert_eq!(
            invocation.segments,
            vec!["starter", "crud", "api", "Positional"]
        );
        assert_eq!(invocation.params.get("name"), Some(&"MyThing".to_string()));
        assert!(invocation.args.force);
        assert_eq!(invocation.args.ask, "nobody");
    }

    #[test]
    fn partition_supports_space_separated_flag_values() {
        let invocation =
            partition_tokens(run_args(&["api", "--answers", "answers.json", "--jobs", "2"]))
                .unwrap();
        assert_eq!(invocation.args.answers, Some(PathBuf::from("answers.json")));
        assert_eq!(invocation.args.jobs, Some(2));
    }

    #[test]
    fn unknown_bare_flag_is_rejected() {
        assert!(partition_tokens(run_args(&["api", "--frobnicate"])).is_err());
    }

    #[test]
    fn unknown_key_value_becomes_a_param() {
        let invocation = partition_tokens(run_args(&["api", "--anything=goes"])).unwrap();
        assert_eq!(invocation.params.get("anything"), Some(&"goes".to_string()));
    }

    #[test]
    fn ask_modes_parse() {
        assert_eq!(parse_ask("me").unwrap(), AskMode::Me);
        assert_eq!(parse_ask("ai").unwrap(), AskMode::Ai);
        assert_eq!(parse_ask("stdout").unwrap(), AskMode::Ai);
        assert_eq!(parse_ask("nobody").unwrap(), AskMode::Nobody);
        assert!(parse_ask("everyone").is_err());
    }

    #[test]
    fn cli_parses_run_with_leading_flags() {
        let cli = Cli::try_parse_from([
            "hypergen", "run", "--dry", "--force", "starter", "crud", "api",
        ])
        .unwrap();
        match cli {
            Cli::Run(args) => {
                assert!(args.dry);
                assert!(args.force);
                assert_eq!(args.tokens, vec!["starter", "crud", "api"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_list() {
        let cli = Cli::try_parse_from(["hypergen", "list", "starter"]).unwrap();
        match cli {
            Cli::List(args) => assert_eq!(args.kit.as_deref(), Some("starter")),
            _ => panic!("expected list"),
        }
    }
}
