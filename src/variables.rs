//! Variable resolution: each declared variable is resolved through an ordered
//! provider chain (pre-resolved answers → CLI `--name=value` → positionals →
//! defaults → interactive prompt or AI batch), then coerced to its declared
//! type and validated. Coercion is the sole place raw input becomes a typed
//! value.

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use serde_json::{json, Value as JsonValue};

use crate::ai::{AiCollector, AiEntry};
use crate::ports::{Prompter, Transport, TransportContext, TransportOutcome};
use crate::recipe::{Recipe, VariableSpec, VariableType};

/// Finalized `name → value` mapping, immutable for the duration of one
/// recipe execution. Also carries the collect-mode flag gating the AI pass.
#[derive(Debug, Clone, Default)]
pub struct VariableEnvironment {
    values: IndexMap<String, JsonValue>,
    collect_mode: bool,
}

impl VariableEnvironment {
    pub fn new(values: IndexMap<String, JsonValue>) -> Self {
        Self {
            values,
            collect_mode: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &IndexMap<String, JsonValue> {
        &self.values
    }

    pub fn collect_mode(&self) -> bool {
        self.collect_mode
    }

    /// A copy of this environment with the collect-mode flag toggled. The
    /// environment itself stays immutable across passes.
    pub fn with_collect_mode(&self, collect_mode: bool) -> Self {
        Self {
            values: self.values.clone(),
            collect_mode,
        }
    }

    /// Data object handed to template rendering: every variable at the top
    /// level, prior step results under `stepResults`, and the pass flag
    /// under `__collectMode`.
    pub fn template_data(&self, step_results: JsonValue) -> JsonValue {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), value.clone());
        }
        map.insert("stepResults".to_string(), step_results);
        map.insert("__collectMode".to_string(), json!(self.collect_mode));
        JsonValue::Object(map)
    }
}

/// Who fills unresolved variables after the static provider chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AskMode {
    #[default]
    Me,
    Ai,
    Nobody,
}

/// Errors from the variable stage. These abort the run before any step
/// executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    MissingRequired {
        name: String,
    },
    InvalidValue {
        name: String,
        reason: String,
    },
    CoercionFailed {
        name: String,
        reason: String,
    },
    /// More positionals were supplied than variables carry a `position`.
    UnexpectedPositional {
        got: usize,
        bound: usize,
    },
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionError::MissingRequired { name } => {
                write!(f, "Missing required variable: {name}")
            }
            ResolutionError::InvalidValue { name, reason } => {
                write!(f, "Invalid value for variable '{name}': {reason}")
            }
            ResolutionError::CoercionFailed { name, reason } => {
                write!(f, "Could not coerce variable '{name}': {reason}")
            }
            ResolutionError::UnexpectedPositional { got, bound } => {
                write!(
                    f,
                    "Unexpected positional argument: {got} given, only {bound} positional variable(s) declared"
                )
            }
        }
    }
}

impl std::error::Error for ResolutionError {}

/// Outcome of resolution: a finished environment, or a deferral from the AI
/// transport (the user was handed a prompt document).
#[derive(Debug)]
pub enum Resolution {
    Resolved(VariableEnvironment),
    Deferred { exit_code: i32 },
}

/// Inputs to one resolution pass.
pub struct ResolveOptions<'a> {
    pub ask: AskMode,
    pub no_defaults: bool,
    /// Pre-resolved values (Pass 2 carry-over, or a parent recipe's params).
    pub answers: Option<&'a IndexMap<String, JsonValue>>,
    pub cli_params: &'a IndexMap<String, String>,
    pub positionals: &'a [String],
}

/// Resolves every declared variable of `recipe`. Deterministic given
/// identical inputs and deterministic prompter/transport.
pub async fn resolve(
    recipe: &Recipe,
    opts: &ResolveOptions<'_>,
    prompter: &dyn Prompter,
    transport: &dyn Transport,
    ctx: &TransportContext,
) -> Result<Resolution, ResolutionError> {
    let positional_vars = recipe.positional_variables();
    if opts.positionals.len() > positional_vars.len() {
        return Err(ResolutionError::UnexpectedPositional {
            got: opts.positionals.len(),
            bound: positional_vars.len(),
        });
    }

    let mut resolved: IndexMap<String, JsonValue> = IndexMap::new();
    let mut unresolved: Vec<(String, VariableSpec)> = Vec::new();

    for (name, spec) in &recipe.variables {
        if let Some(answers) = opts.answers {
            if let Some(value) = answers.get(name) {
                let value = coerce(name, spec, value.clone())?;
                validate_value(name, spec, &value)?;
                resolved.insert(name.clone(), value);
                continue;
            }
        }

        if let Some(raw) = opts.cli_params.get(name) {
            let value = coerce(name, spec, JsonValue::String(raw.clone()))?;
            validate_value(name, spec, &value)?;
            resolved.insert(name.clone(), value);
            continue;
        }

        if let Some(position) = spec.position {
            if let Some(raw) = opts.positionals.get(position) {
                let value = coerce(name, spec, JsonValue::String(raw.clone()))?;
                validate_value(name, spec, &value)?;
                resolved.insert(name.clone(), value);
                continue;
            }
        }

        if !opts.no_defaults {
            if let Some(default) = &spec.default {
                let value = coerce(name, spec, default.clone())?;
                validate_value(name, spec, &value)?;
                resolved.insert(name.clone(), value);
                continue;
            }
        }

        unresolved.push((name.clone(), spec.clone()));
    }

    if !unresolved.is_empty() {
        match opts.ask {
            AskMode::Me => {
                for (name, spec) in &unresolved {
                    let raw = prompter.ask(name, spec).await.map_err(|e| {
                        ResolutionError::InvalidValue {
                            name: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    let value = coerce(name, spec, raw)?;
                    validate_value(name, spec, &value)?;
                    resolved.insert(name.clone(), value);
                }
                unresolved.clear();
            }
            AskMode::Ai => {
                match resolve_batch_with_ai(recipe, &resolved, &unresolved, transport, ctx).await?
                {
                    BatchOutcome::Answers(values) => {
                        for (name, value) in values {
                            resolved.insert(name.clone(), value);
                            unresolved.retain(|(n, _)| n != &name);
                        }
                    }
                    BatchOutcome::Deferred { exit_code } => {
                        return Ok(Resolution::Deferred { exit_code });
                    }
                }
            }
            AskMode::Nobody => {}
        }
    }

    if let Some((name, _)) = unresolved.iter().find(|(_, spec)| spec.required) {
        return Err(ResolutionError::MissingRequired { name: name.clone() });
    }

    Ok(Resolution::Resolved(VariableEnvironment::new(resolved)))
}

enum BatchOutcome {
    Answers(Vec<(String, JsonValue)>),
    Deferred { exit_code: i32 },
}

const BATCH_KEY: &str = "variables";

/// Sends a single batch prompt describing the unresolved variables and
/// parses the JSON object the transport returns. Answers failing coercion or
/// validation are dropped; the variable simply remains unresolved.
async fn resolve_batch_with_ai(
    recipe: &Recipe,
    resolved: &IndexMap<String, JsonValue>,
    unresolved: &[(String, VariableSpec)],
    transport: &dyn Transport,
    ctx: &TransportContext,
) -> Result<BatchOutcome, ResolutionError> {
    let collector = AiCollector::new();
    collector.record(AiEntry {
        key: BATCH_KEY.to_string(),
        prompt: build_batch_prompt(recipe, resolved, unresolved),
        contexts: Vec::new(),
        examples: Vec::new(),
    });

    let outcome =
        transport
            .resolve(&collector, ctx)
            .await
            .map_err(|e| ResolutionError::InvalidValue {
                name: BATCH_KEY.to_string(),
                reason: format!("transport failed: {e}"),
            })?;

    match outcome {
        TransportOutcome::Deferred { exit_code } => Ok(BatchOutcome::Deferred { exit_code }),
        TransportOutcome::Resolved(answers) => {
            let Some(raw) = answers.get(BATCH_KEY) else {
                return Ok(BatchOutcome::Answers(Vec::new()));
            };
            let parsed: JsonValue = match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(e) => {
                    debug!("AI variable answer is not valid JSON, dropping: {e}");
                    return Ok(BatchOutcome::Answers(Vec::new()));
                }
            };
            let Some(object) = parsed.as_object() else {
                return Ok(BatchOutcome::Answers(Vec::new()));
            };

            let mut accepted = Vec::new();
            for (name, spec) in unresolved {
                let Some(value) = object.get(name) else {
                    continue;
                };
                match coerce(name, spec, value.clone())
                    .and_then(|v| validate_value(name, spec, &v).map(|_| v))
                {
                    Ok(value) => accepted.push((name.clone(), value)),
                    Err(e) => debug!("dropping AI answer for '{name}': {e}"),
                }
            }
            Ok(BatchOutcome::Answers(accepted))
        }
    }
}

fn build_batch_prompt(
    recipe: &Recipe,
    resolved: &IndexMap<String, JsonValue>,
    unresolved: &[(String, VariableSpec)],
) -> String {
    let mut prompt = format!(
        "You are filling in variables for the code-scaffolding recipe '{}'",
        recipe.name
    );
    if !recipe.description.is_empty() {
        prompt.push_str(&format!(" ({})", recipe.description));
    }
    prompt.push_str(".\n\n");

    if !resolved.is_empty() {
        prompt.push_str("Already resolved variables:\n");
        for (name, value) in resolved {
            prompt.push_str(&format!("  {name} = {value}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str("Provide values for these variables:\n");
    for (name, spec) in unresolved {
        prompt.push_str(&format!("  - {name} (type: {})", spec.var_type.as_str()));
        if let Some(description) = &spec.description {
            prompt.push_str(&format!(": {description}"));
        }
        if !spec.values.is_empty() {
            prompt.push_str(&format!(" [one of: {}]", spec.values.join(", ")));
        }
        if let Some(pattern) = &spec.pattern {
            prompt.push_str(&format!(" [pattern: {pattern}]"));
        }
        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            prompt.push_str(&format!(" [range: {min}..{max}]"));
        }
        if let Some(hint) = spec.hint() {
            prompt.push_str(&format!(" [suggestion: {hint}]"));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "\nRespond with a single JSON object mapping each variable name to its value.\n",
    );
    prompt
}

/// Converts a raw value into the declared variable type. The only conversion
/// point in the engine.
pub fn coerce(
    name: &str,
    spec: &VariableSpec,
    value: JsonValue,
) -> Result<JsonValue, ResolutionError> {
    let fail = |reason: String| ResolutionError::CoercionFailed {
        name: name.to_string(),
        reason,
    };

    match spec.var_type {
        VariableType::String | VariableType::File | VariableType::Directory => match value {
            JsonValue::String(s) => Ok(JsonValue::String(s)),
            JsonValue::Number(n) => Ok(JsonValue::String(n.to_string())),
            JsonValue::Bool(b) => Ok(JsonValue::String(b.to_string())),
            // toString applies to every value; structured ones stringify as JSON
            other => serde_json::to_string(&other)
                .map(JsonValue::String)
                .map_err(|e| fail(e.to_string())),
        },
        VariableType::Number => match value {
            JsonValue::Number(n) => Ok(JsonValue::Number(n)),
            JsonValue::String(s) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    Ok(json!(i))
                } else {
                    match s.trim().parse::<f64>() {
                        Ok(f) if f.is_finite() => Ok(json!(f)),
                        _ => Err(fail(format!("'{s}' is not a number"))),
                    }
                }
            }
            other => Err(fail(format!("expected a number, got {other}"))),
        },
        VariableType::Boolean => match value {
            JsonValue::Bool(b) => Ok(JsonValue::Bool(b)),
            JsonValue::String(s) => match s.trim() {
                "true" => Ok(JsonValue::Bool(true)),
                "false" => Ok(JsonValue::Bool(false)),
                other => Err(fail(format!("'{other}' is not a boolean"))),
            },
            other => Err(fail(format!("expected a boolean, got {other}"))),
        },
        VariableType::Enum if !spec.multiple => {
            let text = scalar_to_string(&value)
                .ok_or_else(|| fail("enum value must be a scalar".to_string()))?;
            if spec.values.iter().any(|v| v == &text) {
                Ok(JsonValue::String(text))
            } else {
                Err(fail(format!(
                    "'{text}' is not one of [{}]",
                    spec.values.join(", ")
                )))
            }
        }
        VariableType::Enum => {
            let candidates: Vec<String> = match value {
                JsonValue::Array(items) => items
                    .iter()
                    .filter_map(scalar_to_string)
                    .collect(),
                JsonValue::String(s) => {
                    s.split(',').map(|p| p.trim().to_string()).collect()
                }
                other => return Err(fail(format!("expected an array, got {other}"))),
            };
            let kept: Vec<JsonValue> = candidates
                .into_iter()
                .filter(|c| spec.values.iter().any(|v| v == c))
                .map(JsonValue::String)
                .collect();
            if kept.is_empty() {
                Err(fail(format!(
                    "no values matched [{}]",
                    spec.values.join(", ")
                )))
            } else {
                Ok(JsonValue::Array(kept))
            }
        }
        VariableType::Array => match value {
            JsonValue::Array(items) => Ok(JsonValue::Array(items)),
            JsonValue::String(s) => Ok(JsonValue::Array(
                s.split(',')
                    .map(|p| JsonValue::String(p.trim().to_string()))
                    .collect(),
            )),
            other => Err(fail(format!("expected an array, got {other}"))),
        },
        VariableType::Object => match value {
            JsonValue::Object(map) => Ok(JsonValue::Object(map)),
            JsonValue::String(s) => match serde_json::from_str::<JsonValue>(&s) {
                Ok(JsonValue::Object(map)) => Ok(JsonValue::Object(map)),
                _ => Err(fail(format!("'{s}' is not a JSON object"))),
            },
            other => Err(fail(format!("expected an object, got {other}"))),
        },
    }
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Applies declared constraints after coercion.
pub fn validate_value(
    name: &str,
    spec: &VariableSpec,
    value: &JsonValue,
) -> Result<(), ResolutionError> {
    let invalid = |reason: String| ResolutionError::InvalidValue {
        name: name.to_string(),
        reason,
    };

    if let Some(pattern) = &spec.pattern {
        if let JsonValue::String(s) = value {
            let re = Regex::new(pattern)
                .map_err(|e| invalid(format!("pattern does not compile: {e}")))?;
            if !re.is_match(s) {
                return Err(invalid(format!("'{s}' does not match pattern '{pattern}'")));
            }
        }
    }

    if let JsonValue::String(s) = value {
        if let Some(min) = spec.min_length {
            if s.chars().count() < min {
                return Err(invalid(format!("shorter than minLength {min}")));
            }
        }
        if let Some(max) = spec.max_length {
            if s.chars().count() > max {
                return Err(invalid(format!("longer than maxLength {max}")));
            }
        }
    }

    if let JsonValue::Number(n) = value {
        let f = n.as_f64().unwrap_or(f64::NAN);
        if let Some(min) = spec.min {
            if f < min {
                return Err(invalid(format!("{f} is below min {min}")));
            }
        }
        if let Some(max) = spec.max {
            if f > max {
                return Err(invalid(format!("{f} is above max {max}")));
            }
        }
    }

    Ok(())
}
