use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Declared type of a recipe variable. Coercion in `crate::variables` is the
/// sole place raw input is converted into one of these shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
    Enum,
    Array,
    Object,
    File,
    Directory,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Number => "number",
            VariableType::Boolean => "boolean",
            VariableType::Enum => "enum",
            VariableType::Array => "array",
            VariableType::Object => "object",
            VariableType::File => "file",
            VariableType::Directory => "directory",
        }
    }
}

/// Specification of a single recipe variable as declared in `recipe.yml`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VariableSpec {
    #[serde(rename = "type", default)]
    pub var_type: VariableType,

    #[serde(default)]
    pub required: bool,

    pub default: Option<JsonValue>,

    pub description: Option<String>,

    /// Text shown when the variable is resolved interactively.
    pub prompt: Option<String>,

    /// 0-based positional CLI binding index. Positions across all positional
    /// variables of a recipe must form a contiguous sequence.
    pub position: Option<usize>,

    /// Regex constraint, string-typed variables only.
    pub pattern: Option<String>,

    /// Numeric bounds, number-typed variables only.
    pub min: Option<f64>,
    pub max: Option<f64>,

    /// Length bounds, string-typed variables only.
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,

    /// Allowed values, enum-typed variables only.
    #[serde(default)]
    pub values: Vec<String>,

    /// Whether an enum accepts multiple selections.
    #[serde(default)]
    pub multiple: bool,

    /// Hint forwarded to the AI provider; never applied by default resolution.
    pub suggestion: Option<JsonValue>,
}

impl VariableSpec {
    /// The effective hint shown to prompters and the AI provider: an explicit
    /// suggestion wins, otherwise the declared default doubles as one.
    pub fn hint(&self) -> Option<&JsonValue> {
        self.suggestion.as_ref().or(self.default.as_ref())
    }
}
