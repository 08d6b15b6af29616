//! The `when` expression sublanguage: string/number/boolean/null literals,
//! bare variable identifiers, `stepResults.<name>.<field>` paths, `==`,
//! `!=`, `&&`, `||`, `!` and parentheses.
//!
//! The evaluator is pure and never fails on unknown identifiers — they
//! evaluate to undefined, which is falsey. This is what lets steps gate on
//! optional variables. Malformed expressions do fail, and the executor turns
//! that into a step failure rather than a skip.

use serde_json::Value as JsonValue;

use crate::result::StepResults;
use crate::variables::VariableEnvironment;

/// Lookup scope for expression evaluation and string interpolation:
/// the variable environment plus results of previously completed steps.
pub struct Scope<'a> {
    pub env: &'a VariableEnvironment,
    pub steps: &'a StepResults,
}

impl<'a> Scope<'a> {
    pub fn new(env: &'a VariableEnvironment, steps: &'a StepResults) -> Self {
        Self { env, steps }
    }

    /// Resolves a dotted path to a value; `None` means undefined.
    pub fn lookup(&self, path: &str) -> Option<JsonValue> {
        let mut segments = path.split('.');
        let head = segments.next()?;

        let root: JsonValue = if head == "stepResults" {
            let step_name = segments.next()?;
            let result = self.steps.get(step_name)?;
            serde_json::to_value(result).ok()?
        } else if head == "__collectMode" {
            JsonValue::Bool(self.env.collect_mode())
        } else {
            self.env.get(head)?.clone()
        };

        let mut current = root;
        for segment in segments {
            current = match current {
                JsonValue::Object(mut map) => map.remove(segment)?,
                JsonValue::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.into_iter().nth(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Error for a malformed expression. A step whose `when` produces this is
/// failed, not skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionError {
    pub expression: String,
    pub message: String,
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "condition '{}' failed to evaluate: {}",
            self.expression, self.message
        )
    }
}

impl std::error::Error for ConditionError {}

/// Evaluates an expression against the scope and collapses the result to a
/// boolean using the truthiness rules.
pub fn evaluate(expr: &str, scope: &Scope<'_>) -> Result<bool, ConditionError> {
    let tokens = lex(expr).map_err(|message| ConditionError {
        expression: expr.to_string(),
        message,
    })?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };
    let value = parser.expression().map_err(|message| ConditionError {
        expression: expr.to_string(),
        message,
    })?;
    if parser.pos != tokens.len() {
        return Err(ConditionError {
            expression: expr.to_string(),
            message: format!("unexpected trailing token {:?}", tokens[parser.pos]),
        });
    }
    Ok(truthy(&value))
}

/// undefined/null/false/""/0/empty-array/empty-object are false; everything
/// else is true.
pub fn truthy(value: &Option<JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Array(items)) => !items.is_empty(),
        Some(JsonValue::Object(map)) => !map.is_empty(),
    }
}

/// Replaces `{{ path }}` placeholders in `text` with scope values. Strings
/// substitute raw, other values as JSON; undefined substitutes empty.
pub fn interpolate(text: &str, scope: &Scope<'_>) -> String {
    static PLACEHOLDER: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        regex::Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)\s*\}\}").unwrap()
    });

    re.replace_all(text, |caps: &regex::Captures<'_>| {
        match scope.lookup(&caps[1]) {
            Some(JsonValue::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        }
    })
    .into_owned()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err("single '=' is not an operator, use '=='".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("single '&' is not an operator, use '&&'".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("single '|' is not an operator, use '||'".to_string());
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser<'a, 'b> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Scope<'b>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // expression := and ("||" and)*
    fn expression(&mut self) -> Result<Option<JsonValue>, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and()?;
            let result = truthy(&left) || truthy(&right);
            left = Some(JsonValue::Bool(result));
        }
        Ok(left)
    }

    // and := equality ("&&" equality)*
    fn and(&mut self) -> Result<Option<JsonValue>, String> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.equality()?;
            let result = truthy(&left) && truthy(&right);
            left = Some(JsonValue::Bool(result));
        }
        Ok(left)
    }

    // equality := unary (("==" | "!=") unary)*
    fn equality(&mut self) -> Result<Option<JsonValue>, String> {
        let mut left = self.unary()?;
        loop {
            let negate = match self.peek() {
                Some(Token::Eq) => false,
                Some(Token::Ne) => true,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            let equal = loose_eq(&left, &right);
            left = Some(JsonValue::Bool(equal != negate));
        }
        Ok(left)
    }

    // unary := "!" unary | primary
    fn unary(&mut self) -> Result<Option<JsonValue>, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let value = self.unary()?;
            return Ok(Some(JsonValue::Bool(!truthy(&value))));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Option<JsonValue>, String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Some(JsonValue::String(s))),
            Some(Token::Num(n)) => Ok(Some(serde_json::json!(n))),
            Some(Token::True) => Ok(Some(JsonValue::Bool(true))),
            Some(Token::False) => Ok(Some(JsonValue::Bool(false))),
            Some(Token::Null) => Ok(Some(JsonValue::Null)),
            Some(Token::Ident(path)) => Ok(self.scope.lookup(&path)),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// Loose equality: undefined and null are equal to each other, numbers
/// compare numerically, and mismatched types are unequal.
fn loose_eq(left: &Option<JsonValue>, right: &Option<JsonValue>) -> bool {
    let l = left.as_ref().unwrap_or(&JsonValue::Null);
    let r = right.as_ref().unwrap_or(&JsonValue::Null);
    match (l, r) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            a.as_f64().zip(b.as_f64()).map(|(x, y)| x == y).unwrap_or(false)
        }
        (a, b) => a == b,
    }
}
