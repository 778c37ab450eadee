//! Structural validation against a JSON-Schema subset.
//!
//! Supported keywords: `type` (single or list), `properties`, `required`,
//! `additionalProperties`, `items`, `enum`, `const`, `minimum`, `maximum`,
//! `exclusiveMinimum`, `exclusiveMaximum`, `minLength`, `maxLength`,
//! `minItems`, `maxItems`, `pattern`, `anyOf`, `allOf`, and local `$ref`
//! (`#/definitions/..`, `#/$defs/..`). Other keywords are ignored.
//!
//! Object nodes that declare `properties` reject undeclared keys unless
//! `additionalProperties` allows them or the contract is permissive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::SchemaContract;

/// Nesting limit for local `$ref` chains.
const MAX_DEPTH: usize = 64;

/// One structural failure at a location in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// JSONPath-like location, e.g. `$.outputs[2].name`.
    pub path: String,
    /// Keyword that failed, e.g. `required`.
    pub constraint: String,
    /// What was expected at `path`.
    pub expected: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.expected, self.constraint)
    }
}

/// Result of checking one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Vec<Violation>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Valid => &[],
            Self::Invalid(v) => v,
        }
    }
}

/// Check `document` against `contract`. Pure; reports all violations found.
pub fn validate(document: &Value, contract: &SchemaContract) -> ValidationOutcome {
    let mut walker = Walker {
        contract,
        root: &contract.document,
        permissive: contract.options.permissive,
        violations: Vec::new(),
    };
    walker.check(&contract.document, document, "$", 0);

    if walker.violations.is_empty() {
        ValidationOutcome::Valid
    } else {
        ValidationOutcome::Invalid(walker.violations)
    }
}

struct Walker<'a> {
    contract: &'a SchemaContract,
    root: &'a Value,
    permissive: bool,
    violations: Vec<Violation>,
}

impl<'a> Walker<'a> {
    fn fail(&mut self, path: &str, constraint: &str, expected: impl Into<String>) {
        self.violations.push(Violation {
            path: path.to_string(),
            constraint: constraint.to_string(),
            expected: expected.into(),
        });
    }

    /// Run a nested check in isolation; returns whether it passed.
    fn passes(&self, schema: &'a Value, value: &Value, path: &str, depth: usize) -> bool {
        let mut probe = Walker {
            contract: self.contract,
            root: self.root,
            permissive: self.permissive,
            violations: Vec::new(),
        };
        probe.check(schema, value, path, depth);
        probe.violations.is_empty()
    }

    fn check(&mut self, schema: &'a Value, value: &Value, path: &str, depth: usize) {
        if depth > MAX_DEPTH {
            self.fail(path, "$ref", "schema nesting within limits");
            return;
        }

        let schema = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                self.fail(path, "false", "no value allowed here");
                return;
            }
            Value::Object(map) => map,
            _ => return,
        };

        if let Some(Value::String(reference)) = schema.get("$ref") {
            match resolve_local(self.root, reference) {
                Some(target) => self.check(target, value, path, depth + 1),
                None => self.fail(path, "$ref", format!("resolvable reference '{reference}'")),
            }
            return;
        }

        if let Some(expected) = schema.get("type") {
            if !type_matches(expected, value) {
                self.fail(
                    path,
                    "type",
                    format!("type {}, found {}", describe_type(expected), type_name(value)),
                );
                return;
            }
        }

        if let Some(Value::Array(options)) = schema.get("enum") {
            if !options.contains(value) {
                self.fail(path, "enum", format!("one of {}", Value::Array(options.clone())));
            }
        }

        if let Some(constant) = schema.get("const") {
            if constant != value {
                self.fail(path, "const", format!("constant {constant}"));
            }
        }

        if let Some(Value::Array(branches)) = schema.get("anyOf") {
            let matched = branches
                .iter()
                .any(|branch| self.passes(branch, value, path, depth + 1));
            if !matched {
                self.fail(path, "anyOf", format!("a match for one of {} alternatives", branches.len()));
            }
        }

        if let Some(Value::Array(parts)) = schema.get("allOf") {
            for part in parts {
                self.check(part, value, path, depth + 1);
            }
        }

        match value {
            Value::Object(object) => self.check_object(schema, object, path, depth),
            Value::Array(items) => self.check_array(schema, items, path, depth),
            Value::String(s) => self.check_string(schema, s, path),
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    self.check_number(schema, n, path);
                }
            }
            _ => {}
        }
    }

    fn check_object(
        &mut self,
        schema: &'a serde_json::Map<String, Value>,
        object: &serde_json::Map<String, Value>,
        path: &str,
        depth: usize,
    ) {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    self.fail(&child_path(path, key), "required", "required property to be present");
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let additional = schema.get("additionalProperties");

        for (key, item) in object {
            let at = child_path(path, key);
            if let Some(sub) = properties.and_then(|p| p.get(key)) {
                self.check(sub, item, &at, depth + 1);
                continue;
            }
            match additional {
                Some(Value::Bool(true)) => {}
                Some(Value::Bool(false)) => {
                    self.fail(&at, "additionalProperties", "no undeclared property")
                }
                Some(sub @ Value::Object(_)) => self.check(sub, item, &at, depth + 1),
                _ => {
                    if properties.is_some() && !self.permissive {
                        self.fail(&at, "additionalProperties", "no undeclared property");
                    }
                }
            }
        }
    }

    fn check_array(
        &mut self,
        schema: &'a serde_json::Map<String, Value>,
        items: &[Value],
        path: &str,
        depth: usize,
    ) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                self.fail(path, "minItems", format!("at least {min} items, found {}", items.len()));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if items.len() as u64 > max {
                self.fail(path, "maxItems", format!("at most {max} items, found {}", items.len()));
            }
        }

        match schema.get("items") {
            Some(Value::Array(tuple)) => {
                for (i, (sub, item)) in tuple.iter().zip(items).enumerate() {
                    self.check(sub, item, &format!("{path}[{i}]"), depth + 1);
                }
            }
            Some(sub) => {
                for (i, item) in items.iter().enumerate() {
                    self.check(sub, item, &format!("{path}[{i}]"), depth + 1);
                }
            }
            None => {}
        }
    }

    fn check_string(&mut self, schema: &serde_json::Map<String, Value>, s: &str, path: &str) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                self.fail(path, "minLength", format!("at least {min} characters"));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                self.fail(path, "maxLength", format!("at most {max} characters"));
            }
        }
        if let Some(Value::String(pattern)) = schema.get("pattern") {
            // Compiled when the contract was built.
            if let Some(re) = self.contract.pattern(pattern) {
                if !re.is_match(s) {
                    self.fail(path, "pattern", format!("string matching /{pattern}/"));
                }
            }
        }
    }

    fn check_number(&mut self, schema: &serde_json::Map<String, Value>, n: f64, path: &str) {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                self.fail(path, "minimum", format!("number >= {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                self.fail(path, "maximum", format!("number <= {max}"));
            }
        }
        if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
            if n <= min {
                self.fail(path, "exclusiveMinimum", format!("number > {min}"));
            }
        }
        if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
            if n >= max {
                self.fail(path, "exclusiveMaximum", format!("number < {max}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_local<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, value)),
        _ => true,
    }
}

fn is_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("|"),
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

/// `$.key` for identifier-like keys, `$['odd key']` otherwise.
fn child_path(parent: &str, key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        format!("{parent}.{key}")
    } else {
        format!("{parent}['{}']", key.replace('\'', "\\'"))
    }
}
