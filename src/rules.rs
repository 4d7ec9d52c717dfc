//! Selection rules.
//!
//! Rules live in their own YAML file next to the contract and map request
//! characteristics to one of the examples the contract declares. They are
//! validated against the loaded contract and compiled once at startup.

use crate::contract::{ContractIndex, OperationDescriptor};
use crate::error::RuleError;
use crate::request::ProxyRequest;
use axum::http::{HeaderName, Method};
use jsonpath_rust::JsonPath;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Top-level layout of a rule file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    /// Ordered selection rules
    #[serde(default)]
    pub rules: Vec<SelectionRule>,

    /// Fallback example per operation
    #[serde(default)]
    pub defaults: Vec<DefaultExample>,
}

impl RuleFile {
    /// Parse a rule file from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self, RuleError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// A single selection rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionRule {
    /// Optional identifier, used in logs and diagnostics
    #[serde(default)]
    pub id: Option<String>,

    /// HTTP method of the target operation
    pub method: String,

    /// Path template of the target operation
    pub path: String,

    /// Request predicates (all must hold)
    #[serde(default)]
    pub match_on: MatchOn,

    /// Priority (higher = evaluated first)
    #[serde(default)]
    pub priority: i32,

    /// Name of the example to select
    pub example: String,

    /// Status the example is declared under, when the name alone is ambiguous
    #[serde(default)]
    pub status: Option<StatusRef>,
}

/// Fallback example for an operation when no rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultExample {
    pub method: String,
    pub path: String,
    pub example: String,
    #[serde(default)]
    pub status: Option<StatusRef>,
}

/// A status written either as a number (`200`) or a key (`"4XX"`, `"default"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusRef {
    Code(u16),
    Key(String),
}

impl StatusRef {
    fn as_key(&self) -> String {
        match self {
            StatusRef::Code(code) => code.to_string(),
            StatusRef::Key(key) => key.clone(),
        }
    }
}

/// Request predicates of a rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MatchOn {
    /// Query parameter matching
    #[serde(default)]
    pub query: BTreeMap<String, ValueMatcher>,

    /// Header matching (names are case-insensitive)
    #[serde(default)]
    pub headers: BTreeMap<String, ValueMatcher>,

    /// JSON body fields: JSONPath expression to expected value
    #[serde(default)]
    pub body_fields: BTreeMap<String, serde_json::Value>,
}

/// A query or header value matcher; a bare string means exact match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueMatcher {
    Equals(String),
    Typed(ValueMatch),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueMatch {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Must be present (any value)
    Present,
    /// Must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

enum CompiledValueMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

impl CompiledValueMatcher {
    fn compile(matcher: &ValueMatcher) -> Result<Self, String> {
        Ok(match matcher {
            ValueMatcher::Equals(value) => Self::Exact(value.clone()),
            ValueMatcher::Typed(ValueMatch::Exact { value }) => Self::Exact(value.clone()),
            ValueMatcher::Typed(ValueMatch::Regex { pattern }) => {
                Self::Regex(Regex::new(pattern).map_err(|e| format!("invalid regex: {}", e))?)
            }
            ValueMatcher::Typed(ValueMatch::Present) => Self::Present,
            ValueMatcher::Typed(ValueMatch::Absent) => Self::Absent,
            ValueMatcher::Typed(ValueMatch::Contains { value }) => Self::Contains(value.clone()),
        })
    }

    /// Multi-valued inputs match when any value matches.
    fn matches<'v>(&self, mut values: impl Iterator<Item = &'v str>) -> bool {
        match self {
            Self::Exact(expected) => values.any(|v| v == expected.as_str()),
            Self::Regex(regex) => values.any(|v| regex.is_match(v)),
            Self::Present => values.next().is_some(),
            Self::Absent => values.next().is_none(),
            Self::Contains(needle) => values.any(|v| v.contains(needle.as_str())),
        }
    }
}

struct BodyFieldMatcher {
    expression: String,
    path: JsonPath,
    expected: serde_json::Value,
}

impl BodyFieldMatcher {
    fn compile(expression: &str, expected: &serde_json::Value) -> Result<Self, String> {
        let normalized = if expression.starts_with('$') {
            expression.to_string()
        } else {
            format!("$.{}", expression)
        };
        let path = JsonPath::try_from(normalized.as_str())
            .map_err(|e| format!("invalid body field '{}': {}", expression, e))?;
        Ok(Self {
            expression: normalized,
            path,
            expected: expected.clone(),
        })
    }

    /// `null` expects only that the path resolves to something.
    fn matches(&self, body: &serde_json::Value) -> bool {
        let found = match self.path.find(body) {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        };
        if self.expected.is_null() {
            found.iter().any(|v| !v.is_null())
        } else {
            found.contains(&self.expected)
        }
    }
}

/// A validated rule, bound to one operation and one example.
pub struct CompiledRule {
    label: String,
    priority: i32,
    query: Vec<(String, CompiledValueMatcher)>,
    headers: Vec<(String, CompiledValueMatcher)>,
    body_fields: Vec<BodyFieldMatcher>,
    example: usize,
}

impl CompiledRule {
    /// Rule id, or `rule#<n>` by declaration position.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Position of the target example within its operation.
    pub fn example(&self) -> usize {
        self.example
    }

    pub fn has_body_fields(&self) -> bool {
        !self.body_fields.is_empty()
    }

    /// Evaluate every predicate against a live request.
    pub fn matches(
        &self,
        request: &ProxyRequest,
        query_pairs: &[(String, String)],
        body: Option<&serde_json::Value>,
    ) -> bool {
        for (name, matcher) in &self.query {
            let values = query_pairs
                .iter()
                .filter(|(k, _)| k == name)
                .map(|(_, v)| v.as_str());
            if !matcher.matches(values) {
                return false;
            }
        }

        for (name, matcher) in &self.headers {
            if !matcher.matches(request.header_values(name)) {
                return false;
            }
        }

        if !self.body_fields.is_empty() {
            let Some(body) = body else {
                return false;
            };
            if !self.body_fields.iter().all(|f| f.matches(body)) {
                return false;
            }
        }

        true
    }
}

/// All rules and defaults, bucketed per operation.
#[derive(Default)]
pub struct RuleSet {
    by_operation: HashMap<usize, Vec<CompiledRule>>,
    defaults: HashMap<usize, usize>,
    rule_count: usize,
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("rules", &self.rule_count)
            .field("defaults", &self.defaults.len())
            .finish()
    }
}

impl RuleSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a rule file and validate it against the contract.
    pub fn from_file(path: &Path, index: &ContractIndex) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::compile(RuleFile::from_yaml_str(&content)?, index)
    }

    /// Validate and compile. Any invalid entry fails the whole set.
    pub fn compile(file: RuleFile, index: &ContractIndex) -> Result<Self, RuleError> {
        let mut set = RuleSet::default();

        for (position, rule) in file.rules.iter().enumerate() {
            let label = rule
                .id
                .clone()
                .unwrap_or_else(|| format!("rule#{}", position));
            let entry = format!("rule {} ({})", position, label);
            let invalid = |reason: String| RuleError::Invalid {
                entry: entry.clone(),
                reason,
            };

            let operation = target_operation(index, &rule.method, &rule.path).map_err(invalid)?;
            let example = target_example(operation, &rule.example, rule.status.as_ref())
                .map_err(invalid)?;

            let mut query = Vec::new();
            for (name, matcher) in &rule.match_on.query {
                let compiled = CompiledValueMatcher::compile(matcher)
                    .map_err(|e| invalid(format!("query '{}': {}", name, e)))?;
                query.push((name.clone(), compiled));
            }

            let mut headers = Vec::new();
            for (name, matcher) in &rule.match_on.headers {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| invalid(format!("invalid header name '{}'", name)))?;
                let compiled = CompiledValueMatcher::compile(matcher)
                    .map_err(|e| invalid(format!("header '{}': {}", name, e)))?;
                headers.push((name.to_ascii_lowercase(), compiled));
            }

            let mut body_fields = Vec::new();
            for (expression, expected) in &rule.match_on.body_fields {
                body_fields.push(BodyFieldMatcher::compile(expression, expected).map_err(&invalid)?);
            }

            set.by_operation
                .entry(operation.slot())
                .or_default()
                .push(CompiledRule {
                    label,
                    priority: rule.priority,
                    query,
                    headers,
                    body_fields,
                    example,
                });
            set.rule_count += 1;
        }

        for (position, default) in file.defaults.iter().enumerate() {
            let invalid = |reason: String| RuleError::Invalid {
                entry: format!("default {}", position),
                reason,
            };
            let operation =
                target_operation(index, &default.method, &default.path).map_err(invalid)?;
            let example = target_example(operation, &default.example, default.status.as_ref())
                .map_err(invalid)?;
            if set.defaults.insert(operation.slot(), example).is_some() {
                return Err(invalid(format!(
                    "{} already has a default example",
                    operation
                )));
            }
        }

        // Stable sort keeps declaration order among equal priorities.
        for rules in set.by_operation.values_mut() {
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        info!(
            rules = set.rule_count,
            defaults = set.defaults.len(),
            "Selection rules loaded"
        );
        Ok(set)
    }

    /// Rules targeting an operation, in evaluation order.
    pub fn rules_for(&self, operation: usize) -> &[CompiledRule] {
        self.by_operation
            .get(&operation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Position of the default example for an operation.
    pub fn default_for(&self, operation: usize) -> Option<usize> {
        self.defaults.get(&operation).copied()
    }

    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }

    pub fn defaults_len(&self) -> usize {
        self.defaults.len()
    }
}

fn target_operation<'a>(
    index: &'a ContractIndex,
    method: &str,
    path: &str,
) -> Result<&'a OperationDescriptor, String> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid method '{}'", method))?;
    index
        .find_operation(&method, path)
        .ok_or_else(|| format!("contract declares no operation {} {}", method, path))
}

fn target_example(
    operation: &OperationDescriptor,
    name: &str,
    status: Option<&StatusRef>,
) -> Result<usize, String> {
    let status_key = status.map(StatusRef::as_key);
    let found = operation.find_examples(name, status_key.as_deref());
    match found.as_slice() {
        [position] => Ok(*position),
        [] => Err(match status_key {
            Some(status) => format!(
                "example '{}' is not declared by {} under status {}",
                name, operation, status
            ),
            None => format!("example '{}' is not declared by {}", name, operation),
        }),
        _ => Err(format!(
            "example '{}' is declared under several statuses of {}; set `status`",
            name, operation
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: &str = r#"
openapi: 3.0.0
paths:
  /api/books:
    get:
      operationId: listBooks
      responses:
        "200":
          content:
            application/json:
              examples:
                inStockExample:
                  value: { status: IN STOCK }
                soldOutExample:
                  value: { status: SOLD OUT }
        "404":
          content:
            application/json:
              examples:
                inStockExample:
                  value: { error: gone }
  /api/items:
    post:
      operationId: createItem
      responses:
        "201":
          content:
            application/json:
              examples:
                created:
                  value: { id: 1 }
"#;

    fn index() -> ContractIndex {
        ContractIndex::from_yaml_str(CONTRACT).unwrap()
    }

    fn compile(yaml: &str) -> Result<RuleSet, RuleError> {
        RuleSet::compile(RuleFile::from_yaml_str(yaml)?, &index())
    }

    #[test]
    fn test_parse_rule_file() {
        let yaml = r#"
rules:
  - id: in-stock
    method: GET
    path: /api/books
    match_on:
      headers:
        prefer: "example=inStockExample"
      query:
        page: { type: regex, pattern: "^[0-9]+$" }
        debug: { type: absent }
      body_fields:
        "$.status": "IN STOCK"
    priority: 10
    example: inStockExample
    status: 200
defaults:
  - method: get
    path: /api/books
    example: soldOutExample
"#;
        let file = RuleFile::from_yaml_str(yaml).unwrap();
        assert_eq!(file.rules.len(), 1);
        assert!(matches!(
            file.rules[0].match_on.headers["prefer"],
            ValueMatcher::Equals(_)
        ));
        assert!(matches!(
            file.rules[0].match_on.query["page"],
            ValueMatcher::Typed(ValueMatch::Regex { .. })
        ));

        let index = index();
        let set = RuleSet::compile(file, &index).unwrap();
        let list_books = index.find_operation(&Method::GET, "/api/books").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rules_for(list_books.slot()).len(), 1);
        assert_eq!(set.default_for(list_books.slot()), Some(1));
    }

    #[test]
    fn test_debug_reports_counts() {
        let set = compile("rules:\n  - { method: GET, path: /api/books, example: soldOutExample, status: 200 }\n")
            .unwrap();
        assert_eq!(format!("{:?}", set), "RuleSet { rules: 1, defaults: 0 }");
    }

    #[test]
    fn test_rules_are_ordered_by_priority_then_declaration() {
        let yaml = r#"
rules:
  - { id: a, method: GET, path: /api/books, example: soldOutExample, status: 200, priority: 1 }
  - { id: b, method: GET, path: /api/books, example: soldOutExample, status: 200, priority: 5 }
  - { id: c, method: GET, path: /api/books, example: soldOutExample, status: 200, priority: 1 }
  - { id: d, method: GET, path: /api/books, example: soldOutExample, status: 200, priority: 5 }
"#;
        let set = compile(yaml).unwrap();
        let labels: Vec<_> = set.rules_for(0).iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let yaml = "rules:\n  - { method: DELETE, path: /api/items, example: created }\n";
        let err = compile(yaml).unwrap_err();
        assert!(err.to_string().contains("no operation"), "{}", err);
    }

    #[test]
    fn test_cross_operation_example_is_rejected() {
        let yaml = "rules:\n  - { method: GET, path: /api/books, example: created }\n";
        let err = compile(yaml).unwrap_err();
        assert!(err.to_string().contains("not declared by GET /api/books"), "{}", err);
    }

    #[test]
    fn test_ambiguous_example_requires_status() {
        let yaml = "rules:\n  - { method: GET, path: /api/books, example: inStockExample }\n";
        let err = compile(yaml).unwrap_err();
        assert!(err.to_string().contains("set `status`"), "{}", err);

        let yaml = "rules:\n  - { method: GET, path: /api/books, example: inStockExample, status: 404 }\n";
        assert!(compile(yaml).is_ok());
    }

    #[test]
    fn test_malformed_entries_fail_the_whole_load() {
        let cases = [
            // bad regex
            "rules:\n  - method: GET\n    path: /api/books\n    example: soldOutExample\n    status: 200\n    match_on:\n      query:\n        q: { type: regex, pattern: \"([\" }\n",
            // bad JSONPath
            "rules:\n  - method: GET\n    path: /api/books\n    example: soldOutExample\n    status: 200\n    match_on:\n      body_fields:\n        \"$[\": 1\n",
            // unknown field
            "rules:\n  - { method: GET, path: /api/books, example: soldOutExample, colour: red }\n",
            // bad header name
            "rules:\n  - method: GET\n    path: /api/books\n    example: soldOutExample\n    status: 200\n    match_on:\n      headers:\n        \"bad header\": x\n",
            // duplicate default
            "defaults:\n  - { method: POST, path: /api/items, example: created }\n  - { method: POST, path: /api/items, example: created }\n",
        ];
        for yaml in cases {
            assert!(compile(yaml).is_err(), "accepted: {}", yaml);
        }
    }

    #[test]
    fn test_body_field_shorthand_is_normalized() {
        let matcher = BodyFieldMatcher::compile("order.status", &serde_json::json!("OPEN")).unwrap();
        assert_eq!(matcher.expression, "$.order.status");
        assert!(matcher.matches(&serde_json::json!({"order": {"status": "OPEN"}})));
        assert!(!matcher.matches(&serde_json::json!({"order": {"status": "CLOSED"}})));
    }

    #[test]
    fn test_body_field_null_means_present() {
        let matcher = BodyFieldMatcher::compile("$.coupon", &serde_json::Value::Null).unwrap();
        assert!(matcher.matches(&serde_json::json!({"coupon": "SAVE10"})));
        assert!(!matcher.matches(&serde_json::json!({"other": 1})));
    }

    #[test]
    fn test_value_matchers() {
        let exact = CompiledValueMatcher::Exact("a".to_string());
        assert!(exact.matches(["b", "a"].into_iter()));
        assert!(!exact.matches(std::iter::empty()));

        let present = CompiledValueMatcher::Present;
        assert!(present.matches(["x"].into_iter()));
        assert!(!present.matches(std::iter::empty()));

        let absent = CompiledValueMatcher::Absent;
        assert!(absent.matches(std::iter::empty()));

        let contains = CompiledValueMatcher::Contains("example=".to_string());
        assert!(contains.matches(["return=minimal, example=foo"].into_iter()));
    }
}
