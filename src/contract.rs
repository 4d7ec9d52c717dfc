//! Contract index.
//!
//! Loads an OpenAPI 3 document once at startup and builds an immutable index
//! from (method, path template) to the operation and its declared examples.

use crate::error::ContractError;
use crate::path_template::{split_path, PathTemplate, Segment, SegmentPattern};
use axum::http::Method;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Methods an OpenAPI path item may declare.
const HTTP_METHODS: [(&str, Method); 8] = [
    ("get", Method::GET),
    ("put", Method::PUT),
    ("post", Method::POST),
    ("delete", Method::DELETE),
    ("options", Method::OPTIONS),
    ("head", Method::HEAD),
    ("patch", Method::PATCH),
    ("trace", Method::TRACE),
];

/// The subset of an OpenAPI 3 document the proxy reads.
///
/// Unknown keys are ignored; the document is never modified.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractDocument {
    #[serde(default)]
    pub openapi: Option<String>,

    #[serde(default)]
    pub info: ContractInfo,

    #[serde(default)]
    pub paths: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawParameter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "in")]
    location: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default, rename = "$ref")]
    reference: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawOperation {
    #[serde(default, rename = "operationId")]
    operation_id: Option<String>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
    #[serde(default, rename = "requestBody")]
    request_body: Option<RawRequestBody>,
    #[serde(default)]
    responses: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRequestBody {
    #[serde(default)]
    content: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawResponse {
    #[serde(default)]
    content: BTreeMap<String, RawMediaType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawMediaType {
    #[serde(default)]
    example: Option<serde_json::Value>,
    #[serde(default)]
    examples: BTreeMap<String, RawExample>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawExample {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// Where a parameter is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
}

impl ParameterLocation {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
        }
    }
}

/// A parameter declared by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub location: ParameterLocation,
    pub required: bool,
}

/// Identifies an example within a loaded index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExampleKey {
    pub operation: usize,
    pub example: usize,
}

/// A named example declared under one operation and one status code.
#[derive(Debug, Clone)]
pub struct ExampleDescriptor {
    key: ExampleKey,
    /// Example name (`default` for a bare `example:`)
    pub name: String,
    /// Id of the owning operation
    pub operation_id: String,
    /// Owning status key (`200`, `4XX`, `default`)
    pub status: String,
    /// Media types the example is declared for
    pub media_types: Vec<String>,
    pub summary: Option<String>,
    /// Literal payload; `Null` when the example has no inline value
    pub value: serde_json::Value,
}

impl ExampleDescriptor {
    pub fn key(&self) -> ExampleKey {
        self.key
    }
}

/// An operation declared by the contract.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    slot: usize,
    pub id: String,
    pub method: Method,
    pub template: PathTemplate,
    pub parameters: Vec<ParameterDescriptor>,
    /// Declares a JSON request body
    pub json_body: bool,
    examples: Vec<ExampleDescriptor>,
}

impl OperationDescriptor {
    /// Position of this operation in its index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn examples(&self) -> &[ExampleDescriptor] {
        &self.examples
    }

    pub fn example(&self, position: usize) -> Option<&ExampleDescriptor> {
        self.examples.get(position)
    }

    /// Declared examples grouped by status key.
    pub fn examples_by_status(&self) -> BTreeMap<&str, Vec<&ExampleDescriptor>> {
        let mut grouped: BTreeMap<&str, Vec<&ExampleDescriptor>> = BTreeMap::new();
        for example in &self.examples {
            grouped.entry(example.status.as_str()).or_default().push(example);
        }
        grouped
    }

    /// Positions of examples with this name, optionally restricted to a status.
    pub fn find_examples(&self, name: &str, status: Option<&str>) -> Vec<usize> {
        self.examples
            .iter()
            .enumerate()
            .filter(|(_, e)| e.name == name)
            .filter(|(_, e)| status.map_or(true, |s| e.status.eq_ignore_ascii_case(s)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.parameters.iter().filter(|p| p.required)
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template.as_str())
    }
}

/// Result of resolving a concrete request path.
#[derive(Debug)]
pub struct ResolvedOperation<'a> {
    pub operation: &'a OperationDescriptor,
    pub path_params: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct RouteNode {
    literals: HashMap<String, RouteNode>,
    patterns: Vec<(SegmentPattern, RouteNode)>,
    param: Option<Box<RouteNode>>,
    operation: Option<usize>,
}

impl RouteNode {
    /// Insert a template; returns the slot already occupying its shape, if any.
    fn insert(&mut self, segments: &[Segment], slot: usize) -> Result<(), usize> {
        let Some((first, rest)) = segments.split_first() else {
            return match self.operation {
                Some(existing) => Err(existing),
                None => {
                    self.operation = Some(slot);
                    Ok(())
                }
            };
        };

        match first {
            Segment::Literal(lit) => self.literals.entry(lit.clone()).or_default().insert(rest, slot),
            Segment::Param(_) => self
                .param
                .get_or_insert_with(Box::default)
                .insert(rest, slot),
            Segment::Pattern(pattern) => {
                let position = self
                    .patterns
                    .iter()
                    .position(|(p, _)| p.shape() == pattern.shape());
                let index = match position {
                    Some(index) => index,
                    None => {
                        self.patterns.push((pattern.clone(), RouteNode::default()));
                        self.patterns.len() - 1
                    }
                };
                self.patterns[index].1.insert(rest, slot)
            }
        }
    }

    /// Literal children first, then mixed patterns, then the parameter child.
    fn lookup(&self, segments: &[&str]) -> Option<usize> {
        let Some((first, rest)) = segments.split_first() else {
            return self.operation;
        };

        if let Some(found) = self.literals.get(*first).and_then(|n| n.lookup(rest)) {
            return Some(found);
        }
        for (pattern, node) in &self.patterns {
            if pattern.is_match(first) {
                if let Some(found) = node.lookup(rest) {
                    return Some(found);
                }
            }
        }
        if first.is_empty() {
            return None;
        }
        self.param.as_ref().and_then(|n| n.lookup(rest))
    }
}

/// Immutable, process-wide index of the contract's operations.
#[derive(Debug)]
pub struct ContractIndex {
    info: ContractInfo,
    operations: Vec<OperationDescriptor>,
    routes: HashMap<Method, RouteNode>,
}

impl ContractIndex {
    /// Load and validate a contract file (YAML or JSON).
    pub fn from_file(path: &Path) -> Result<Self, ContractError> {
        let content = std::fs::read_to_string(path).map_err(|source| ContractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Load and validate a contract from a YAML or JSON string.
    pub fn from_yaml_str(content: &str) -> Result<Self, ContractError> {
        let document: ContractDocument = serde_yaml::from_str(content)?;
        Self::load(document)
    }

    /// Validate a parsed document and build the index.
    pub fn load(document: ContractDocument) -> Result<Self, ContractError> {
        match document.openapi.as_deref() {
            Some(version) if version.starts_with("3.") => {}
            Some(version) => {
                return Err(ContractError::UnsupportedDocument(format!(
                    "openapi version '{}'",
                    version
                )))
            }
            None => {
                return Err(ContractError::UnsupportedDocument(
                    "missing `openapi` field".to_string(),
                ))
            }
        }

        let mut operations: Vec<OperationDescriptor> = Vec::new();
        let mut routes: HashMap<Method, RouteNode> = HashMap::new();

        for (key, item) in &document.paths {
            let raw_template = key.as_str().ok_or_else(|| ContractError::InvalidTemplate {
                template: format!("{:?}", key),
                reason: "path keys must be strings".to_string(),
            })?;
            let template = PathTemplate::parse(raw_template)?;
            let item = item.as_mapping().ok_or_else(|| ContractError::InvalidTemplate {
                template: raw_template.to_string(),
                reason: "path item must be a mapping".to_string(),
            })?;

            let shared_parameters: Vec<RawParameter> = match item.get("parameters") {
                Some(value) => serde_yaml::from_value(value.clone())?,
                None => Vec::new(),
            };

            for (method_name, method) in HTTP_METHODS {
                let Some(raw_operation) = item.get(method_name) else {
                    continue;
                };
                let raw_operation: RawOperation = serde_yaml::from_value(raw_operation.clone())?;

                let slot = operations.len();
                let operation = build_operation(
                    slot,
                    method.clone(),
                    template.clone(),
                    &shared_parameters,
                    raw_operation,
                )?;

                let node = routes.entry(method.clone()).or_default();
                if let Err(existing) = node.insert(operation.template.segments(), slot) {
                    return Err(ContractError::Ambiguous {
                        method: method.to_string(),
                        first: operations[existing].template.as_str().to_string(),
                        second: raw_template.to_string(),
                    });
                }

                debug!(
                    operation_id = %operation.id,
                    method = %method,
                    template = %raw_template,
                    examples = operation.examples.len(),
                    "Indexed operation"
                );
                operations.push(operation);
            }
        }

        if operations.is_empty() {
            warn!("Contract declares no operations; every request will be rejected");
        }

        Ok(Self {
            info: document.info,
            operations,
            routes,
        })
    }

    pub fn title(&self) -> Option<&str> {
        self.info.title.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.info.version.as_deref()
    }

    pub fn operations(&self) -> &[OperationDescriptor] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operation(&self, slot: usize) -> Option<&OperationDescriptor> {
        self.operations.get(slot)
    }

    /// Resolve a concrete request to the operation whose template matches.
    ///
    /// Templates that overlap without sharing a shape, such as `/a/{x}/b`
    /// and `/a/b/{y}`, both load. A path matching several of them goes to
    /// the one with the more literal prefix: at each segment a literal wins
    /// over a mixed pattern, which wins over a whole parameter, and the
    /// search backtracks only when the preferred branch fails further down.
    /// So `/a/b/b` resolves to `/a/b/{y}` and `/a/c/b` to `/a/{x}/b`.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<ResolvedOperation<'_>> {
        let normalized;
        let method = if method.as_str().bytes().any(|b| b.is_ascii_lowercase()) {
            normalized = Method::from_bytes(method.as_str().to_ascii_uppercase().as_bytes()).ok()?;
            &normalized
        } else {
            method
        };
        let segments = split_path(path)?;
        let slot = self.routes.get(method)?.lookup(&segments)?;
        let operation = &self.operations[slot];
        let path_params = operation.template.matches(path)?;
        Some(ResolvedOperation {
            operation,
            path_params,
        })
    }

    /// Find an operation by method and template (exact text or same shape).
    pub fn find_operation(&self, method: &Method, template: &str) -> Option<&OperationDescriptor> {
        let candidates = self.operations.iter().filter(|op| op.method == *method);
        let mut shape_match = None;
        let wanted_shape = PathTemplate::parse(template).ok().map(|t| t.shape());
        for op in candidates {
            if op.template.as_str() == template {
                return Some(op);
            }
            if wanted_shape.as_deref() == Some(op.template.shape().as_str()) {
                shape_match = Some(op);
            }
        }
        shape_match
    }
}

fn build_operation(
    slot: usize,
    method: Method,
    template: PathTemplate,
    shared_parameters: &[RawParameter],
    raw: RawOperation,
) -> Result<OperationDescriptor, ContractError> {
    let invalid = |reason: String| ContractError::InvalidOperation {
        method: method.to_string(),
        template: template.as_str().to_string(),
        reason,
    };

    // Operation-level parameters override path-level ones with the same (name, in).
    let mut parameters: Vec<ParameterDescriptor> = Vec::new();
    for raw_param in shared_parameters.iter().chain(raw.parameters.iter()) {
        if raw_param.reference.is_some() {
            continue;
        }
        let name = raw_param
            .name
            .clone()
            .ok_or_else(|| invalid("parameter without a name".to_string()))?;
        let location = raw_param
            .location
            .as_deref()
            .and_then(ParameterLocation::parse)
            .ok_or_else(|| invalid(format!("parameter '{}' has an invalid `in`", name)))?;
        if location == ParameterLocation::Path && !template.param_names().contains(&name.as_str()) {
            return Err(invalid(format!(
                "path parameter '{}' does not appear in the template",
                name
            )));
        }

        let descriptor = ParameterDescriptor {
            name,
            location,
            required: raw_param.required || location == ParameterLocation::Path,
        };
        match parameters
            .iter_mut()
            .find(|p| p.location == descriptor.location && p.name == descriptor.name)
        {
            Some(existing) => *existing = descriptor,
            None => parameters.push(descriptor),
        }
    }

    let id = raw
        .operation_id
        .clone()
        .unwrap_or_else(|| format!("{} {}", method, template.as_str()));

    let json_body = raw.request_body.as_ref().map_or(false, |body| {
        body.content.keys().any(|media_type| {
            let essence = media_type.split(';').next().unwrap_or("").trim();
            essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
        })
    });

    let mut examples: Vec<ExampleDescriptor> = Vec::new();
    for (status_key, response) in &raw.responses {
        let status = status_key_to_string(status_key)
            .ok_or_else(|| invalid(format!("invalid response status {:?}", status_key)))?;
        let response: RawResponse = serde_yaml::from_value(response.clone())?;

        for (media_type, content) in &response.content {
            let mut declared: Vec<(String, Option<String>, serde_json::Value)> = Vec::new();
            if let Some(value) = &content.example {
                declared.push(("default".to_string(), None, value.clone()));
            }
            for (name, example) in &content.examples {
                declared.push((
                    name.clone(),
                    example.summary.clone(),
                    example.value.clone().unwrap_or(serde_json::Value::Null),
                ));
            }

            for (name, summary, value) in declared {
                if let Some(existing) = examples
                    .iter_mut()
                    .find(|e| e.status == status && e.name == name)
                {
                    existing.media_types.push(media_type.clone());
                    continue;
                }
                let position = examples.len();
                examples.push(ExampleDescriptor {
                    key: ExampleKey {
                        operation: slot,
                        example: position,
                    },
                    name,
                    operation_id: id.clone(),
                    status: status.clone(),
                    media_types: vec![media_type.clone()],
                    summary,
                    value,
                });
            }
        }
    }

    Ok(OperationDescriptor {
        slot,
        id,
        method,
        template,
        parameters,
        json_body,
        examples,
    })
}

/// Normalise a response key: `200`, `4XX` or `default`.
fn status_key_to_string(key: &serde_yaml::Value) -> Option<String> {
    let text = match key {
        serde_yaml::Value::Number(n) => n.as_u64()?.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        _ => return None,
    };

    if text == "default" {
        return Some(text);
    }
    let bytes = text.as_bytes();
    if bytes.len() != 3 || !(b'1'..=b'5').contains(&bytes[0]) {
        return None;
    }
    let rest = &text[1..];
    if rest.bytes().all(|b| b.is_ascii_digit()) {
        return Some(text);
    }
    if rest.eq_ignore_ascii_case("xx") {
        return Some(text.to_ascii_uppercase());
    }
    None
}
