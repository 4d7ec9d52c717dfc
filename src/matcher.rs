//! Request matching logic.
//!
//! Resolves an inbound request to a contract operation, then to the single
//! example the upstream mock engine should return.

use crate::contract::{
    ContractIndex, ExampleDescriptor, OperationDescriptor, ParameterLocation, ResolvedOperation,
};
use crate::error::NoExampleReason;
use crate::request::ProxyRequest;
use crate::rules::RuleSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// How the example was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A selection rule matched (by label)
    Rule(String),
    /// No rule matched; the operation's configured default applied
    Default,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Rule(label) => write!(f, "rule:{}", label),
            Selection::Default => write!(f, "default"),
        }
    }
}

/// A fully resolved request.
#[derive(Debug)]
pub struct MatchedExample<'a> {
    pub operation: &'a OperationDescriptor,
    pub example: &'a ExampleDescriptor,
    /// Path parameters extracted from the template
    pub path_params: HashMap<String, String>,
    pub selected_by: Selection,
}

/// Outcome of matching one request.
#[derive(Debug)]
pub enum Resolution<'a> {
    Matched(MatchedExample<'a>),
    /// The contract declares no such endpoint
    NoOperation,
    /// The endpoint exists but no example could be selected
    NoExample {
        operation: &'a OperationDescriptor,
        reason: NoExampleReason,
    },
}

impl Resolution<'_> {
    /// Name of the selected example, if any.
    pub fn example_name(&self) -> Option<&str> {
        match self {
            Resolution::Matched(m) => Some(m.example.name.as_str()),
            _ => None,
        }
    }
}

/// Request matcher engine.
///
/// Holds only immutable state, so one instance serves all in-flight requests.
pub struct RequestMatcher {
    index: Arc<ContractIndex>,
    rules: Arc<RuleSet>,
    enforce_required_parameters: bool,
}

impl RequestMatcher {
    pub fn new(index: Arc<ContractIndex>, rules: Arc<RuleSet>) -> Self {
        Self {
            index,
            rules,
            enforce_required_parameters: true,
        }
    }

    /// Toggle rejection of requests missing required query/header parameters.
    pub fn with_required_parameters(mut self, enforce: bool) -> Self {
        self.enforce_required_parameters = enforce;
        self
    }

    pub fn contract(&self) -> &ContractIndex {
        &self.index
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Resolve operation and example for a request.
    pub fn resolve(&self, request: &ProxyRequest) -> Resolution<'_> {
        match self.resolve_operation(request) {
            Some(resolved) => self.select_example(resolved, request),
            None => Resolution::NoOperation,
        }
    }

    /// First step only: which operation does this request target?
    pub fn resolve_operation(&self, request: &ProxyRequest) -> Option<ResolvedOperation<'_>> {
        self.index.resolve(&request.method, &request.path)
    }

    /// Second step: pick the example for an already-resolved operation.
    ///
    /// Rules are evaluated in priority order and the first whose predicates
    /// all hold wins; otherwise the configured default applies.
    pub fn select_example<'a>(
        &'a self,
        resolved: ResolvedOperation<'a>,
        request: &ProxyRequest,
    ) -> Resolution<'a> {
        let operation = resolved.operation;
        let no_example = |reason| Resolution::NoExample { operation, reason };

        let query_pairs = request.query_pairs();

        if self.enforce_required_parameters {
            if let Some(reason) = missing_parameter(operation, request, &query_pairs) {
                return no_example(reason);
            }
        }

        let candidates = self.rules.rules_for(operation.slot());

        let needs_body = request.has_json_body()
            || operation.json_body
            || candidates.iter().any(|rule| rule.has_body_fields());
        let body = if needs_body && !request.body.is_empty() {
            match serde_json::from_slice::<serde_json::Value>(&request.body) {
                Ok(json) => Some(json),
                Err(e) => {
                    return no_example(NoExampleReason::MalformedBody {
                        detail: e.to_string(),
                    })
                }
            }
        } else {
            None
        };

        for rule in candidates {
            if !rule.matches(request, &query_pairs, body.as_ref()) {
                trace!(rule = %rule.label(), priority = rule.priority(), "Rule did not match");
                continue;
            }
            if let Some(example) = operation.example(rule.example()) {
                return Resolution::Matched(MatchedExample {
                    operation,
                    example,
                    path_params: resolved.path_params,
                    selected_by: Selection::Rule(rule.label().to_string()),
                });
            }
        }

        match self
            .rules
            .default_for(operation.slot())
            .and_then(|position| operation.example(position))
        {
            Some(example) => Resolution::Matched(MatchedExample {
                operation,
                example,
                path_params: resolved.path_params,
                selected_by: Selection::Default,
            }),
            None => no_example(NoExampleReason::NoRuleMatched),
        }
    }
}

fn missing_parameter(
    operation: &OperationDescriptor,
    request: &ProxyRequest,
    query_pairs: &[(String, String)],
) -> Option<NoExampleReason> {
    for param in operation.required_parameters() {
        let present = match param.location {
            ParameterLocation::Query => query_pairs.iter().any(|(k, _)| *k == param.name),
            ParameterLocation::Header => request.header_values(&param.name).next().is_some(),
            // Path parameters are guaranteed by template matching; cookies are not checked.
            ParameterLocation::Path | ParameterLocation::Cookie => true,
        };
        if !present {
            return Some(NoExampleReason::MissingParameter {
                location: param.location.as_str().to_string(),
                name: param.name.clone(),
            });
        }
    }
    None
}
