//! Selection token injection.
//!
//! The token value is a Handlebars template rendered once per declared
//! example at startup, so a bad template or an example name that cannot be
//! carried in a header fails before any traffic is accepted.

use crate::config::{SelectionTokenConfig, TokenLocation};
use crate::contract::{ContractIndex, ExampleDescriptor, OperationDescriptor};
use crate::error::TokenError;
use crate::request::ProxyRequest;
use axum::http::{HeaderName, HeaderValue};
use handlebars::Handlebars;
use serde::Serialize;
use std::fmt;

const TEMPLATE_NAME: &str = "selection_token";

/// Variables available to the token template.
#[derive(Debug, Serialize)]
struct TokenContext<'a> {
    example: &'a str,
    status: &'a str,
    operation_id: &'a str,
    method: &'a str,
    path_template: &'a str,
}

/// The single marker added to an upstream-bound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionToken {
    pub location: TokenLocation,
    pub name: String,
    pub value: String,
}

impl fmt::Display for SelectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            TokenLocation::Header => write!(f, "{}: {}", self.name, self.value),
            TokenLocation::Query => write!(f, "?{}={}", self.name, self.value),
        }
    }
}

/// Decorates upstream-bound copies of requests with a selection token.
pub struct SelectorInjector {
    header_name: Option<HeaderName>,
    /// Tokens indexed by operation slot, then example position
    tokens: Vec<Vec<(SelectionToken, Option<HeaderValue>)>>,
}

impl SelectorInjector {
    /// Render a token for every example the contract declares.
    pub fn prepare(config: &SelectionTokenConfig, index: &ContractIndex) -> Result<Self, TokenError> {
        if config.name.trim().is_empty() {
            return Err(TokenError::InvalidName(config.name.clone()));
        }
        let header_name = match config.location {
            TokenLocation::Header => Some(
                HeaderName::from_bytes(config.name.as_bytes())
                    .map_err(|_| TokenError::InvalidName(config.name.clone()))?,
            ),
            TokenLocation::Query => None,
        };

        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // Token values are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(TEMPLATE_NAME, &config.value)
            .map_err(Box::new)?;

        let mut tokens = Vec::with_capacity(index.len());
        for operation in index.operations() {
            let mut per_operation = Vec::with_capacity(operation.examples().len());
            for example in operation.examples() {
                let value = render(&handlebars, operation, example)?;
                let header_value = match config.location {
                    TokenLocation::Header => Some(HeaderValue::from_str(&value).map_err(|_| {
                        TokenError::InvalidValue {
                            example: example.name.clone(),
                            value: value.clone(),
                        }
                    })?),
                    TokenLocation::Query => None,
                };
                per_operation.push((
                    SelectionToken {
                        location: config.location,
                        name: config.name.clone(),
                        value,
                    },
                    header_value,
                ));
            }
            tokens.push(per_operation);
        }

        Ok(Self {
            header_name,
            tokens,
        })
    }

    /// The token prepared for an example.
    pub fn token_for(&self, example: &ExampleDescriptor) -> Option<&SelectionToken> {
        self.entry(example).map(|(token, _)| token)
    }

    /// Build the upstream-bound copy of `request` carrying the example's token.
    ///
    /// Additive only: the original request is untouched and the copy keeps
    /// every header, path and query byte and body byte it already had.
    pub fn inject(&self, request: &ProxyRequest, example: &ExampleDescriptor) -> Option<ProxyRequest> {
        let (token, header_value) = self.entry(example)?;
        let mut decorated = request.clone();

        match (&self.header_name, header_value) {
            (Some(name), Some(value)) => {
                decorated.headers.append(name.clone(), value.clone());
            }
            _ => {
                let pair = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair(&token.name, &token.value)
                    .finish();
                decorated.query = Some(match request.query.as_deref() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, pair),
                    _ => pair,
                });
            }
        }

        Some(decorated)
    }

    fn entry(&self, example: &ExampleDescriptor) -> Option<&(SelectionToken, Option<HeaderValue>)> {
        let key = example.key();
        self.tokens.get(key.operation)?.get(key.example)
    }
}

fn render(
    handlebars: &Handlebars<'static>,
    operation: &OperationDescriptor,
    example: &ExampleDescriptor,
) -> Result<String, TokenError> {
    let ctx = TokenContext {
        example: &example.name,
        status: &example.status,
        operation_id: &operation.id,
        method: operation.method.as_str(),
        path_template: operation.template.as_str(),
    };
    handlebars
        .render(TEMPLATE_NAME, &ctx)
        .map_err(|source| TokenError::Render {
            example: example.name.clone(),
            source: Box::new(source),
        })
}
