//! Contract-conformant example proxy
//!
//! An HTTP proxy that sits in front of a contract-driven mock engine. For
//! every request it finds the matching operation in an OpenAPI 3 contract,
//! picks one of that operation's declared examples using operator-configured
//! selection rules, and forwards the request upstream with a single token
//! naming the example. Requests the contract does not describe are rejected
//! instead of forwarded.
//!
//! # Features
//!
//! - **Operation Resolution**: Literal, mixed and parameter path segments
//! - **Selection Rules**: Match on headers, query parameters and JSON body fields
//! - **Token Injection**: Header or query token rendered with Handlebars
//! - **Faithful Relay**: Upstream status, headers and body streamed back
//! - **Diagnostics**: Bounded record of recent decisions, plus counters
//!
//! # Example Configuration
//!
//! ```yaml
//! contract: openapi.yaml
//! rules: selection-rules.yaml
//! listen: 127.0.0.1:4011
//! upstream: http://127.0.0.1:4010
//! selection_token:
//!   location: header
//!   name: Prefer
//!   value: "example={{example}}"
//! ```
//!
//! # Example Selection Rules
//!
//! ```yaml
//! rules:
//!   - id: books-in-stock
//!     method: GET
//!     path: /api/books
//!     match_on:
//!       headers:
//!         prefer: "example=inStockExample"
//!     example: inStockExample
//! defaults:
//!   - method: GET
//!     path: /api/books
//!     example: soldOutExample
//! ```

pub mod config;
pub mod contract;
pub mod diagnostics;
pub mod error;
pub mod injector;
pub mod matcher;
pub mod path_template;
pub mod proxy;
pub mod relay;
pub mod request;
pub mod rules;
pub mod server;

pub use config::ProxyConfig;
pub use contract::ContractIndex;
pub use error::ProxyError;
pub use proxy::ProxyService;
pub use server::{build_router, ProxyServer, ServerSettings};
