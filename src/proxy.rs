//! The per-request pipeline.
//!
//! Each request walks `Received -> OperationResolved -> ExampleResolved ->
//! Forwarded -> Completed` or stops in one of the rejected states. Every
//! request is recorded in diagnostics before its response is returned.
//!
//! A single deadline, set when the request arrives, bounds both reading the
//! client body and the upstream exchange.

use crate::config::{ProxyConfig, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::contract::ContractIndex;
use crate::diagnostics::{DiagnosticsEntry, DiagnosticsRecorder, Outcome};
use crate::error::{NoExampleReason, ProxyError, RelayError};
use crate::injector::SelectorInjector;
use crate::matcher::{RequestMatcher, Resolution};
use crate::relay::{HttpRelay, Upstream};
use crate::request::{ProxyRequest, ProxyResponse, RequestSummary};
use crate::rules::RuleSet;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    OperationResolved,
    ExampleResolved,
    Forwarded,
    Completed,
    RejectedNoOperation,
    RejectedNoExample,
    RejectedUpstreamFailure,
}

impl RequestState {
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, OperationResolved)
                | (Received, RejectedNoOperation)
                | (OperationResolved, ExampleResolved)
                | (OperationResolved, RejectedNoExample)
                | (ExampleResolved, Forwarded)
                | (Forwarded, Completed)
                | (Forwarded, RejectedUpstreamFailure)
                // Deadline spent while the client body was still arriving
                | (Received, RejectedUpstreamFailure)
                | (OperationResolved, RejectedUpstreamFailure)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::RejectedNoOperation
                | RequestState::RejectedNoExample
                | RequestState::RejectedUpstreamFailure
        )
    }
}

/// Process-wide request counters.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    total: AtomicU64,
    forwarded: AtomicU64,
    rejected_no_operation: AtomicU64,
    rejected_no_example: AtomicU64,
    upstream_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub forwarded: u64,
    pub rejected_no_operation: u64,
    pub rejected_no_example: u64,
    pub upstream_failures: u64,
}

impl ProxyCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rejected_no_operation: self.rejected_no_operation.load(Ordering::Relaxed),
            rejected_no_example: self.rejected_no_example.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one request's state and the details its diagnostics entry needs.
struct RequestRecord {
    state: RequestState,
    summary: RequestSummary,
    started: Instant,
    operation_id: Option<String>,
    example: Option<String>,
    selected_by: Option<String>,
    selection_token: Option<String>,
}

impl RequestRecord {
    fn new(request: &ProxyRequest) -> Self {
        Self {
            state: RequestState::Received,
            summary: request.summary(),
            started: Instant::now(),
            operation_id: None,
            example: None,
            selected_by: None,
            selection_token: None,
        }
    }

    fn advance(&mut self, next: RequestState) {
        if self.state.can_transition_to(next) {
            trace!(from = ?self.state, to = ?next, path = %self.summary.path, "Request state");
            self.state = next;
        } else {
            warn!(from = ?self.state, to = ?next, "Ignoring illegal request state transition");
        }
    }

    fn into_entry(self, outcome: Outcome) -> DiagnosticsEntry {
        let mut entry = DiagnosticsEntry::new(self.summary, self.state, outcome);
        entry.operation_id = self.operation_id;
        entry.example = self.example;
        entry.selected_by = self.selected_by;
        entry.selection_token = self.selection_token;
        entry.elapsed_ms = self.started.elapsed().as_millis() as u64;
        entry
    }
}

/// Resolves, decorates and relays requests.
pub struct ProxyService {
    matcher: RequestMatcher,
    injector: SelectorInjector,
    upstream: Arc<dyn Upstream>,
    diagnostics: Arc<DiagnosticsRecorder>,
    counters: ProxyCounters,
    request_timeout: Duration,
}

impl ProxyService {
    pub fn new(
        matcher: RequestMatcher,
        injector: SelectorInjector,
        upstream: Arc<dyn Upstream>,
        diagnostics: Arc<DiagnosticsRecorder>,
    ) -> Self {
        Self {
            matcher,
            injector,
            upstream,
            diagnostics,
            counters: ProxyCounters::default(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Load contract and rules, prepare tokens and the HTTP relay.
    ///
    /// Any invalid input fails here, before traffic is accepted.
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let index = Arc::new(ContractIndex::from_file(&config.contract)?);
        let rules = match &config.rules {
            Some(path) if path.exists() => RuleSet::from_file(path, &index)?,
            Some(path) => {
                warn!(path = %path.display(), "Rule file not found, running without rules");
                RuleSet::empty()
            }
            None => RuleSet::empty(),
        };
        let injector = SelectorInjector::prepare(&config.selection_token, &index)?;
        let relay = HttpRelay::new(config.upstream_url()?, config.request_timeout())?;
        let matcher = RequestMatcher::new(index, Arc::new(rules))
            .with_required_parameters(config.enforce_required_parameters);

        info!(
            operations = matcher.contract().len(),
            rules = matcher.rules().len(),
            defaults = matcher.rules().defaults_len(),
            upstream = %config.upstream,
            "Proxy initialized"
        );

        Ok(Self::new(
            matcher,
            injector,
            Arc::new(relay),
            Arc::new(DiagnosticsRecorder::new(&config.diagnostics)),
        )
        .with_request_timeout(config.request_timeout()))
    }

    pub fn contract(&self) -> &ContractIndex {
        self.matcher.contract()
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsRecorder> {
        &self.diagnostics
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Run one request through the pipeline with a full time budget.
    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        self.handle_until(request, deadline).await
    }

    /// Run one request through the pipeline; the upstream exchange must
    /// finish by `deadline`.
    pub async fn handle_until(
        &self,
        request: ProxyRequest,
        deadline: tokio::time::Instant,
    ) -> Result<ProxyResponse, ProxyError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let mut record = RequestRecord::new(&request);

        let resolved = match self.matcher.resolve_operation(&request) {
            Some(resolved) => resolved,
            None => return Err(self.reject_no_operation(record, &request)),
        };
        record.advance(RequestState::OperationResolved);
        record.operation_id = Some(resolved.operation.id.clone());

        let matched = match self.matcher.select_example(resolved, &request) {
            Resolution::Matched(matched) => matched,
            Resolution::NoExample { reason, .. } => {
                return Err(self.reject_no_example(record, reason));
            }
            Resolution::NoOperation => return Err(self.reject_no_operation(record, &request)),
        };

        let token = self.injector.token_for(matched.example);
        let decorated = match (token, self.injector.inject(&request, matched.example)) {
            (Some(token), Some(decorated)) => {
                record.selection_token = Some(token.to_string());
                decorated
            }
            _ => {
                let reason = NoExampleReason::TokenUnavailable {
                    example: matched.example.name.clone(),
                };
                return Err(self.reject_no_example(record, reason));
            }
        };
        record.advance(RequestState::ExampleResolved);
        record.example = Some(matched.example.name.clone());
        record.selected_by = Some(matched.selected_by.to_string());

        record.advance(RequestState::Forwarded);
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);

        match self.upstream.forward(decorated, deadline).await {
            Ok(response) => {
                record.advance(RequestState::Completed);
                info!(
                    method = %request.method,
                    path = %request.path,
                    operation_id = %matched.operation.id,
                    example = %matched.example.name,
                    selected_by = %matched.selected_by,
                    status = response.status.as_u16(),
                    "Request forwarded"
                );
                let outcome = Outcome::Forwarded {
                    status: response.status.as_u16(),
                };
                self.diagnostics.record(record.into_entry(outcome));
                Ok(response)
            }
            Err(err) => {
                record.advance(RequestState::RejectedUpstreamFailure);
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    method = %request.method,
                    path = %request.path,
                    operation_id = %matched.operation.id,
                    example = %matched.example.name,
                    error = %err,
                    "Upstream failure"
                );
                let outcome = Outcome::RejectedUpstreamFailure {
                    error: err.to_string(),
                    timeout: matches!(err, RelayError::Timeout { .. }),
                };
                self.diagnostics.record(record.into_entry(outcome));
                Err(ProxyError::Upstream(err))
            }
        }
    }

    /// Reject a request whose body could not be read.
    ///
    /// `request` carries the head only. The upstream is never contacted.
    pub fn reject_unreadable_body(&self, request: &ProxyRequest, reason: NoExampleReason) -> ProxyError {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let mut record = RequestRecord::new(request);

        match self.matcher.resolve_operation(request) {
            Some(resolved) => {
                record.advance(RequestState::OperationResolved);
                record.operation_id = Some(resolved.operation.id.clone());
                self.reject_no_example(record, reason)
            }
            None => self.reject_no_operation(record, request),
        }
    }

    /// Reject a request whose body did not arrive before its deadline.
    ///
    /// Reported as an upstream timeout. `received` is when the request head
    /// arrived.
    pub fn reject_body_timeout(&self, request: &ProxyRequest, received: tokio::time::Instant) -> ProxyError {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
        let mut record = RequestRecord::new(request);
        record.started = received.into_std();

        if let Some(resolved) = self.matcher.resolve_operation(request) {
            record.advance(RequestState::OperationResolved);
            record.operation_id = Some(resolved.operation.id.clone());
        }
        record.advance(RequestState::RejectedUpstreamFailure);

        let err = RelayError::Timeout {
            timeout_ms: self.request_timeout.as_millis() as u64,
        };
        warn!(
            method = %request.method,
            path = %request.path,
            timeout_ms = self.request_timeout.as_millis() as u64,
            "Client body not received before the request deadline"
        );
        self.diagnostics
            .record(record.into_entry(Outcome::RejectedUpstreamFailure {
                error: err.to_string(),
                timeout: true,
            }));
        ProxyError::Upstream(err)
    }

    fn reject_no_operation(&self, mut record: RequestRecord, request: &ProxyRequest) -> ProxyError {
        record.advance(RequestState::RejectedNoOperation);
        self.counters
            .rejected_no_operation
            .fetch_add(1, Ordering::Relaxed);
        warn!(method = %request.method, path = %request.path, "No operation matches request");
        self.diagnostics
            .record(record.into_entry(Outcome::RejectedNoOperation));

        ProxyError::NoOperation {
            method: request.method.to_string(),
            path: request.path.clone(),
        }
    }

    fn reject_no_example(&self, mut record: RequestRecord, reason: NoExampleReason) -> ProxyError {
        record.advance(RequestState::RejectedNoExample);
        self.counters.rejected_no_example.fetch_add(1, Ordering::Relaxed);
        let operation_id = record.operation_id.clone().unwrap_or_default();
        warn!(
            method = %record.summary.method,
            path = %record.summary.path,
            operation_id = %operation_id,
            reason = %reason,
            "No example selected"
        );
        self.diagnostics.record(record.into_entry(Outcome::RejectedNoExample {
            reason: reason.clone(),
        }));

        ProxyError::NoExample {
            operation_id,
            reason,
        }
    }
}
