//! Aggregation of responses from several targets.
//!
//! A collector is fed one response per target as they arrive. It may produce a result
//! early, in which case outstanding responses are ignored, or wait for
//! [`finish`](ResponseCollector::finish) once every target has answered.
//!
//! Collectors are created fresh for every invocation. Built with
//! `with_expected(n)`, a collector knows how many targets will answer and completes as
//! soon as the last expected response arrives.

use crate::dispatch::response::{Response, ResponseValue};
use crate::error::{Error, Result};
use crate::types::NodeId;
use std::collections::BTreeMap;

/// Folds per-target responses into one outcome.
pub trait ResponseCollector: Send + 'static {
    type Output: Send + 'static;

    /// Add one target's response. Returning `Some` completes the invocation.
    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Self::Output>>;

    /// Produce the outcome after every target has answered.
    fn finish(self) -> Result<Self::Output>;
}

/// Requires every target to succeed.
///
/// Fails as soon as one target fails; otherwise yields every target's value.
#[derive(Debug, Default)]
pub struct UnanimousCollector {
    values: BTreeMap<NodeId, ResponseValue>,
    expected: usize,
}

impl UnanimousCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected(expected: usize) -> Self {
        Self {
            values: BTreeMap::new(),
            expected,
        }
    }
}

impl ResponseCollector for UnanimousCollector {
    type Output = BTreeMap<NodeId, ResponseValue>;

    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Self::Output>> {
        match response.into_result(sender) {
            Ok(value) => {
                self.values.insert(sender, value);
                (self.values.len() == self.expected).then(|| Ok(std::mem::take(&mut self.values)))
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn finish(self) -> Result<Self::Output> {
        Ok(self.values)
    }
}

/// Completes with the first successful response.
///
/// Fails only when no target succeeded, with the first failure seen.
#[derive(Debug, Default)]
pub struct FirstSuccessCollector {
    first_error: Option<Error>,
    failures: usize,
    expected: usize,
}

impl FirstSuccessCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails as soon as all `expected` targets have failed.
    pub fn with_expected(expected: usize) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }
}

impl ResponseCollector for FirstSuccessCollector {
    type Output = ResponseValue;

    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Self::Output>> {
        match response.into_result(sender) {
            Ok(value) => Some(Ok(value)),
            Err(e) => {
                self.first_error.get_or_insert(e);
                self.failures += 1;
                if self.failures == self.expected {
                    self.first_error.take().map(Err)
                } else {
                    None
                }
            }
        }
    }

    fn finish(self) -> Result<Self::Output> {
        Err(self
            .first_error
            .unwrap_or_else(|| Error::Internal("no targets answered".to_string())))
    }
}

/// Keeps every response as it arrived, success or not.
#[derive(Debug, Default)]
pub struct PassthroughMapCollector {
    responses: BTreeMap<NodeId, Response>,
    expected: usize,
}

impl PassthroughMapCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected(expected: usize) -> Self {
        Self {
            responses: BTreeMap::new(),
            expected,
        }
    }
}

impl ResponseCollector for PassthroughMapCollector {
    type Output = BTreeMap<NodeId, Response>;

    fn add_response(&mut self, sender: NodeId, response: Response) -> Option<Result<Self::Output>> {
        self.responses.insert(sender, response);
        (self.responses.len() == self.expected).then(|| Ok(std::mem::take(&mut self.responses)))
    }

    fn finish(self) -> Result<Self::Output> {
        Ok(self.responses)
    }
}
