use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::background::Background;
use crate::error::ScriptError;
use crate::script::Composable;

use super::Next;

pub const CATEGORY_METHOD: &str = "_method_";
pub const CATEGORY_URL: &str = "_url_";
pub const CATEGORY_BODY: &str = "_body_";

/// Material for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContent {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RequestContent {
    fn from_categories(mut produced: BTreeMap<String, String>) -> Self {
        let method = produced
            .remove(CATEGORY_METHOD)
            .filter(|method| !method.trim().is_empty())
            .unwrap_or_else(|| "GET".to_string());
        let url = produced.remove(CATEGORY_URL).unwrap_or_default();
        let body = produced.remove(CATEGORY_BODY).unwrap_or_default();
        Self {
            method,
            url,
            headers: produced.into_iter().collect(),
            body,
        }
    }
}

/// Produces request material for each iteration. `Err(ScriptError::Eof)`
/// ends the feed.
pub trait Feeder: fmt::Debug + Send + Sync {
    fn feed(&self, bg: &mut Background) -> Result<RequestContent, ScriptError>;

    fn close(&self) {}
}

/// Feeder built from compiled segments: `_method_`, `_url_`, `_body_` and
/// one entry per header, preceded by pre-process segments.
#[derive(Debug, Default)]
pub struct DynamicFeeder {
    categories: BTreeMap<String, Arc<dyn Composable>>,
    pre_process: Vec<Arc<dyn Composable>>,
    limit: u64,
    counter: AtomicU64,
}

impl DynamicFeeder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, name: impl Into<String>, segment: Arc<dyn Composable>) -> Self {
        self.categories.insert(name.into(), segment);
        self
    }

    pub fn with_pre_process(mut self, segments: Vec<Arc<dyn Composable>>) -> Self {
        self.pre_process = segments;
        self
    }

    /// Stop after `limit` feeds; zero leaves the feed unbounded.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

impl Feeder for DynamicFeeder {
    fn feed(&self, bg: &mut Background) -> Result<RequestContent, ScriptError> {
        if self.limit > 0 && self.counter.fetch_add(1, Ordering::Relaxed) >= self.limit {
            return Err(ScriptError::Eof);
        }

        for segment in &self.pre_process {
            segment.compose(bg)?;
        }

        let mut produced = BTreeMap::new();
        for (name, segment) in &self.categories {
            produced.insert(name.clone(), segment.compose(bg)?);
        }
        Ok(RequestContent::from_categories(produced))
    }

    fn close(&self) {
        for segment in self.pre_process.iter().chain(self.categories.values()) {
            segment.close();
        }
    }
}

/// Wraps a feeder and turns its outcome into a run decision.
#[derive(Debug)]
pub struct ProviderSource {
    feeder: Box<dyn Feeder>,
}

impl ProviderSource {
    pub fn new(feeder: impl Feeder + 'static) -> Self {
        Self {
            feeder: Box::new(feeder),
        }
    }

    /// `Err(Next::Finished)` once the feed is exhausted, `Err(Next::AbortPlan)`
    /// on any other failure (the cause lands in the error slot).
    pub fn get_provider(&self, bg: &mut Background) -> Result<RequestContent, Next> {
        match self.feeder.feed(bg) {
            Ok(content) => Ok(content),
            Err(ScriptError::Eof) => Err(Next::Finished),
            Err(err) => {
                tracing::warn!(schedule = bg.name(), error = %err, "request provider failed");
                bg.set_error(err.to_string());
                Err(Next::AbortPlan)
            }
        }
    }

    pub fn close(&self) {
        self.feeder.close();
    }
}
