use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::background::{Background, KEY_FAILURE};
use crate::script::Composable;
use crate::template::Template;

use super::Next;

/// What a failed check does to the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[serde(rename = "abort-on-fail")]
    AbortPlan,
    #[serde(rename = "ignore-on-fail")]
    Continue,
    AbortAll,
}

impl FailurePolicy {
    /// `Options.AbortIfFail`: true stops the plan, false keeps going and
    /// unset stops the whole run.
    pub fn from_abort_if_fail(abort_if_fail: Option<bool>) -> Self {
        match abort_if_fail {
            Some(true) => FailurePolicy::AbortPlan,
            Some(false) => FailurePolicy::Continue,
            None => FailurePolicy::AbortAll,
        }
    }

    pub fn decision(self) -> Next {
        match self {
            FailurePolicy::AbortPlan => Next::AbortPlan,
            FailurePolicy::Continue => Next::Continue,
            FailurePolicy::AbortAll => Next::AbortAll,
        }
    }
}

/// Validates a response: template, then `check` scripts, then the
/// `success` or `failure` handlers.
#[derive(Debug)]
pub struct DynamicConsumer {
    template: Option<Arc<Template>>,
    check: Vec<Arc<dyn Composable>>,
    success: Vec<Arc<dyn Composable>>,
    failure: Vec<Arc<dyn Composable>>,
    policy: FailurePolicy,
}

impl DynamicConsumer {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            template: None,
            check: Vec::new(),
            success: Vec::new(),
            failure: Vec::new(),
            policy,
        }
    }

    pub fn with_template(mut self, template: Option<Template>) -> Self {
        self.template = template.map(Arc::new);
        self
    }

    pub fn with_check(mut self, check: Vec<Arc<dyn Composable>>) -> Self {
        self.check = check;
        self
    }

    pub fn with_success(mut self, success: Vec<Arc<dyn Composable>>) -> Self {
        self.success = success;
        self
    }

    pub fn with_failure(mut self, failure: Vec<Arc<dyn Composable>>) -> Self {
        self.failure = failure;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn consume(&self, bg: &mut Background, status: u16, body: &str) -> Next {
        bg.clear_error();
        match self.verify(bg, body) {
            Ok(()) => {
                for segment in &self.success {
                    if let Err(err) = segment.compose(bg) {
                        tracing::debug!(schedule = bg.name(), error = %err, "success handler failed");
                    }
                }
                Next::Continue
            }
            Err(reason) => {
                tracing::debug!(schedule = bg.name(), status, %reason, "response check failed");
                self.process_failure(bg, reason)
            }
        }
    }

    fn verify(&self, bg: &mut Background, body: &str) -> Result<(), String> {
        if let Some(template) = &self.template {
            match serde_json::from_str::<serde_json::Value>(body) {
                Ok(observed) => template.compare(bg, &observed).map_err(|err| err.to_string())?,
                Err(err) => {
                    tracing::debug!(schedule = bg.name(), error = %err, "body is not JSON, template skipped");
                }
            }
        }
        for segment in &self.check {
            segment.compose(bg).map_err(|err| err.to_string())?;
            if let Some(error) = bg.error() {
                return Err(error.to_string());
            }
        }
        Ok(())
    }

    /// Record `reason`, run the failure handlers and apply the policy.
    pub fn process_failure(&self, bg: &mut Background, reason: impl Into<String>) -> Next {
        let reason = reason.into();
        bg.set_local(KEY_FAILURE, reason.clone());
        bg.set_error(reason.clone());
        for segment in &self.failure {
            if let Err(err) = segment.compose(bg) {
                tracing::debug!(schedule = bg.name(), error = %err, "failure handler failed");
            }
        }
        let decision = self.policy.decision();
        tracing::warn!(
            schedule = bg.name(),
            test = %bg.get_local(crate::background::KEY_TEST),
            sequence = %bg.get_local(crate::background::KEY_SEQUENCE),
            %reason,
            ?decision,
            "test failed"
        );
        bg.set_error(reason);
        decision
    }
}
