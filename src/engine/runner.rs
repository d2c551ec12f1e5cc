use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::{
    Background, KEY_REQUEST, KEY_RESPONSE, KEY_STATUS, KEY_TEST, KEY_URL,
};
use crate::error::{EngineError, ScriptError};

use super::consumer::DynamicConsumer;
use super::http::{build_headers, parse_method};
use super::latency::LatencyMarker;
use super::provider::{ProviderSource, RequestContent};
use super::Next;

/// Basic-auth credentials taken from a host URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

/// One test: provider → HTTP → consumer.
#[derive(Debug)]
pub struct Runner {
    name: String,
    provider: ProviderSource,
    consumer: DynamicConsumer,
    client: Client,
    timeout: Duration,
    credentials: Option<Credentials>,
    marker: Option<Arc<LatencyMarker>>,
}

impl Runner {
    pub fn new(
        name: impl Into<String>,
        provider: ProviderSource,
        consumer: DynamicConsumer,
        client: Client,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            consumer,
            client,
            timeout,
            credentials: None,
            marker: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_marker(mut self, marker: Option<Arc<LatencyMarker>>) -> Self {
        self.marker = marker;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn marker(&self) -> Option<&Arc<LatencyMarker>> {
        self.marker.as_ref()
    }

    pub async fn run(&self, bg: &mut Background) -> Next {
        bg.set_local(KEY_TEST, self.name.as_str());
        let content = match self.provider.get_provider(bg) {
            Ok(content) => content,
            Err(decision) => return decision,
        };

        bg.set_local(KEY_URL, content.url.as_str());
        bg.set_local(KEY_REQUEST, content.body.as_str());
        let request = match self.build_request(&content) {
            Ok(request) => request,
            Err(err) => {
                bg.set_local(KEY_STATUS, "");
                bg.set_local(KEY_RESPONSE, "");
                return self.consumer.process_failure(bg, err.to_string());
            }
        };
        tracing::debug!(
            schedule = bg.name(),
            test = %self.name,
            method = %content.method,
            url = %content.url,
            "sending request"
        );

        let passport = match bg.flow_control().cloned() {
            Some(gate) => Some(gate.acquire().await),
            None => None,
        };
        let started = Instant::now();
        let outcome = self.exchange(request).await;
        let elapsed = started.elapsed();
        if let Some(passport) = passport {
            passport.cancel();
        }

        match outcome {
            Ok((status, body)) => {
                bg.set_local(KEY_STATUS, status.to_string());
                bg.set_local(KEY_RESPONSE, body.as_str());
                let decision = self.consumer.consume(bg, status, &body);
                self.mark(elapsed, decision == Next::Continue && bg.error().is_none());
                decision
            }
            Err(err) => {
                self.mark(elapsed, false);
                bg.set_local(KEY_STATUS, "");
                bg.set_local(KEY_RESPONSE, "");
                self.consumer.process_failure(bg, err.to_string())
            }
        }
    }

    fn build_request(&self, content: &RequestContent) -> Result<reqwest::RequestBuilder, ScriptError> {
        let method = parse_method(&content.method)?;
        if content.url.trim().is_empty() {
            return Err(ScriptError::runtime("request URL is empty"));
        }
        let headers = build_headers(&content.headers)?;
        let mut request = self.client.request(method, content.url.trim()).headers(headers);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, credentials.password.as_ref());
        }
        if !content.body.is_empty() {
            request = request.body(content.body.clone());
        }
        Ok(request)
    }

    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), EngineError> {
        let classify = |err: reqwest::Error| {
            if err.is_timeout() {
                EngineError::Timeout(self.timeout)
            } else {
                EngineError::Transport(err)
            }
        };
        let response = request.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok((status, body))
    }

    fn mark(&self, elapsed: Duration, success: bool) {
        if let Some(marker) = &self.marker {
            marker.record(elapsed, success);
        }
    }

    pub fn close(&self) {
        self.provider.close();
    }
}
