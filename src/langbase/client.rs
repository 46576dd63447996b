//! HTTP transport to Langbase Pipes.
//!
//! Two endpoints are used: `/v1/pipes/run` answers oracle calls and
//! `/v1/pipes` upserts the pipes at startup. Only runs are retried, with
//! exponential backoff; a 4xx other than 429 ends the attempt loop at once.

use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::types::{CreatePipeRequest, CreatePipeResponse, Message, PipeRequest, PipeResponse};
use crate::config::{LangbaseConfig, RequestConfig};
use crate::error::{LangbaseError, LangbaseResult};

const RUN_PATH: &str = "/v1/pipes/run";
const PIPES_PATH: &str = "/v1/pipes";

/// Model and sampling used for every pipe this tool creates.
const PIPE_MODEL: &str = "openai:gpt-4o-mini";
const PIPE_TEMPERATURE: f64 = 0.2;
const PIPE_MAX_TOKENS: u32 = 4000;

/// Client for the Langbase Pipes API.
#[derive(Clone)]
pub struct LangbaseClient {
    http: Client,
    base_url: String,
    api_key: String,
    request: RequestConfig,
}

impl LangbaseClient {
    pub fn new(config: &LangbaseConfig, request: RequestConfig) -> LangbaseResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(request.timeout_ms))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a pipe, retrying transient failures.
    ///
    /// After the retry budget is spent the last failure is reported as
    /// [`LangbaseError::Unavailable`] with the number of failed attempts.
    pub async fn call_pipe(&self, request: PipeRequest) -> LangbaseResult<PipeResponse> {
        let mut attempts = 0;
        let mut last_failure = String::from("no attempt made");

        while attempts <= self.request.max_retries {
            if attempts > 0 {
                let delay = self.backoff(attempts);
                warn!(
                    pipe = %request.name,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Oracle call backing off"
                );
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let outcome: LangbaseResult<PipeResponse> = self.post(RUN_PATH, &request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    info!(
                        pipe = %request.name,
                        elapsed_ms,
                        total_tokens = ?response.total_tokens(),
                        "Oracle answered"
                    );
                    return Ok(response);
                }
                Err(e) if !is_transient(&e) => {
                    warn!(pipe = %request.name, error = %e, elapsed_ms, "Oracle rejected request");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        pipe = %request.name,
                        error = %e,
                        elapsed_ms,
                        attempt = attempts + 1,
                        "Oracle call failed"
                    );
                    last_failure = e.to_string();
                    attempts += 1;
                }
            }
        }

        Err(LangbaseError::Unavailable {
            message: last_failure,
            retries: attempts,
        })
    }

    /// Create or update a pipe. One attempt only.
    pub async fn create_pipe(&self, request: CreatePipeRequest) -> LangbaseResult<CreatePipeResponse> {
        info!(pipe = %request.name, "Upserting oracle pipe");
        let created: CreatePipeResponse = self.post(PIPES_PATH, &request).await?;
        debug!(pipe = %created.name, status = %created.status, "Pipe stored");
        Ok(created)
    }

    /// Make sure `pipe_name` exists with `system_prompt` as its system message.
    /// A 409 from the API means the pipe is already there.
    pub async fn ensure_pipe(
        &self,
        pipe_name: &str,
        description: &str,
        system_prompt: &str,
    ) -> LangbaseResult<()> {
        let request = CreatePipeRequest::new(pipe_name)
            .with_description(description)
            .with_model(PIPE_MODEL)
            .with_upsert(true)
            .with_json_output(true)
            .with_temperature(PIPE_TEMPERATURE)
            .with_max_tokens(PIPE_MAX_TOKENS)
            .with_messages(vec![Message::system(system_prompt)]);

        match self.create_pipe(request).await {
            Ok(_) => {}
            Err(LangbaseError::Api { status: 409, .. }) => {
                debug!(pipe = %pipe_name, "Pipe already present");
            }
            Err(e) => return Err(e),
        }
        info!(pipe = %pipe_name, "Oracle pipe ready");
        Ok(())
    }

    /// One authenticated JSON POST against `path`.
    async fn post<B, R>(&self, path: &str, body: &B) -> LangbaseResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Posting to Langbase");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response.text().await.unwrap_or_default()));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| LangbaseError::InvalidResponse {
                message: format!("{} returned an unreadable body: {}", path, e),
            })
    }

    fn transport_error(&self, e: reqwest::Error) -> LangbaseError {
        if e.is_timeout() {
            LangbaseError::Timeout {
                timeout_ms: self.request.timeout_ms,
            }
        } else {
            LangbaseError::Http(e)
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.request.retry_delay_ms.saturating_mul(factor))
    }
}

fn api_error(status: StatusCode, body: String) -> LangbaseError {
    LangbaseError::Api {
        status: status.as_u16(),
        message: body,
    }
}

/// Whether another attempt could succeed. Client errors other than rate
/// limiting will not.
fn is_transient(error: &LangbaseError) -> bool {
    match error {
        LangbaseError::Api { status, .. } => *status == 429 || !(400..500).contains(status),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str, retry_delay_ms: u64) -> LangbaseClient {
        let config = LangbaseConfig {
            api_key: "test_key".to_string(),
            base_url: base_url.to_string(),
        };
        let request = RequestConfig {
            retry_delay_ms,
            ..RequestConfig::default()
        };
        LangbaseClient::new(&config, request).unwrap()
    }

    #[test]
    fn test_client_trims_base_url() {
        assert_eq!(client("http://localhost:8080/", 10).base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let client = client("http://localhost:8080", 100);
        assert_eq!(client.backoff(1), Duration::from_millis(100));
        assert_eq!(client.backoff(2), Duration::from_millis(200));
        assert_eq!(client.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_only_client_errors_are_final() {
        let api = |status| LangbaseError::Api {
            status,
            message: String::new(),
        };
        assert!(!is_transient(&api(400)));
        assert!(!is_transient(&api(401)));
        assert!(is_transient(&api(429)));
        assert!(is_transient(&api(503)));
        assert!(is_transient(&LangbaseError::Timeout { timeout_ms: 10 }));
        assert!(is_transient(&LangbaseError::InvalidResponse {
            message: "not json".to_string()
        }));
    }
}
