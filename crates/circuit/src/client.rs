use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use tracing::warn;

use crate::{CircuitBreaker, HttpError};

/// Retry knobs for one downstream. Delay grows as
/// `retry_delay · 2^(attempt−1)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// `reqwest` wrapped with a named circuit breaker and bounded retries.
///
/// 4xx responses are terminal (the caller's input is wrong, retrying cannot
/// help); 5xx and transport errors consume the retry budget and feed the
/// breaker.
#[derive(Clone)]
pub struct ResilientClient {
    client: Client,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(service: &str, timeout: Duration, policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            breaker: Arc::new(CircuitBreaker::new(
                service,
                5,
                2,
                Duration::from_secs(30),
            )),
            policy,
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Arc::new(breaker);
        self
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `build` against the inner client for each attempt and send the
    /// request. The closure rebuilds the request because `RequestBuilder`
    /// is consumed per send.
    pub async fn send<F>(&self, build: F) -> Result<Response, HttpError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let service = self.breaker.service().to_string();
        let mut last_err: Option<HttpError> = None;

        for attempt in 1..=self.policy.retries.max(1) {
            self.breaker.check()?;

            match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.breaker.record_success();
                    return Ok(resp);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    if (400..500).contains(&status) {
                        // Caller error; does not count against the breaker.
                        return Err(HttpError::Status {
                            service,
                            status,
                            body,
                        });
                    }
                    self.breaker.record_failure();
                    warn!(service = %service, status, attempt, "downstream 5xx");
                    last_err = Some(HttpError::Status {
                        service: service.clone(),
                        status,
                        body,
                    });
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(service = %service, error = %e, attempt, "request failed");
                    last_err = Some(if e.is_timeout() {
                        HttpError::Timeout {
                            service: service.clone(),
                        }
                    } else {
                        HttpError::Network {
                            service: service.clone(),
                            message: e.to_string(),
                        }
                    });
                }
            }

            if attempt < self.policy.retries {
                let delay = self.policy.retry_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err.unwrap_or(HttpError::Network {
            service: self.breaker.service().to_string(),
            message: "request not attempted".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_client(retries: u32) -> ResilientClient {
        ResilientClient::new(
            "test",
            Duration::from_secs(2),
            RetryPolicy {
                retries,
                retry_delay: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn four_xx_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
            .expect(1)
            .mount(&server)
            .await;

        let client = quick_client(3);
        let err = client
            .send(|c| c.get(format!("{}/res", server.uri())))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(422));
    }

    #[tokio::test]
    async fn five_xx_consumes_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = quick_client(3);
        let err = client
            .send(|c| c.get(format!("{}/res", server.uri())))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(503));
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/res"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = quick_client(5).with_breaker(CircuitBreaker::new(
            "test",
            3,
            1,
            Duration::from_secs(60),
        ));
        // Trip the breaker inside one call's retry loop.
        let _ = client
            .send(|c| c.get(format!("{}/res", server.uri())))
            .await;

        let err = client
            .send(|c| c.get(format!("{}/res", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::CircuitOpen { .. }));
    }
}
