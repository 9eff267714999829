//! Transport wrapper: header assembly, transient retries, response routing.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, trace};

use crate::config::{RequestHook, RestConfig};
use crate::error::{RestError, TransportError};
use crate::http::{HttpClient, HttpRequest, HttpResponse, RequestBody};
use crate::rate_limit::RateLimiter;
use crate::request::RestRequest;
use crate::response::RestResponse;

/// Status codes retried inside a single execute call.
const TRANSIENT_STATUS: [u16; 3] = [502, 504, 529];

/// Total send attempts per execute call (first try included).
const MAX_ATTEMPTS: u32 = 4;

/// Base backoff between transient retries; doubled per attempt.
const RETRY_BACKOFF_MS: u64 = 500;

/// Builds and sends the concrete HTTP request for queued work.
///
/// The requester holds no mutable state beyond configuration; any number of
/// concurrent `execute` calls are fine as long as each targets a distinct
/// request.
pub struct Requester {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    user_agent: String,
    token: Option<String>,
    custom_request_builder: Option<RequestHook>,
    retry_on_timeout: bool,
    rate_limiter: OnceLock<Arc<dyn RateLimiter>>,
}

impl Requester {
    pub(crate) fn new(config: &RestConfig) -> Self {
        Self {
            http_client: config.http_client.clone(),
            base_url: config.base_url.clone(),
            user_agent: config.user_agent.clone(),
            token: config.token.clone(),
            custom_request_builder: config.custom_request_builder.clone(),
            retry_on_timeout: config.retry_on_timeout,
            rate_limiter: OnceLock::new(),
        }
    }

    /// Install the rate limiter once the runtime has built it.
    pub(crate) fn bind_rate_limiter(&self, rate_limiter: Arc<dyn RateLimiter>) {
        let _ = self.rate_limiter.set(rate_limiter);
    }

    /// The bound rate limiter; requests before binding are a wiring bug.
    fn rate_limiter(&self) -> Result<&Arc<dyn RateLimiter>, RestError> {
        self.rate_limiter.get().ok_or_else(|| {
            RestError::InvalidState("no rate limiter has been bound to this requester".into())
        })
    }

    /// Execute a request, retrying transient server errors.
    ///
    /// Returns the rate-limit delay observed, 0 when the request was
    /// actually delivered to its consumer. With `handle_rate_limit_locally`
    /// a 429 (or a pre-send delay) is delivered as a synthetic rate-limit
    /// response instead of being left for the limiter to re-dispatch.
    pub async fn execute(
        &self,
        request: &Arc<RestRequest>,
        handle_rate_limit_locally: bool,
    ) -> Result<i64, RestError> {
        let mut retried = false;

        loop {
            let route = request.route();
            let delay = self.rate_limiter()?.delay_ms(route)?;
            if delay > 0 {
                if handle_rate_limit_locally {
                    request.handle_response(RestResponse::rate_limited(delay));
                }
                return Ok(delay);
            }

            let url = format!("{}{}", self.base_url, route.compiled_path());
            let http_request = self.build_request(request, &url);

            trace!(method = %route.method(), url = %url, "executing request");

            let mut rays: Vec<String> = Vec::new();
            let mut response: Option<HttpResponse> = None;

            for attempt in 0..MAX_ATTEMPTS {
                if request.is_skipped() {
                    return Ok(0);
                }

                let result = self.http_client.send(&http_request).await;
                match result {
                    Ok(received) => {
                        if let Some(ray) = received.header("CF-RAY") {
                            if !rays.iter().any(|seen| seen == ray) {
                                rays.push(ray.to_string());
                            }
                        }
                        let status = received.status;
                        let transient = TRANSIENT_STATUS.contains(&status);
                        response = Some(received);
                        if !transient || attempt + 1 == MAX_ATTEMPTS {
                            break;
                        }
                        debug!(
                            method = %route.method(),
                            url = %url,
                            status,
                            attempt = attempt + 1,
                            "request returned transient status, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BACKOFF_MS * 2u64.pow(attempt),
                        ))
                        .await;
                    }
                    Err(TransportError::Dns(message)) => {
                        error!(error = %message, "DNS resolution failed");
                        request.handle_response(RestResponse::from_error(
                            TransportError::Dns(message),
                            rays,
                        ));
                        return Ok(0);
                    }
                    Err(transport) => {
                        if self.retry_on_timeout && !retried && transport.is_transient() {
                            retried = true;
                            response = None;
                            break;
                        }
                        error!(error = %transport, "I/O error while executing a REST request");
                        request.handle_response(RestResponse::from_error(transport, rays));
                        return Ok(0);
                    }
                }
            }

            let Some(response) = response else {
                // transient transport error, single retry from the top
                continue;
            };

            trace!(
                method = %route.method(),
                url = %url,
                status = response.status,
                "finished request"
            );

            if TRANSIENT_STATUS.contains(&response.status) {
                // exhausted all attempts against a failing server
                request.handle_response(RestResponse::from_http(response, -1, rays));
                return Ok(0);
            }

            let retry_after = self.rate_limiter()?.handle_response(route, &response)?;
            if !rays.is_empty() {
                debug!(cf_rays = ?rays, "received response with cf-rays");
            }

            if retry_after == 0 {
                request.handle_response(RestResponse::from_http(response, -1, rays));
                return Ok(0);
            }

            if handle_rate_limit_locally {
                let mut rest_response = RestResponse::from_http(response, retry_after, rays);
                let merged = merge_body_retry_after(&rest_response, retry_after);
                if merged > retry_after {
                    rest_response.set_retry_after(merged);
                }
                request.handle_response(rest_response);
                return Ok(merged);
            }

            return Ok(retry_after);
        }
    }

    fn build_request(&self, request: &Arc<RestRequest>, url: &str) -> HttpRequest {
        let route = request.route();
        let mut http_request = HttpRequest::new(route.method(), url);

        http_request.set_header("user-agent", &self.user_agent);
        http_request.set_header("accept-encoding", "gzip");
        // still sending this in case of regressions
        http_request.set_header("x-ratelimit-precision", "millisecond");

        if route.base_route().require_auth() {
            if let Some(token) = &self.token {
                http_request.set_header("authorization", token);
            }
        }

        if let Some(hook) = &self.custom_request_builder {
            hook(&mut http_request);
        }

        // Custom headers like X-Audit-Log-Reason are applied last.
        for (name, value) in request.headers() {
            http_request.add_header(name, value);
        }

        http_request.body = request
            .body()
            .cloned()
            .or_else(|| route.method().requires_body().then(RequestBody::empty));

        http_request
    }
}

impl std::fmt::Debug for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("base_url", &self.base_url)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish()
    }
}

/// A 429 body may carry a fractional-second `retry_after` of its own;
/// locally-handled rate limits use the larger of header and body values.
fn merge_body_retry_after(response: &RestResponse, header_ms: i64) -> i64 {
    if !response.is_json() {
        return header_ms;
    }
    let Ok(value) = response.json() else {
        return header_ms;
    };
    value
        .get("retry_after")
        .and_then(Value::as_f64)
        .map(|seconds| (seconds * 1000.0) as i64)
        .map_or(header_ms, |body_ms| body_ms.max(header_ms))
}
