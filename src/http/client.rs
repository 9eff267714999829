//! Default transport backed by `reqwest`.

use std::error::Error as _;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::route::Method;

/// [`HttpClient`] implementation using a shared [`reqwest::Client`].
///
/// The runtime assembles all headers itself, so the inner client is built
/// bare. Bring a preconfigured client with [`ReqwestHttpClient::with_client`]
/// to control pooling, proxies or TLS settings.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, body.content_type())
                .body(body.bytes().to_vec());
        }

        let response = builder.send().await.map_err(classify)?;

        let status = response.status();
        let message = status
            .canonical_reason()
            .unwrap_or("UNKNOWN")
            .to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status: status.as_u16(),
            message,
            headers,
            body,
        })
    }
}

/// Map a `reqwest` error onto the runtime's transport taxonomy.
fn classify(error: reqwest::Error) -> TransportError {
    let description = error.to_string();
    if error.is_timeout() {
        return TransportError::Timeout(description);
    }

    // reqwest folds DNS and TLS failures into connect errors; the source
    // chain tells them apart.
    let chain = {
        let mut messages = description.clone();
        let mut source = error.source();
        while let Some(inner) = source {
            messages.push_str(": ");
            messages.push_str(&inner.to_string());
            source = inner.source();
        }
        messages.to_ascii_lowercase()
    };

    if chain.contains("dns") || chain.contains("resolve") {
        TransportError::Dns(description)
    } else if chain.contains("certificate") || chain.contains("tls") || chain.contains("ssl") {
        TransportError::Tls(description)
    } else if error.is_connect() {
        TransportError::Connect(description)
    } else {
        TransportError::Io(description)
    }
}
