//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with exponential
//! backoff retries for transient transport failures. Non-2xx answers are not
//! errors at this layer: they come back as an [`ApiResponse`] with
//! `success == false` so callers decide how to retry.

use reqwest::{
    header::{HeaderMap, AUTHORIZATION},
    Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body on success.
    pub data: Option<T>,
    /// The raw body returned by the server when the status was not 2xx.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
}

/// A JSON API client bound to one base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient` with a three-retry exponential backoff policy.
    ///
    /// A missing trailing slash is added to `base_url` so relative paths are
    /// appended rather than replacing its last segment.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let url = Url::parse(&normalized)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL.
    pub fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Issues a body-less request and decodes a 2xx answer as JSON.
    ///
    /// # Errors
    /// Returns an error if URL joining, the transport or JSON decoding fails.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let full_url = self.endpoint(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
            })
        }
    }

    pub async fn get_json<T>(&self, path: &str) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.request(Method::GET, path, None).await
    }
}
