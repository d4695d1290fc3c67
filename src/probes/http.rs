use std::time::Duration;

use reqwest::Client;

use super::ProbeError;
use crate::plan::{HttpMethod, TestCase};

/// A fully resolved request for one probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ProbeRequest {
    /// Build the request a test case issues against `host:port`.
    ///
    /// `GET` never carries a body; every other method sends the decoded payload
    /// when one is present.
    pub fn for_test(host: &str, port: u16, test: &TestCase) -> Self {
        let body = match test.method {
            HttpMethod::Get => None,
            _ => test.body.clone(),
        };
        Self {
            method: test.method,
            url: format!("http://{}:{}{}", host, port, test.endpoint),
            headers: test.request_headers(),
            body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Anything that can issue a probe request and report the status it got back.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn issue(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError>;
}

/// reqwest-backed transport with a fixed client-side timeout.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProbeError::Client)?;
        Ok(Self { client })
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn issue(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let mut builder = self
            .client
            .request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let to_probe_error = |source: reqwest::Error| {
            if source.is_timeout() {
                ProbeError::Timeout {
                    url: request.url.clone(),
                }
            } else {
                ProbeError::Request {
                    url: request.url.clone(),
                    source,
                }
            }
        };

        let response = builder.send().await.map_err(to_probe_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(to_probe_error)?;

        Ok(ProbeResponse {
            status,
            body: body.to_vec(),
        })
    }
}
