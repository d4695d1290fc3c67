//! Load-test plans -- the parsed, immutable description of one run.
//!
//! A plan document is YAML (or JSON, which YAML accepts) with the shape:
//!
//! ```yaml
//! apiVersion: v1
//! kind: StressTest
//! spec:
//!   selector: { name: candidate-service }
//!   numRequests: 100
//!   restDuration: 250
//!   serverPort: 8080
//!   tests:
//!     - id: 1
//!       name: list-users
//!       type: GET
//!       endpoint: /users
//!       validResponseCodes: [200]
//!   executionOrder: [1]
//! ```
//!
//! `body` and every `auth` value arrive base64 encoded and are decoded once,
//! here, so the engine only ever sees raw bytes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Port used when a plan leaves `serverPort` unset or zero.
pub const DEFAULT_SERVER_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("malformed plan document: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("plan selector has no `name` entry")]
    MissingSelectorName,

    #[error("unsupported server type `{0}` (only `http` is supported)")]
    UnsupportedServerType(String),

    #[error("test `{name}` has id 0; test ids start at 1")]
    ZeroTestId { name: String },

    #[error("duplicate test id {0}")]
    DuplicateTestId(u16),

    #[error("test {test_id}: `{field}` is not valid base64: {source}")]
    InvalidEncoding {
        test_id: u16,
        field: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("test {test_id}: decoded `{field}` is not valid UTF-8")]
    InvalidUtf8 { test_id: u16, field: String },
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// Opaque identifier of one run. Generated at construction, never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// HTTP method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
    Put,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Put => write!(f, "PUT"),
        }
    }
}

// ---------------------------------------------------------------------------
// TestCase / TestPlan
// ---------------------------------------------------------------------------

/// One named HTTP probe definition within a plan.
#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: u16,
    pub name: String,
    pub method: HttpMethod,
    pub endpoint: String,
    /// Decoded request payload. Never sent with `GET`.
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    pub valid_response_codes: BTreeSet<u16>,
    /// Decoded authorization headers.
    #[serde(skip)]
    pub authorization: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl TestCase {
    pub fn accepts(&self, status: u16) -> bool {
        self.valid_response_codes.contains(&status)
    }

    /// Request headers with the authorization entries merged over the plain ones.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(k, _)| !self.authorization.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merged.extend(
            self.authorization
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }
}

/// Parsed representation of one load-test request.
#[derive(Debug, Clone, Serialize)]
pub struct TestPlan {
    pub id: RunId,
    pub api_version: String,
    pub kind: String,
    pub selector: HashMap<String, String>,
    pub num_requests: u32,
    /// Requested concurrency. Informational: the engine's own bound applies.
    pub num_concurrent: u32,
    pub server_port: u16,
    pub rest_duration_ms: u64,
    pub tests: Vec<TestCase>,
    pub execution_order: Vec<u16>,
}

impl TestPlan {
    /// Parse a plan document and assign it a fresh run id.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PlanError> {
        let doc: PlanDocument = serde_yaml::from_slice(bytes)?;
        let spec = doc.spec;

        if !spec
            .selector
            .get("name")
            .is_some_and(|name| !name.trim().is_empty())
        {
            return Err(PlanError::MissingSelectorName);
        }

        if let Some(server_type) = spec.server_type.as_deref() {
            if !server_type.eq_ignore_ascii_case("http") {
                return Err(PlanError::UnsupportedServerType(server_type.to_string()));
            }
        }

        let mut seen = HashSet::new();
        let mut tests = Vec::with_capacity(spec.tests.len());
        for raw in spec.tests {
            if raw.id == 0 {
                return Err(PlanError::ZeroTestId { name: raw.name });
            }
            if !seen.insert(raw.id) {
                return Err(PlanError::DuplicateTestId(raw.id));
            }
            tests.push(raw.decode()?);
        }

        let server_port = if spec.server_port == 0 {
            DEFAULT_SERVER_PORT
        } else {
            spec.server_port
        };

        Ok(Self {
            id: RunId::generate(),
            api_version: doc.api_version,
            kind: doc.kind,
            selector: spec.selector,
            num_requests: spec.num_requests,
            num_concurrent: spec.num_concurrent,
            server_port,
            rest_duration_ms: spec.rest_duration,
            tests,
            execution_order: spec.execution_order,
        })
    }

    /// Host the run targets, resolved from `selector.name`.
    pub fn host(&self) -> &str {
        self.selector
            .get("name")
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn rest_duration(&self) -> Duration {
        Duration::from_millis(self.rest_duration_ms)
    }

    pub fn test(&self, id: u16) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.id == id)
    }
}

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDocument {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    spec: PlanSpecDocument,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanSpecDocument {
    #[serde(default)]
    selector: HashMap<String, String>,
    num_requests: u32,
    #[serde(default)]
    num_concurrent: u32,
    #[serde(default)]
    rest_duration: u64,
    #[serde(default)]
    server_type: Option<String>,
    #[serde(default)]
    server_port: u16,
    tests: Vec<TestDocument>,
    #[serde(default)]
    execution_order: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestDocument {
    id: u16,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    method: HttpMethod,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    valid_response_codes: Vec<u16>,
    #[serde(default, alias = "authorization")]
    auth: HashMap<String, String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl TestDocument {
    fn decode(self) -> Result<TestCase, PlanError> {
        let id = self.id;

        let body = match self.body.as_deref().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => Some(decode_base64(id, "body", encoded)?),
            _ => None,
        };

        let mut authorization = HashMap::with_capacity(self.auth.len());
        for (key, encoded) in self.auth {
            let field = format!("auth.{key}");
            let raw = decode_base64(id, &field, encoded.trim())?;
            let value =
                String::from_utf8(raw).map_err(|_| PlanError::InvalidUtf8 { test_id: id, field })?;
            authorization.insert(key, value);
        }

        let endpoint = if self.endpoint.starts_with('/') {
            self.endpoint
        } else {
            format!("/{}", self.endpoint)
        };

        Ok(TestCase {
            id,
            name: self.name,
            method: self.method,
            endpoint,
            body,
            valid_response_codes: self.valid_response_codes.into_iter().collect(),
            authorization,
            headers: self.headers,
        })
    }
}

fn decode_base64(test_id: u16, field: &str, encoded: &str) -> Result<Vec<u8>, PlanError> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|source| PlanError::InvalidEncoding {
            test_id,
            field: field.to_string(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
