//! HTTP probing and response-body assessment.
//!
//! A literal 200 is not proof of health: PHP fatals, blank pages and the
//! WordPress "critical error" screen are all served with 200. Assessment
//! therefore looks at the body and may downgrade the effective status.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::errors::RemoteError;

/// Bodies shorter than this are a blank page (white screen of death).
pub const BLANK_PAGE_BYTES: usize = 100;

/// 200 responses shorter than this are most likely an error page.
pub const SUSPICIOUS_BODY_BYTES: usize = 500;

/// Substrings that mark a failure page regardless of status code, with the
/// label reported for each.
pub const FAILURE_MARKERS: &[(&str, &str)] = &[
    ("fatal error", "php_fatal"),
    ("parse error", "php_parse"),
    ("syntax error", "php_syntax"),
    ("error establishing a database connection", "db_connection"),
    ("uncaught exception", "uncaught_exception"),
    ("uncaught error", "uncaught_error"),
    ("there has been a critical error", "wp_critical_error"),
    ("briefly unavailable for scheduled maintenance", "maintenance"),
];

/// Status used when a 200 response is downgraded by its body.
pub const DOWNGRADED_STATUS: u16 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait HttpProber: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<HttpResponse, RemoteError>;
}

/// `HttpProber` backed by a shared reqwest client.
pub struct ReqwestProber {
    client: Client,
}

impl ReqwestProber {
    pub fn new() -> Result<Self, RemoteError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("wpheal/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<HttpResponse, RemoteError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Timeout {
                        secs: timeout.as_secs(),
                    }
                } else {
                    RemoteError::Http(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Http(format!("failed to read body: {}", e)))?;

        Ok(HttpResponse {
            status,
            body,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// URL probed for a site domain.
pub fn site_url(domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{}/", domain.trim_end_matches('/'))
    }
}

/// Verdict on a fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAssessment {
    /// Status as returned by the server
    pub status: u16,
    /// Status after body-based downgrading
    pub effective_status: u16,
    pub body_bytes: usize,
    pub blank_page: bool,
    pub suspicious_small: bool,
    /// Labels of every failure marker found in the body
    pub markers: Vec<String>,
    pub elapsed_ms: u64,
}

impl HttpAssessment {
    pub fn is_healthy(&self) -> bool {
        self.effective_status == 200
            && !self.blank_page
            && !self.suspicious_small
            && self.markers.is_empty()
    }

    pub fn has_markers(&self) -> bool {
        !self.markers.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.is_healthy() {
            return format!("HTTP {} in {}ms", self.status, self.elapsed_ms);
        }
        let mut reasons = Vec::new();
        if self.status != 200 {
            reasons.push(format!("status {}", self.status));
        }
        if self.blank_page {
            reasons.push(format!("blank page ({} bytes)", self.body_bytes));
        } else if self.suspicious_small {
            reasons.push(format!("suspiciously small body ({} bytes)", self.body_bytes));
        }
        if !self.markers.is_empty() {
            reasons.push(format!("failure markers: {}", self.markers.join(", ")));
        }
        reasons.join("; ")
    }
}

/// Classify a response by status and body content.
pub fn assess_response(response: &HttpResponse) -> HttpAssessment {
    let body_bytes = response.body.len();
    let lowered = response.body.to_lowercase();
    let markers: Vec<String> = FAILURE_MARKERS
        .iter()
        .filter(|(needle, _)| lowered.contains(needle))
        .map(|(_, label)| label.to_string())
        .collect();

    let blank_page = body_bytes < BLANK_PAGE_BYTES;
    let suspicious_small = response.status == 200 && body_bytes < SUSPICIOUS_BODY_BYTES;

    let effective_status = if response.status == 200 && (blank_page || suspicious_small || !markers.is_empty()) {
        DOWNGRADED_STATUS
    } else {
        response.status
    };

    HttpAssessment {
        status: response.status,
        effective_status,
        body_bytes,
        blank_page,
        suspicious_small,
        markers,
        elapsed_ms: response.elapsed_ms,
    }
}
