//! Captcha solver collaborator.
//!
//! The requester only connects to the solver at startup and hands out the
//! handle. Detecting and solving captchas is up to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
pub use crate::config::CaptchaEndpoint;

/// A captcha challenge to solve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaTask {
    /// Kind of challenge, e.g. `image` or `recaptcha_v2`
    pub kind: String,
    /// Page the challenge was served on
    pub page_url: String,
    /// Challenge payload, e.g. a site key or an encoded image
    pub payload: String,
    /// Proxy the challenge was served through, the solver may need it
    pub proxy: Option<String>,
}

/// The answer to a [`CaptchaTask`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaSolution {
    /// Token or text to submit
    pub answer: String,
}

/// Connected captcha solver
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve one challenge
    async fn solve(&self, task: CaptchaTask) -> Result<CaptchaSolution>;
}

/// Establishes the connection to a captcha solver
#[async_trait]
pub trait CaptchaConnector: Send + Sync {
    /// Connect to the solver at `endpoint`
    async fn connect(&self, endpoint: &CaptchaEndpoint) -> Result<Arc<dyn CaptchaSolver>>;
}
