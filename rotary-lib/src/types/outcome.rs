use http::StatusCode;

/// Result of a dispatched request as seen by the throttling engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The destination accepted the request
    Success,
    /// The destination rejected or failed the request
    Failure,
}

impl Outcome {
    /// Classify a response status.
    ///
    /// `403`, `429` and every server error count as failures since they are
    /// the usual ways a destination pushes back on an egress identity.
    /// Everything else is a success from the throttle's point of view.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => Self::Failure,
            s if s.is_server_error() => Self::Failure,
            _ => Self::Success,
        }
    }

    /// Classify the result of dispatching a request; transport errors are failures
    #[must_use]
    pub fn from_result(result: &reqwest::Result<reqwest::Response>) -> Self {
        match result {
            Ok(response) => Self::from_status(response.status()),
            Err(_) => Self::Failure,
        }
    }

    /// Returns `true` for [`Outcome::Success`]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<StatusCode> for Outcome {
    fn from(status: StatusCode) -> Self {
        Self::from_status(status)
    }
}
