use crate::config::StatusSet;
use crate::transport::Response;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied response check, run after the status check passed.
/// Validators run in declaration order; the first failure wins.
pub trait ResponseValidator: Send + Sync {
    fn check(&self, response: &Response) -> Result<(), BoxError>;
}

/// Passes 2xx responses, rejects everything else.
#[derive(Debug, Default)]
pub struct DefaultValidator;

impl ResponseValidator for DefaultValidator {
    fn check(&self, response: &Response) -> Result<(), BoxError> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(format!("expected a successful status, got {}", response.status()).into())
    }
}

/// Passes only the listed statuses.
#[derive(Debug)]
pub struct StrictStatusValidator {
    statuses: StatusSet,
}

impl StrictStatusValidator {
    pub fn new(statuses: impl Into<StatusSet>) -> Self {
        Self {
            statuses: statuses.into(),
        }
    }
}

impl ResponseValidator for StrictStatusValidator {
    fn check(&self, response: &Response) -> Result<(), BoxError> {
        if self.statuses.contains(response.status()) {
            return Ok(());
        }
        let expected = self
            .statuses
            .iter()
            .map(|status| status.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(format!("expected one of [{expected}], got {}", response.status()).into())
    }
}

/// Passes 2xx plus the listed statuses.
#[derive(Debug)]
pub struct AllowedStatusValidator {
    statuses: StatusSet,
}

impl AllowedStatusValidator {
    pub fn new(statuses: impl Into<StatusSet>) -> Self {
        Self {
            statuses: statuses.into(),
        }
    }
}

impl ResponseValidator for AllowedStatusValidator {
    fn check(&self, response: &Response) -> Result<(), BoxError> {
        if response.status().is_success() || self.statuses.contains(response.status()) {
            return Ok(());
        }
        Err(format!("status {} is neither successful nor allowed", response.status()).into())
    }
}
