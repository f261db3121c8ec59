use thiserror::Error;

/// Failure talking to the remote source.
///
/// `Transient` failures are worth retrying later; the other variants are
/// permanent and are surfaced unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  #[error("Transient remote failure: {0}")]
  Transient(String),

  #[error("Record not found on remote: {0}")]
  NotFound(String),

  #[error("Remote rejected request: {0}")]
  Rejected(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
  pub fn is_transient(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!(
        "{}... (truncated, {} total bytes)",
        &body[..end],
        body.len()
      )
    }
  }

  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let truncated = Self::truncate_body(body);
    match status.as_u16() {
      404 => RemoteError::NotFound(truncated),
      408 | 429 => RemoteError::Transient(format!("Status {}", status)),
      500..=599 => RemoteError::Transient(format!("Status {}: {}", status, truncated)),
      _ => RemoteError::Rejected(format!("Status {}: {}", status, truncated)),
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      RemoteError::Rejected(format!("Invalid response: {}", e))
    } else if let Some(status) = e.status() {
      RemoteError::from_status(status, "")
    } else {
      // Timeouts, refused connections, resets
      RemoteError::Transient(e.to_string())
    }
  }
}
