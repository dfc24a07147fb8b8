// Error taxonomy shared by the whole crate. Commands print the message of
// whatever error bubbles up and exit with the matching code, so every
// failure a user can hit maps onto one of these variants.

use thiserror::Error;

/// Failures surfaced by the skiffdata client.
///
/// The front end cares about the distinctions: an `Authentication` failure
/// means "log in again" (exit code 2), a `Transport` failure means "check
/// your connection", everything else is printed as-is and exits 3.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The secrets file exists but could not be parsed.
    #[error("malformed secrets file: {0}")]
    Parse(String),

    /// A local filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The server could not be reached at all (DNS, refused, timeout).
    #[error("unable to connect to the server, try again later")]
    Transport(#[source] reqwest::Error),

    /// The server rejected our credentials.
    #[error("{0}")]
    Authentication(String),

    /// The server processed the request and reported an application error.
    #[error("{0}")]
    Remote(String),

    /// Local configuration is missing or invalid.
    #[error("{0}")]
    Config(String),
}

impl ClientError {
    /// Process exit code for this failure: 2 asks the user to
    /// re-authenticate, 3 covers everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Authentication(_) => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
