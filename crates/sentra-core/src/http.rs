//! Outbound HTTP client construction.
//!
//! All upstream calls (token exchange, JWKS, discovery, IdP metadata) share
//! the same timeout budget: 5 seconds to connect, 10 seconds total. There is
//! no retry policy; a failed call fails the authentication attempt and the
//! caller may retry the whole login.

use std::time::Duration;

/// Connect timeout for outbound calls.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for outbound calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared outbound client.
#[must_use]
pub fn outbound_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to create HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_client_builds() {
        let _client = outbound_client();
    }

    #[test]
    fn test_timeout_budget() {
        assert_eq!(CONNECT_TIMEOUT.as_secs(), 5);
        assert_eq!(REQUEST_TIMEOUT.as_secs(), 10);
    }
}
