//! Token request construction and security service result types.

pub mod request;
pub mod response;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use request::{
    ProxyTokenRequest, SignedRequest, SigningConfig, TokenRequest, TokenType, ValidityCaveats,
    build_proxy_token_request, build_token_request,
};
pub use response::{
    Expiring, ProxyTokenResponse, TokenJsonResponse, UserInfo, UserJson, has_expired,
    is_expired_at,
};

/// Width used when rendering millisecond timestamps.
pub const TIME_STR_WIDTH: usize = 21;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn current_time_millis() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Render a millisecond timestamp zero-padded to [`TIME_STR_WIDTH`].
#[must_use]
pub fn format_time_millis(millis: i64) -> String {
    format!("{millis:0width$}", width = TIME_STR_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_pads_to_width() {
        assert_eq!(format_time_millis(42), "000000000000000000042");
        assert_eq!(format_time_millis(42).len(), TIME_STR_WIDTH);
    }

    #[test]
    fn current_time_is_after_2020() {
        assert!(current_time_millis() > 1_577_836_800_000);
    }
}
