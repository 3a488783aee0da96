//! Client IP extraction utilities.

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{Extensions, HeaderMap, HeaderName},
};

/// Extract the client IP address.
///
/// If `ip_header` is set (running behind a reverse proxy), the first address
/// in that header is used and a missing header is an error; there is no
/// fallback to the socket address. Otherwise the `ConnectInfo` socket address
/// is used.
pub fn extract_client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    ip_header: Option<&HeaderName>,
) -> Result<String, &'static str> {
    match ip_header {
        Some(name) => {
            let value = headers
                .get(name)
                .ok_or("IP header not present")?
                .to_str()
                .map_err(|_| "IP header contains invalid characters")?;
            // X-Forwarded-For style lists: the first entry is the original client
            let first = value.split(',').next().unwrap_or_default().trim();
            if first.is_empty() {
                return Err("IP header is empty");
            }
            Ok(first.to_string())
        }
        None => extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .ok_or("No client IP available"),
    }
}
