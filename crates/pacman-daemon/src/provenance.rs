use std::{convert::Infallible, net::SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, Extensions, HeaderMap, HeaderName},
};
use pacman_db::Provenance;

/// Request provenance captured from headers and the peer address.
///
/// Missing pieces are recorded as empty strings rather than rejecting the request.
#[derive(Debug, Clone, Default)]
pub struct ClientProvenance(pub Provenance);

#[async_trait]
impl<S> FromRequestParts<S> for ClientProvenance
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(Provenance {
            referer: header_value(&parts.headers, header::REFERER),
            user_agent: header_value(&parts.headers, header::USER_AGENT),
            hostname: hostname(&parts.headers),
            ip_addr: peer_ip(&parts.extensions),
        }))
    }
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// `Host` header without the port.
fn hostname(headers: &HeaderMap) -> String {
    let host = header_value(headers, header::HOST);
    if host.starts_with('[') {
        // bracketed IPv6 literal, e.g. `[::1]:8080`
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host,
    }
}

/// Peer address recorded by `into_make_service_with_connect_info`.
pub(crate) fn peer_ip(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}
