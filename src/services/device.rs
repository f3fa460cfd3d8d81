use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

use crate::db::models::DeviceMeta;

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return Some(first.to_string());
        }
    }
    header("x-real-ip")
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

pub fn device_class(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    if ua.contains("ipad") {
        "iPad"
    } else if ua.contains("iphone") {
        "iPhone"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("mobile") {
        "Mobile"
    } else {
        "PC"
    }
}

pub fn location_of(ip: Option<&str>) -> &'static str {
    let parsed = ip.and_then(|raw| raw.parse::<IpAddr>().ok());
    match parsed {
        Some(IpAddr::V4(v4)) if v4.is_loopback() || v4.is_private() => "LAN",
        Some(IpAddr::V6(v6)) if v6.is_loopback() => "LAN",
        _ => "Unknown",
    }
}

pub fn capture(headers: &HeaderMap, peer: Option<SocketAddr>) -> DeviceMeta {
    let ip = client_ip(headers, peer);
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    DeviceMeta {
        device: device_class(user_agent.as_deref().unwrap_or_default()).to_string(),
        location: location_of(ip.as_deref()).to_string(),
        ip,
        user_agent,
    }
}
