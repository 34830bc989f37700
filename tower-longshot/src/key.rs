use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

use crate::headers::CLIENT_ID;

const ANONYMOUS: &str = "anonymous";

/// The identity a request is rate limited under.
///
/// The `X-Client-Id` header wins, then the peer IP recorded by
/// [`into_make_service_with_connect_info`](axum::Router::into_make_service_with_connect_info).
/// Requests with neither share the `"anonymous"` key.
pub fn client_key<B>(req: &Request<B>) -> String {
    if let Some(id) = req
        .headers()
        .get(CLIENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_owned();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_beats_peer_address() {
        let mut req = Request::builder()
            .header("X-Client-Id", " alice ")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        assert_eq!(client_key(&req), "alice");
    }

    #[test]
    fn falls_back_to_peer_ip_then_anonymous() {
        let mut req = Request::builder()
            .header("X-Client-Id", "   ")
            .body(())
            .unwrap();
        assert_eq!(client_key(&req), "anonymous");

        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        assert_eq!(client_key(&req), "10.0.0.1");
    }
}
