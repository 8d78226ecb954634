#![allow(dead_code)]

pub mod key_server;
pub mod mock_idp;
pub mod site;

pub use key_server::KeyServer;
pub use mock_idp::MockIdp;
pub use site::{SessionBuilder, TestSite};

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use tower::ServiceExt;

/// Send a GET through the router, optionally with a session cookie.
pub async fn get(app: &Router, uri: &str, cookie: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().uri(uri).header(header::HOST, "docs.test");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    app.clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string()
}

/// `name=value` part of the first Set-Cookie header, ready to send back.
pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

pub fn query_param(url: &str, key: &str) -> Option<String> {
    let (_, qs) = url.split_once('?')?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(qs).ok()?;
    pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}
