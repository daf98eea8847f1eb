use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request values read by the trace span.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
}

/// Reuses the caller's `x-request-id` or mints one, and echoes it on the response.
pub async fn assign_request_id(mut request: Request<Body>, next: Next) -> Response {
    let (request_id, value) = match extract_request_id(request.headers()) {
        Some(existing) => existing,
        None => {
            let minted = Uuid::new_v4().to_string();
            let value = HeaderValue::from_str(&minted)
                .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
            (minted, value)
        }
    };

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });
    request
        .headers_mut()
        .insert(REQUEST_ID_HEADER, value.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}

fn extract_request_id(headers: &HeaderMap) -> Option<(String, HeaderValue)> {
    let value = headers.get(REQUEST_ID_HEADER)?;
    let id = value.to_str().ok()?.trim();
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::get};
    use axum_test::TestServer;

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(assign_request_id))
    }

    #[tokio::test]
    async fn echoes_incoming_request_id() {
        let server = TestServer::new(app()).expect("test server");
        let response = server
            .get("/")
            .add_header(REQUEST_ID_HEADER, "req-42")
            .await;
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).expect("request id"),
            "req-42"
        );
    }

    #[tokio::test]
    async fn mints_a_request_id_when_missing() {
        let server = TestServer::new(app()).expect("test server");
        let response = server.get("/").await;
        let id = response.headers().get(REQUEST_ID_HEADER).expect("request id");
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }
}
