use crate::handler::{full, ProxyBody};
use hyper::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

/// Challenge sent alongside 407 responses.
pub const PROXY_AUTHENTICATE_VALUE: &str = "Basic realm=\"Caddy Secure Web Proxy\"";

/// Error type for request handling, mapped onto HTTP status codes
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("proxy authentication required: {0}")]
    AuthRequired(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("unsupported HTTP version: {0:?}")]
    VersionNotSupported(http::Version),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for request handling
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// HTTP status this error is reported as
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRequired(_) => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::VersionNotSupported(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as the response sent back to the client.
    ///
    /// 407 responses carry the `Proxy-Authenticate` challenge so standard
    /// clients know to retry with credentials.
    pub fn into_response(self) -> Response<ProxyBody> {
        let status = self.status();
        let mut response = Response::new(full(self.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            response.headers_mut().insert(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static(PROXY_AUTHENTICATE_VALUE),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::BadGateway("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::VersionNotSupported(http::Version::HTTP_09).status(),
            StatusCode::HTTP_VERSION_NOT_SUPPORTED
        );
        assert_eq!(
            ProxyError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_auth_required_response_carries_challenge() {
        let resp = ProxyError::AuthRequired("missing header".into()).into_response();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        let challenge = resp
            .headers()
            .get(PROXY_AUTHENTICATE)
            .expect("challenge header");
        assert_eq!(challenge.to_str().unwrap(), PROXY_AUTHENTICATE_VALUE);
    }

    #[test]
    fn test_other_responses_have_no_challenge() {
        let resp = ProxyError::Forbidden("port 25 is not allowed".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(resp.headers().get(PROXY_AUTHENTICATE).is_none());
    }
}
