//! Autenticación por token para la API de control.
//!
//! La API completa exige el token del proxy; las rutas de streaming en vivo
//! aceptan además `?token=` para reproductores que no mandan headers.

use crate::AppState;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

/// Comprueba el encabezado `Authorization`: "Bearer <token>" o el token crudo.
pub async fn check_auth(headers: &HeaderMap, token: &str) -> Result<(), StatusCode> {
    let auth_header = match headers.get(header::AUTHORIZATION) {
        Some(value) => value.to_str().unwrap_or("").trim(),
        None => {
            log::warn!("🚫 Falta encabezado Authorization");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let expected_bearer = format!("Bearer {}", token);
    if auth_header != expected_bearer && auth_header != token {
        log::warn!("🚫 Authorization inválido");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

/// Middleware global para exigir Authorization en todas las rutas.
/// Permite OPTIONS (preflight CORS) sin autenticación.
pub async fn require_auth_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let path = req.uri().path().to_string();

    // En rutas de streaming se acepta token por query (?token=...)
    if path.starts_with("/api/live/") {
        if let Some(q) = req.uri().query() {
            let token_ok = q.split('&').any(|pair| {
                pair.strip_prefix("token=")
                    .map(|v| v == state.config.proxy_token)
                    .unwrap_or(false)
            });
            if token_ok {
                return next.run(req).await;
            }
        }
    }

    match check_auth(req.headers(), &state.config.proxy_token).await {
        Ok(()) => next.run(req).await,
        Err(status) => {
            log::warn!("🚫 Auth FAIL: {} {}", req.method(), path);
            Response::builder()
                .status(status)
                .body(Body::from("Unauthorized"))
                .unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn accepts_bearer_and_raw_token() {
        assert!(check_auth(&headers_with("Bearer secreto123"), "secreto123")
            .await
            .is_ok());
        assert!(check_auth(&headers_with("secreto123"), "secreto123")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_token() {
        assert!(check_auth(&HeaderMap::new(), "secreto123").await.is_err());
        assert!(check_auth(&headers_with("Bearer otro"), "secreto123")
            .await
            .is_err());
    }
}
