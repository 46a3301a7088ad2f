use std::sync::Arc;

use axum::{
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
    body::Body,
};

use shared_models::error::AppError;
use shared_config::AppConfig;

use crate::jwt::validate_token;

/// Validates the bearer token and stores the resulting `User` in request extensions.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&request)?;

    let user = validate_token(token, &config.supabase_jwt_secret)
        .map_err(AppError::Auth)?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

fn bearer_token<B>(request: &Request<B>) -> Result<&str, AppError> {
    let Some(header) = request.headers().get("Authorization") else {
        // Browsers cannot set headers on WebSocket upgrades
        return query_token(request)
            .ok_or_else(|| AppError::Auth("Missing authorization header".to_string()));
    };

    let auth_value = header
        .to_str()
        .map_err(|_| AppError::Auth("Invalid authorization header format".to_string()))?;

    auth_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Auth("Invalid authorization header format".to_string()))
}

fn query_token<B>(request: &Request<B>) -> Option<&str> {
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("access_token="))
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_bearer_token_from_header() {
        let request = Request::builder()
            .uri("/chat/conversations")
            .header("Authorization", "Bearer abc.def.ghi")
            .body(())
            .unwrap();

        assert_eq!(bearer_token(&request).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_bearer_token_rejects_other_schemes() {
        let request = Request::builder()
            .uri("/chat/conversations")
            .header("Authorization", "Basic abc")
            .body(())
            .unwrap();

        assert_matches!(bearer_token(&request), Err(AppError::Auth(_)));
    }

    #[test]
    fn test_bearer_token_from_query_for_websockets() {
        let request = Request::builder()
            .uri("/chat/conversations/d1/live?foo=1&access_token=tok")
            .body(())
            .unwrap();

        assert_eq!(bearer_token(&request).unwrap(), "tok");
    }

    #[test]
    fn test_missing_token() {
        let request = Request::builder()
            .uri("/chat/conversations")
            .body(())
            .unwrap();

        assert_matches!(bearer_token(&request), Err(AppError::Auth(msg)) if msg.contains("Missing"));
    }
}
