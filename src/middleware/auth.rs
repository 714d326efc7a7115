use crate::common::response::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ADMIN_ROLE: &str = "ADMIN";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenClaims {
    pub sub: Uuid,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

/// Who is making a request. Routes behind `optional_auth` may see
/// `Anonymous`; routes behind `auth_middleware` always see `User`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    User { id: Uuid, role: String },
}

impl Caller {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Caller::Anonymous => None,
            Caller::User { id, .. } => Some(*id),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::User { role, .. } if role == ADMIN_ROLE)
    }
}

impl From<&TokenClaims> for Caller {
    fn from(claims: &TokenClaims) -> Self {
        Caller::User {
            id: claims.sub,
            role: claims.role.clone(),
        }
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// `?token=` fallback for media elements that cannot send headers.
fn query_token(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

fn verify(token: &str, secret: &str) -> Result<TokenClaims, ApiError> {
    decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| {
        ApiError(
            "Unauthorized: Invalid token signature".to_string(),
            StatusCode::UNAUTHORIZED,
        )
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req).ok_or_else(|| {
        ApiError(
            "Unauthorized: Missing or invalid token".to_string(),
            StatusCode::UNAUTHORIZED,
        )
    })?;

    let claims = verify(&token, &state.config.jwt_secret)?;

    req.extensions_mut().insert(Caller::from(&claims));
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Attaches a `Caller` without requiring a token. A token that is present but
/// invalid is still rejected.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = match bearer_token(&req).or_else(|| query_token(&req)) {
        Some(token) => {
            let claims = verify(&token, &state.config.jwt_secret)?;
            let caller = Caller::from(&claims);
            req.extensions_mut().insert(claims);
            caller
        }
        None => Caller::Anonymous,
    };
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn token_is_read_from_header_then_query() {
        let req = Request::builder()
            .uri("/stream/x.mp4?foo=1&token=abc%2Edef")
            .header(header::AUTHORIZATION, "Bearer from-header")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req).as_deref(), Some("from-header"));
        assert_eq!(query_token(&req).as_deref(), Some("abc.def"));

        let req = Request::builder()
            .uri("/stream/x.mp4")
            .header(header::AUTHORIZATION, "Basic Zm9v")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), None);
        assert_eq!(query_token(&req), None);
    }

    #[test]
    fn only_admin_role_is_privileged() {
        let admin = Caller::User {
            id: Uuid::new_v4(),
            role: ADMIN_ROLE.to_string(),
        };
        let student = Caller::User {
            id: Uuid::new_v4(),
            role: "USER".to_string(),
        };
        assert!(admin.is_admin());
        assert!(!student.is_admin());
        assert!(!Caller::Anonymous.is_admin());
        assert_eq!(Caller::Anonymous.user_id(), None);
    }
}
