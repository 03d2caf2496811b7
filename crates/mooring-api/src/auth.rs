use std::sync::Arc;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::AppError;

pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Caller identity taken from a verified access token. The subject is the
/// sync client id.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client_id: String,
    pub session_id: Option<String>,
}

#[derive(Clone)]
pub struct JwtVerifier {
    config: Arc<AppConfig>,
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            config,
        }
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AuthenticatedClient, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = self.config.auth_clock_skew.as_secs();
        if let Some(issuer) = self.config.jwt_issuer.as_deref() {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        }

        let decoded = decode::<AccessClaims>(token, &self.key, &validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;

        if !audience_matches(decoded.claims.aud.as_ref(), &self.config.jwt_audience) {
            return Err(AppError::unauthorized("Token audience is not allowed"));
        }
        let client_id = decoded.claims.sub.trim();
        if client_id.is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        validate_temporal_claims(&decoded.claims, self.config.auth_clock_skew)?;

        Ok(AuthenticatedClient {
            client_id: client_id.to_string(),
            session_id: decoded.claims.session_id.or(decoded.claims.jti),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

/// Check the shared key that guards trusted internal endpoints
pub fn verify_internal_key(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    let presented = headers
        .get(INTERNAL_KEY_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing X-Internal-Key header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("X-Internal-Key header is not valid UTF-8"))?;

    if !constant_time_eq(presented.trim().as_bytes(), expected.as_bytes()) {
        return Err(AppError::unauthorized("Internal key is not valid"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    aud: Option<Value>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    jti: Option<String>,
    session_id: Option<String>,
}

fn validate_temporal_claims(
    claims: &AccessClaims,
    clock_skew: std::time::Duration,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().timestamp();
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);

    let exp = claims
        .exp
        .ok_or_else(|| AppError::unauthorized("Token missing `exp` claim"))?;
    if exp <= now.saturating_sub(skew) {
        return Err(AppError::unauthorized("Token is expired"));
    }

    let iat = claims
        .iat
        .ok_or_else(|| AppError::unauthorized("Token missing `iat` claim"))?;
    if iat > now.saturating_add(skew) {
        return Err(AppError::unauthorized("Token `iat` is in the future"));
    }

    if let Some(nbf) = claims.nbf {
        if nbf > now.saturating_add(skew) {
            return Err(AppError::unauthorized("Token is not yet valid"));
        }
    }

    Ok(())
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    let Some(aud) = aud else {
        return false;
    };

    match aud {
        Value::String(value) => value == expected,
        Value::Array(values) => values
            .iter()
            .filter_map(Value::as_str)
            .any(|value| value == expected),
        _ => false,
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;
    use crate::config::tests::{config_with, test_config, TEST_INTERNAL_KEY, TEST_JWT_SECRET};

    /// Signed token for `client_id`, valid for five minutes
    pub fn token_for(client_id: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        sign(&json!({
            "sub": client_id,
            "aud": "authenticated",
            "iat": now,
            "exp": now + 300,
            "session_id": "session-1",
        }))
    }

    fn sign(claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(Arc::new(test_config()))
    }

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn valid_token_yields_client_identity() {
        let client = verifier().verify_access_token(&token_for("client-a")).unwrap();
        assert_eq!(client.client_id, "client-a");
        assert_eq!(client.session_id.as_deref(), Some("session-1"));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let now = chrono::Utc::now().timestamp();
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "client-a", "aud": "authenticated", "iat": now, "exp": now + 300}),
            &EncodingKey::from_secret(b"another-secret-another-secret-000"),
        )
        .unwrap();
        assert!(verifier().verify_access_token(&forged).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = chrono::Utc::now().timestamp();
        let token = sign(&json!({
            "sub": "client-a",
            "aud": "authenticated",
            "iat": now - 7_200,
            "exp": now - 3_600,
        }));
        assert!(verifier().verify_access_token(&token).is_err());
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let config = config_with(&[("MOORING_JWT_ISSUER", "https://auth.example")]).unwrap();
        let verifier = JwtVerifier::new(Arc::new(config));
        assert!(verifier.verify_access_token(&token_for("client-a")).is_err());

        let now = chrono::Utc::now().timestamp();
        let foreign = sign(&json!({
            "sub": "client-a",
            "aud": "authenticated",
            "iss": "https://other.example",
            "iat": now,
            "exp": now + 300,
        }));
        assert!(verifier.verify_access_token(&foreign).is_err());

        let token = sign(&json!({
            "sub": "client-a",
            "aud": ["anon", "authenticated"],
            "iss": "https://auth.example",
            "iat": now,
            "exp": now + 300,
        }));
        assert!(verifier.verify_access_token(&token).is_ok());
    }

    #[test]
    fn audience_matches_string_or_array() {
        assert!(audience_matches(
            Some(&Value::String("authenticated".to_string())),
            "authenticated"
        ));
        assert!(audience_matches(
            Some(&json!(["anon", "authenticated"])),
            "authenticated"
        ));
        assert!(!audience_matches(
            Some(&Value::String("anon".to_string())),
            "authenticated"
        ));
        assert!(!audience_matches(None, "authenticated"));
    }

    #[test]
    fn temporal_claims_reject_future_iat() {
        let now = chrono::Utc::now().timestamp();
        let claims = AccessClaims {
            sub: "client".to_string(),
            aud: Some(Value::String("authenticated".to_string())),
            exp: Some(now + 300),
            iat: Some(now + 120),
            nbf: None,
            jti: None,
            session_id: None,
        };
        let err =
            validate_temporal_claims(&claims, std::time::Duration::from_secs(30)).unwrap_err();
        assert!(err.to_string().contains("future"));
    }

    #[test]
    fn internal_key_must_match() {
        let mut headers = HeaderMap::new();
        assert!(verify_internal_key(&headers, TEST_INTERNAL_KEY).is_err());

        headers.insert(INTERNAL_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(verify_internal_key(&headers, TEST_INTERNAL_KEY).is_err());

        headers.insert(
            INTERNAL_KEY_HEADER,
            HeaderValue::from_static(TEST_INTERNAL_KEY),
        );
        assert!(verify_internal_key(&headers, TEST_INTERNAL_KEY).is_ok());
    }
}
