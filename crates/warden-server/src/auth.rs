//! Request authentication. The provider is picked once at startup from
//! configuration; every variant resolves a request to a team id.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use crate::{
    cache::TokenCache,
    config::{AuthProviderKind, Config},
    error::{Error, Result},
};

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub team_id: String,
}

pub enum Authenticator {
    /// Single-team deployments; every request maps to the same team.
    Local { team_id: String },
    /// HS256 bearer tokens carrying a `team_id` claim.
    Jwt {
        decoding: DecodingKey,
        validation: Validation,
    },
    /// Bearer tokens resolved against the platform user-info endpoint,
    /// with the redis token cache in front.
    Platform {
        url: String,
        client: reqwest::Client,
    },
}

impl Authenticator {
    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        match config.auth_provider {
            AuthProviderKind::Local => Ok(Self::Local {
                team_id: config
                    .auth_provider_args
                    .get("team_id")
                    .cloned()
                    .unwrap_or_else(|| "local".to_owned()),
            }),
            AuthProviderKind::Jwt => {
                let secret = config
                    .auth_provider_args
                    .get("secret")
                    .ok_or_else(|| eyre::eyre!("jwt auth provider requires a \"secret\" argument"))?;
                let mut validation = Validation::new(Algorithm::HS256);
                // Platform-issued tokens are long-lived and not all of them
                // carry an `exp` claim.
                validation.required_spec_claims.clear();
                validation.validate_exp = false;
                Ok(Self::Jwt {
                    decoding: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                })
            }
            AuthProviderKind::Platform => {
                let url = config.auth_provider_args.get("platform_url").ok_or_else(|| {
                    eyre::eyre!("platform auth provider requires a \"platform_url\" argument")
                })?;
                Ok(Self::Platform {
                    url: url.trim_end_matches('/').to_owned(),
                    client: reqwest::Client::new(),
                })
            }
        }
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        tokens: &TokenCache,
    ) -> Result<AuthSession> {
        match self {
            Self::Local { team_id } => Ok(AuthSession {
                team_id: team_id.clone(),
            }),
            Self::Jwt {
                decoding,
                validation,
            } => {
                let token = extract_bearer(headers).ok_or(Error::MissingToken)?;
                let team_id = verify_jwt(token, decoding, validation)?;
                Ok(AuthSession { team_id })
            }
            Self::Platform { url, client } => {
                let token = extract_bearer(headers).ok_or(Error::MissingToken)?;
                if let Some(team_id) = tokens.get(token).await? {
                    return Ok(AuthSession { team_id });
                }

                let response = client
                    .get(format!("{url}/api/v1/users/me"))
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(Error::InvalidToken);
                }

                let body: Value = response.json().await?;
                let kind = body.get("kind").and_then(Value::as_str).unwrap_or_default();
                if kind != "goodUserData" && kind != "goodUserSelfData" {
                    return Err(Error::InvalidToken);
                }
                let team_id = claim_string(body.pointer("/data/id")).ok_or(Error::InvalidToken)?;

                tokens.put(token, &team_id).await?;
                Ok(AuthSession { team_id })
            }
        }
    }
}

fn verify_jwt(token: &str, decoding: &DecodingKey, validation: &Validation) -> Result<String> {
    let data = jsonwebtoken::decode::<Value>(token, decoding, validation)
        .map_err(|_| Error::InvalidToken)?;
    claim_string(data.claims.get("team_id")).ok_or(Error::InvalidToken)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let parts: Vec<&str> = value.split(' ').collect();
    if parts.len() != 2 || !parts[0].eq_ignore_ascii_case("bearer") || parts[1].is_empty() {
        return None;
    }
    Some(parts[1])
}

// Team ids show up as strings or raw numbers depending on the platform.
fn claim_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(
            extract_bearer(&headers_with_auth("Bearer abc123")),
            Some("abc123")
        );
        assert_eq!(
            extract_bearer(&headers_with_auth("bearer abc123")),
            Some("abc123")
        );
    }

    #[test]
    fn rejects_malformed_authorization_headers() {
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
        assert_eq!(extract_bearer(&headers_with_auth("abc123")), None);
        assert_eq!(extract_bearer(&headers_with_auth("Basic abc123")), None);
        assert_eq!(extract_bearer(&headers_with_auth("Bearer a b")), None);
    }

    fn hs256_validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation
    }

    #[test]
    fn verifies_team_id_claims() {
        let secret = b"hunter2";
        let token = encode(
            &Header::default(),
            &json!({"team_id": "team-a"}),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let team_id = verify_jwt(
            &token,
            &DecodingKey::from_secret(secret),
            &hs256_validation(),
        )
        .unwrap();
        assert_eq!(team_id, "team-a");
    }

    #[test]
    fn accepts_numeric_team_id_claims() {
        let secret = b"hunter2";
        let token = encode(
            &Header::default(),
            &json!({"team_id": 42}),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let team_id = verify_jwt(
            &token,
            &DecodingKey::from_secret(secret),
            &hs256_validation(),
        )
        .unwrap();
        assert_eq!(team_id, "42");
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let token = encode(
            &Header::default(),
            &json!({"team_id": "team-a"}),
            &EncodingKey::from_secret(b"other"),
        )
        .unwrap();

        let result = verify_jwt(
            &token,
            &DecodingKey::from_secret(b"hunter2"),
            &hs256_validation(),
        );
        assert!(matches!(result, Err(Error::InvalidToken)));
    }

    #[test]
    fn rejects_tokens_without_team_id() {
        let secret = b"hunter2";
        let token = encode(
            &Header::default(),
            &json!({"sub": "someone"}),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let result = verify_jwt(
            &token,
            &DecodingKey::from_secret(secret),
            &hs256_validation(),
        );
        assert!(matches!(result, Err(Error::InvalidToken)));
    }
}
