use crate::error::CredentialError;
use std::env;
use url::Url;

/// Produces the `Authorization` header for a feed request. Signed schemes
/// get the method, url and form parameters; simpler ones may ignore them.
pub trait CredentialProvider: Send + Sync {
    fn authorization(
        &self,
        method: &str,
        url: &Url,
        params: &[(&str, &str)],
    ) -> Result<String, CredentialError>;
}

enum TokenSource {
    Env(String),
    Fixed(String),
}

/// Bearer token auth. The env-backed form reads the variable on every call so
/// a token fixed after startup is picked up on the next reconnect.
pub struct BearerToken {
    source: TokenSource,
}

impl BearerToken {
    pub fn from_env(var: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Env(var.into()),
        }
    }

    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Fixed(token.into()),
        }
    }

    fn token(&self) -> Result<String, CredentialError> {
        let (name, token) = match &self.source {
            TokenSource::Env(var) => {
                let token = env::var(var).map_err(|_| CredentialError::Missing(var.clone()))?;
                (var.as_str(), token)
            }
            TokenSource::Fixed(token) => ("fixed token", token.clone()),
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(name.to_string()));
        }
        Ok(token.to_string())
    }
}

impl CredentialProvider for BearerToken {
    fn authorization(
        &self,
        _method: &str,
        _url: &Url,
        _params: &[(&str, &str)],
    ) -> Result<String, CredentialError> {
        Ok(format!("Bearer {}", self.token()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://feed.example/filter").unwrap()
    }

    #[test]
    fn fixed_token_builds_a_bearer_header() {
        let creds = BearerToken::fixed(" abc123 ");
        let header = creds.authorization("POST", &url(), &[("track", "cats")]).unwrap();
        assert_eq!(header, "Bearer abc123");
    }

    #[test]
    fn unset_variable_is_a_credential_error() {
        let creds = BearerToken::from_env("TRUSTY_TALLY_TEST_TOKEN_THAT_IS_NEVER_SET");
        let err = creds.authorization("POST", &url(), &[]).unwrap_err();
        assert!(matches!(err, CredentialError::Missing(_)));
    }

    #[test]
    fn blank_token_is_rejected() {
        let err = BearerToken::fixed("   ").authorization("POST", &url(), &[]).unwrap_err();
        assert!(matches!(err, CredentialError::Empty(_)));
    }
}
