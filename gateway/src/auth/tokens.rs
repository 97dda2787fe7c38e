//! Minting and verification of the short-lived client tokens handed out by
//! `/authorize` and presented back on `/upload`.

use super::keys::SigningKeys;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const ISSUER: &str = "telemeter.selfsigned";
pub const AUDIENCE: &str = "telemeter-client";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: String,
    sub: String,
    iat: u64,
    exp: u64,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// The authenticated identity resolved from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub subject: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
#[error("token signing failed: {0}")]
pub struct SignError(String);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token issued by an unknown issuer")]
    WrongIssuer,
    #[error("token audience does not match")]
    WrongAudience,
    #[error("malformed token")]
    Malformed,
}

pub struct TokenSigner {
    algorithm: Algorithm,
    key: EncodingKey,
    lifetime: Duration,
}

impl TokenSigner {
    pub fn new(keys: &SigningKeys, lifetime: Duration) -> Self {
        TokenSigner {
            algorithm: keys.algorithm,
            key: keys.encoding.clone(),
            lifetime,
        }
    }

    /// Produces a signed claims envelope for one cluster. Tokens are opaque
    /// to clients; they echo them back verbatim.
    pub fn mint(
        &self,
        subject: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<String, SignError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            sub: subject.to_string(),
            iat: now,
            exp: now + self.lifetime.as_secs(),
            labels,
        };
        encode(&Header::new(self.algorithm), &claims, &self.key)
            .map_err(|e| SignError(e.to_string()))
    }
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(keys: &SigningKeys) -> Self {
        let mut validation = Validation::new(keys.algorithm);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        // Property: a token is valid on [iat, exp) exactly.
        validation.leeway = 0;
        TokenVerifier {
            key: keys.decoding.clone(),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<ClientIdentity, VerifyError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                ErrorKind::InvalidSignature => VerifyError::BadSignature,
                ErrorKind::InvalidIssuer => VerifyError::WrongIssuer,
                ErrorKind::InvalidAudience => VerifyError::WrongAudience,
                _ => VerifyError::Malformed,
            }
        })?;
        Ok(ClientIdentity {
            subject: data.claims.sub,
            labels: data.claims.labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> SigningKeys {
        SigningKeys::generate().expect("generate keys")
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn mint_verify_round_trip() {
        let keys = test_keys();
        let signer = TokenSigner::new(&keys, Duration::from_secs(3600));
        let verifier = TokenVerifier::new(&keys);

        let token = signer
            .mint("cluster-A", labels(&[("region", "us"), ("env", "prod")]))
            .expect("mint token");
        let identity = verifier.verify(&token).expect("verify token");
        assert_eq!(identity.subject, "cluster-A");
        assert_eq!(identity.labels, labels(&[("region", "us"), ("env", "prod")]));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keys = test_keys();
        let signer = TokenSigner::new(&keys, Duration::ZERO);
        let verifier = TokenVerifier::new(&keys);

        let token = signer.mint("cluster-A", BTreeMap::new()).expect("mint");
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(verifier.verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let signer = TokenSigner::new(&test_keys(), Duration::from_secs(3600));
        let verifier = TokenVerifier::new(&test_keys());

        let token = signer.mint("cluster-A", BTreeMap::new()).expect("mint");
        assert_eq!(verifier.verify(&token), Err(VerifyError::BadSignature));
    }

    #[test]
    fn wrong_audience_and_issuer_are_rejected() {
        let keys = test_keys();
        let verifier = TokenVerifier::new(&keys);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs();

        let mint = |iss: &str, aud: &str| {
            let claims = Claims {
                iss: iss.to_string(),
                aud: aud.to_string(),
                sub: "cluster-A".to_string(),
                iat: now,
                exp: now + 600,
                labels: BTreeMap::new(),
            };
            encode(&Header::new(keys.algorithm), &claims, &keys.encoding).expect("encode")
        };

        let token = mint(ISSUER, "someone-else");
        assert_eq!(verifier.verify(&token), Err(VerifyError::WrongAudience));

        let token = mint("someone.else", AUDIENCE);
        assert_eq!(verifier.verify(&token), Err(VerifyError::WrongIssuer));
    }

    #[test]
    fn garbage_is_malformed() {
        let verifier = TokenVerifier::new(&test_keys());
        assert_eq!(
            verifier.verify("not-a-token"),
            Err(VerifyError::Malformed)
        );
    }
}
