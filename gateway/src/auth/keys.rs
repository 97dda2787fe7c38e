//! Signing key material for client tokens.
//!
//! Operators hand us a private key in whichever encoding their tooling
//! produced; parsing tries PKCS#1, then PKCS#8, then SEC1, PEM-armored or raw
//! DER. Key material is read-only after startup.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("unable to parse private key data")]
    Unparseable,

    #[error("key encoding failed: {0}")]
    Encode(String),
}

enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    Ecdsa(p256::SecretKey),
}

/// One signing keypair shared by the token signer and verifier.
pub struct SigningKeys {
    pub algorithm: Algorithm,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
}

impl SigningKeys {
    /// Parses operator-supplied key bytes.
    pub fn load(data: &[u8]) -> Result<Self, KeyError> {
        match parse_private_key(data).ok_or(KeyError::Unparseable)? {
            PrivateKey::Rsa(key) => Self::from_rsa(&key),
            PrivateKey::Ecdsa(key) => Self::from_ecdsa(&key),
        }
    }

    /// Generates an ephemeral P-256 keypair. Tokens minted against it do not
    /// survive a process restart.
    pub fn generate() -> Result<Self, KeyError> {
        let key = p256::SecretKey::random(&mut rand_core::OsRng);
        Self::from_ecdsa(&key)
    }

    fn from_rsa(key: &RsaPrivateKey) -> Result<Self, KeyError> {
        let private_der = key
            .to_pkcs1_der()
            .map_err(|e| KeyError::Encode(e.to_string()))?;
        let public_der = key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| KeyError::Encode(e.to_string()))?;

        Ok(SigningKeys {
            algorithm: Algorithm::RS256,
            encoding: EncodingKey::from_rsa_der(private_der.as_bytes()),
            decoding: DecodingKey::from_rsa_der(public_der.as_bytes()),
        })
    }

    fn from_ecdsa(key: &p256::SecretKey) -> Result<Self, KeyError> {
        let private_der = key
            .to_pkcs8_der()
            .map_err(|e| KeyError::Encode(e.to_string()))?;
        let public_point = key.public_key().to_encoded_point(false);

        Ok(SigningKeys {
            algorithm: Algorithm::ES256,
            encoding: EncodingKey::from_ec_der(private_der.as_bytes()),
            decoding: DecodingKey::from_ec_der(public_point.as_bytes()),
        })
    }
}

fn parse_private_key(data: &[u8]) -> Option<PrivateKey> {
    if let Ok(text) = std::str::from_utf8(data)
        && text.contains("-----BEGIN")
    {
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(text) {
            return Some(PrivateKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(text) {
            return Some(PrivateKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = p256::SecretKey::from_pkcs8_pem(text) {
            return Some(PrivateKey::Ecdsa(key));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_pem(text) {
            return Some(PrivateKey::Ecdsa(key));
        }
        return None;
    }

    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(data) {
        return Some(PrivateKey::Rsa(Box::new(key)));
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(data) {
        return Some(PrivateKey::Rsa(Box::new(key)));
    }
    if let Ok(key) = p256::SecretKey::from_pkcs8_der(data) {
        return Some(PrivateKey::Ecdsa(key));
    }
    if let Ok(key) = p256::SecretKey::from_sec1_der(data) {
        return Some(PrivateKey::Ecdsa(key));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs8::LineEnding;

    #[test]
    fn generates_ephemeral_ecdsa_keys() {
        let keys = SigningKeys::generate().expect("generate keys");
        assert_eq!(keys.algorithm, Algorithm::ES256);
    }

    #[test]
    fn loads_ec_keys_in_pkcs8_and_sec1_pem() {
        let secret = p256::SecretKey::random(&mut rand_core::OsRng);

        let pkcs8_pem = secret.to_pkcs8_pem(LineEnding::LF).expect("pkcs8 pem");
        let keys = SigningKeys::load(pkcs8_pem.as_bytes()).expect("load pkcs8");
        assert_eq!(keys.algorithm, Algorithm::ES256);

        let sec1_pem = secret.to_sec1_pem(LineEnding::LF).expect("sec1 pem");
        let keys = SigningKeys::load(sec1_pem.as_bytes()).expect("load sec1");
        assert_eq!(keys.algorithm, Algorithm::ES256);
    }

    #[test]
    fn loads_rsa_keys_in_pkcs1_pem_and_raw_der() {
        let secret = RsaPrivateKey::new(&mut rand_core::OsRng, 2048).expect("generate rsa");

        let pem = secret.to_pkcs1_pem(LineEnding::LF).expect("pkcs1 pem");
        let keys = SigningKeys::load(pem.as_bytes()).expect("load pkcs1 pem");
        assert_eq!(keys.algorithm, Algorithm::RS256);

        let der = secret.to_pkcs1_der().expect("pkcs1 der");
        let keys = SigningKeys::load(der.as_bytes()).expect("load pkcs1 der");
        assert_eq!(keys.algorithm, Algorithm::RS256);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            SigningKeys::load(b"not a key"),
            Err(KeyError::Unparseable)
        ));
    }
}
