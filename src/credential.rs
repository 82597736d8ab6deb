//! Signed access credentials.
//!
//! A credential is a compact HS256 JWT whose claims bind the verified payment (request id,
//! transaction hash, and what was paid where) to a request allotment and an expiry. The header
//! carries a `kid` so the signing secret can be rotated.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::time::Duration;

use crate::timestamp::UnixTimestamp;

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to encode credential: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
    #[error("malformed credential")]
    Malformed,
    #[error("unsupported credential algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("credential signature mismatch")]
    BadSignature,
    #[error("credential issuer mismatch")]
    WrongIssuer,
    #[error("credential expired at {0}")]
    Expired(UnixTimestamp),
}

impl From<jsonwebtoken::errors::Error> for CredentialError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        match error.kind() {
            ErrorKind::InvalidSignature => CredentialError::BadSignature,
            ErrorKind::InvalidIssuer => CredentialError::WrongIssuer,
            _ => CredentialError::Malformed,
        }
    }
}

/// What the verified payment was for. Empty values are left out of the token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentClaim {
    pub request_id: String,
    pub tx_hash: String,
    pub network: Option<String>,
    pub recipient: Option<String>,
    pub amount_wei: Option<String>,
    pub chain_id: Option<u64>,
    pub currency: Option<String>,
    pub max_requests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub tx_hash: String,
    pub max_requests: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_wei: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub iss: String,
    pub iat: UnixTimestamp,
    pub exp: UnixTimestamp,
}

/// A freshly minted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub token: String,
    pub expires_at: UnixTimestamp,
}

#[derive(Clone)]
pub struct CredentialSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    key_id: String,
    ttl: Duration,
}

impl Debug for CredentialSigner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner")
            .field("secret", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("key_id", &self.key_id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CredentialSigner {
    pub fn new(
        secret: impl AsRef<[u8]>,
        issuer: impl Into<String>,
        key_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(ALGORITHM);
        validation.set_issuer(&[&issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // Expiry is checked against the caller's clock, without leeway.
        validation.validate_exp = false;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation,
            issuer,
            key_id: key_id.into(),
            ttl,
        }
    }

    /// Mints a credential for `claim`, valid from `now` for the configured TTL.
    pub fn mint(
        &self,
        claim: &PaymentClaim,
        now: UnixTimestamp,
    ) -> Result<IssuedCredential, CredentialError> {
        let expires_at = now + self.ttl;
        let claims = CredentialClaims {
            tx_hash: claim.tx_hash.clone(),
            max_requests: claim.max_requests,
            request_id: claim.request_id.clone(),
            network: non_blank(&claim.network),
            recipient: non_blank(&claim.recipient),
            amount_wei: non_blank(&claim.amount_wei),
            chain_id: claim.chain_id.filter(|id| *id != 0),
            currency: non_blank(&claim.currency),
            iss: self.issuer.clone(),
            iat: now,
            exp: expires_at,
        };
        let mut header = Header::new(ALGORITHM);
        header.kid = (!self.key_id.is_empty()).then(|| self.key_id.clone());
        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(CredentialError::Encode)?;
        Ok(IssuedCredential { token, expires_at })
    }

    /// Checks signature, algorithm, issuer and expiry, and returns the claims.
    pub fn verify(
        &self,
        token: &str,
        now: UnixTimestamp,
    ) -> Result<CredentialClaims, CredentialError> {
        let token = token.trim();
        let header = jsonwebtoken::decode_header(token)?;
        if header.alg != ALGORITHM {
            return Err(CredentialError::UnsupportedAlgorithm(header.alg));
        }
        let claims =
            jsonwebtoken::decode::<CredentialClaims>(token, &self.decoding_key, &self.validation)?
                .claims;
        if claims.exp.has_passed(now) {
            return Err(CredentialError::Expired(claims.exp));
        }
        Ok(claims)
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: UnixTimestamp = UnixTimestamp::from_secs(1_700_000_000);

    fn signer() -> CredentialSigner {
        CredentialSigner::new("test-secret", "apix-cloud", "v1", Duration::from_secs(60))
    }

    fn claim() -> PaymentClaim {
        PaymentClaim {
            request_id: "req_1".into(),
            tx_hash: "0xabc".into(),
            network: Some("eip155:43114".into()),
            recipient: Some("0x742d35cc6634c0532925a3b844bc454e4438f44e".into()),
            amount_wei: Some("1000".into()),
            chain_id: None,
            currency: Some("  ".into()),
            max_requests: 100,
        }
    }

    #[test]
    fn test_mint_then_verify() {
        let issued = signer().mint(&claim(), NOW).unwrap();
        assert_eq!(issued.expires_at.as_secs(), NOW.as_secs() + 60);

        let claims = signer().verify(&issued.token, NOW).unwrap();
        assert_eq!(claims.tx_hash, "0xabc");
        assert_eq!(claims.request_id, "req_1");
        assert_eq!(claims.max_requests, 100);
        assert_eq!(claims.iss, "apix-cloud");
        assert_eq!(claims.iat, NOW);
        assert_eq!(claims.exp, issued.expires_at);
        assert_eq!(claims.currency, None);
    }

    #[test]
    fn test_header_carries_key_id() {
        let issued = signer().mint(&claim(), NOW).unwrap();
        let header = jsonwebtoken::decode_header(&issued.token).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.kid.as_deref(), Some("v1"));
    }

    #[test]
    fn test_verify_rejects_other_algorithms() {
        let claims = signer().verify(&signer().mint(&claim(), NOW).unwrap().token, NOW).unwrap();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            signer().verify(&token, NOW),
            Err(CredentialError::UnsupportedAlgorithm(Algorithm::HS384))
        ));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let issued = signer().mint(&claim(), NOW).unwrap();
        let mut generous = claim();
        generous.max_requests = 1_000_000;
        let other_key = CredentialSigner::new("other", "apix-cloud", "v1", Duration::from_secs(60));
        let forged_source = other_key.mint(&generous, NOW).unwrap();

        // Our header and signature around someone else's claims.
        let ours: Vec<&str> = issued.token.split('.').collect();
        let theirs: Vec<&str> = forged_source.token.split('.').collect();
        let forged = [ours[0], theirs[1], ours[2]].join(".");
        assert!(matches!(
            signer().verify(&forged, NOW),
            Err(CredentialError::BadSignature)
        ));

        assert!(matches!(
            other_key.verify(&issued.token, NOW),
            Err(CredentialError::BadSignature)
        ));
    }

    #[test]
    fn test_verify_rejects_expired_and_foreign_issuer() {
        let issued = signer().mint(&claim(), NOW).unwrap();
        assert!(matches!(
            signer().verify(&issued.token, issued.expires_at),
            Err(CredentialError::Expired(_))
        ));

        let foreign = CredentialSigner::new("test-secret", "someone-else", "v1", Duration::from_secs(60));
        assert!(matches!(
            foreign.verify(&issued.token, NOW),
            Err(CredentialError::WrongIssuer)
        ));
    }

    #[test]
    fn test_verify_rejects_malformed() {
        for token in ["", "abc", "a.b", "a.b.c.d", "!!.??.**"] {
            assert!(signer().verify(token, NOW).is_err(), "{token:?} accepted");
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", signer());
        assert!(!debug.contains("test-secret"));
    }
}
