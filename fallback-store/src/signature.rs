//! Webhook signatures: `x-apollo-signature: <algorithm>=<hex hmac of body>`.
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};
use std::str::FromStr;

pub const SIGNATURE_HEADER: &str = "x-apollo-signature";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(SignatureError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: Algorithm,
    pub digest: Vec<u8>,
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s.trim().split_once('=').ok_or(SignatureError::Malformed)?;
        Ok(Signature {
            algorithm: algorithm.parse()?,
            digest: hex::decode(digest)?,
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("signature must have the form <algorithm>=<hex digest>")]
    Malformed,
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("signature does not match payload")]
    Mismatch,
}

/// Checks `provided` against the HMAC of `payload` keyed with `secret`.
/// The comparison is constant-time.
pub fn verify(algorithm: Algorithm, secret: &[u8], payload: &[u8], provided: &[u8]) -> bool {
    match algorithm {
        Algorithm::Sha256 => verify_with::<Hmac<Sha256>>(secret, payload, provided),
        Algorithm::Sha384 => verify_with::<Hmac<Sha384>>(secret, payload, provided),
        Algorithm::Sha512 => verify_with::<Hmac<Sha512>>(secret, payload, provided),
    }
}

/// Parses a signature header value and verifies it against `payload`.
pub fn verify_header(header: &str, secret: &[u8], payload: &[u8]) -> Result<(), SignatureError> {
    let signature: Signature = header.parse()?;
    if verify(signature.algorithm, secret, payload, &signature.digest) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Produces the header value a sender would attach to `payload`.
pub fn sign(algorithm: Algorithm, secret: &[u8], payload: &[u8]) -> String {
    let digest = match algorithm {
        Algorithm::Sha256 => sign_with::<Hmac<Sha256>>(secret, payload),
        Algorithm::Sha384 => sign_with::<Hmac<Sha384>>(secret, payload),
        Algorithm::Sha512 => sign_with::<Hmac<Sha512>>(secret, payload),
    };
    format!("{}={}", algorithm.as_str(), hex::encode(digest))
}

fn verify_with<M>(secret: &[u8], payload: &[u8], provided: &[u8]) -> bool
where
    M: Mac + hmac::digest::KeyInit,
{
    let Ok(mut mac) = <M as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(provided).is_ok()
}

fn sign_with<M>(secret: &[u8], payload: &[u8]) -> Vec<u8>
where
    M: Mac + hmac::digest::KeyInit,
{
    // HMAC accepts keys of any length.
    let Ok(mut mac) = <M as Mac>::new_from_slice(secret) else {
        return Vec::new();
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}
