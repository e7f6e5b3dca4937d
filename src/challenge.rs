// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The verifier's challenge: a restricted HMAC key wrapped so that only the TPM holding a
//! given EK can import it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(feature = "verifier")]
use crate::duplicate::{self, DuplicateError};
#[cfg(feature = "verifier")]
use crate::templates::{self, HMAC_KEY_NAME_ALG};
#[cfg(feature = "verifier")]
use crate::tpm2;
#[cfg(feature = "verifier")]
use log::debug;
#[cfg(feature = "verifier")]
use openssl::error::ErrorStack;
#[cfg(feature = "verifier")]
use thiserror::Error;
#[cfg(feature = "verifier")]
use tss_esapi::structures::{Auth, Digest, Public, Sensitive, SensitiveData};
#[cfg(feature = "verifier")]
use tss_esapi::traits::{Marshall, UnMarshall};

pub const SECRET_SIZE: usize = 32;

/// A restricted HMAC key prepared for TPM2_Import under an EK.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportBlob {
    /// Marshalled TPMT_PUBLIC of the HMAC key
    pub public_area: Vec<u8>,
    pub duplicate: Vec<u8>,
    pub encrypted_seed: Vec<u8>,
}

/// The HMAC key wrapped in an [`ImportBlob`]. Kept by the verifier, never sent.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; SECRET_SIZE]);

impl Secret {
    pub fn generate() -> Result<Self, openssl::error::ErrorStack> {
        let mut bytes = [0; SECRET_SIZE];
        openssl::rand::rand_bytes(&mut bytes)?;
        Ok(Secret(bytes))
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

#[cfg(feature = "verifier")]
#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("failed to create restricted HMAC key")]
    KeyCreation(#[from] DuplicateError),
}

#[cfg(feature = "verifier")]
impl From<ErrorStack> for ChallengeError {
    fn from(e: ErrorStack) -> Self {
        ChallengeError::KeyCreation(e.into())
    }
}

#[cfg(feature = "verifier")]
impl From<tss_esapi::Error> for ChallengeError {
    fn from(e: tss_esapi::Error) -> Self {
        ChallengeError::KeyCreation(e.into())
    }
}

/// Creates a fresh secret and wraps it as a restricted HMAC key for import under the EK
/// whose marshalled TPMT_PUBLIC is `ek_pub`.
///
/// Only RSA EKs are supported.
#[cfg(feature = "verifier")]
pub fn create_restricted_hmac_blob(ek_pub: &[u8]) -> Result<(ImportBlob, Secret), ChallengeError> {
    let ek = Public::unmarshall(ek_pub)?;
    let secret = Secret::generate()?;

    let mut seed_value = vec![0; tpm2::digest_size(HMAC_KEY_NAME_ALG)?];
    openssl::rand::rand_bytes(&mut seed_value)?;
    let unique = tpm2::hash(HMAC_KEY_NAME_ALG, &[seed_value.as_slice(), secret.as_ref()])?;

    let public = templates::restricted_hmac_template(unique)?;
    let sensitive = Sensitive::Bits {
        auth_value: Auth::default(),
        seed_value: Digest::try_from(seed_value)?,
        sensitive: SensitiveData::try_from(secret.as_ref().to_vec())?,
    };
    let wrapped = duplicate::wrap(&ek, &tpm2::name(&public)?, &sensitive)?;
    debug!("wrapped restricted HMAC key for EK");

    let blob = ImportBlob {
        public_area: public.marshall()?,
        duplicate: wrapped.duplicate,
        encrypted_seed: wrapped.encrypted_seed,
    };
    Ok((blob, secret))
}
