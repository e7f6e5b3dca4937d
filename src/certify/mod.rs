// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::templates;
use crate::tpm::{Hierarchy, Tpm, TpmError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tss_esapi::traits::Marshall;

#[cfg(feature = "attester")]
use crate::challenge::ImportBlob;
#[cfg(feature = "attester")]
use crate::templates::{AkAlgorithm, UnsupportedAlgorithm};
#[cfg(feature = "attester")]
use crate::tpm::{Authorization, TransientObjects};
#[cfg(feature = "attester")]
use log::{debug, info};
#[cfg(feature = "attester")]
use tss_esapi::structures::Public;
#[cfg(feature = "attester")]
use tss_esapi::traits::UnMarshall;

#[cfg(feature = "verifier")]
mod verify;

#[cfg(feature = "verifier")]
pub use verify::{verify_certified_ak_blob, VerifyError};

/// An AK certified by the restricted HMAC key of a challenge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CertifiedBlob {
    /// Marshalled TPMT_PUBLIC of the AK
    pub ak_pub: Vec<u8>,
    /// Marshalled TPMS_ATTEST
    pub certify_info: Vec<u8>,
    /// Marshalled TPMT_SIGNATURE, an HMAC over the digest of `certify_info`
    pub raw_sig: Vec<u8>,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CertifyError {
    #[cfg(feature = "attester")]
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm(#[from] UnsupportedAlgorithm),
    #[error("failed to create {0}")]
    KeyCreation(&'static str, #[source] TpmError),
    #[error("failed to import blob")]
    Import(#[source] TpmError),
    #[error("failed to load HMAC key")]
    Load(#[source] TpmError),
    #[error("failed to certify AK")]
    Certify(#[source] TpmError),
    #[error("tpm error")]
    Tpm(#[from] TpmError),
    #[error("tss error")]
    Tss(#[from] tss_esapi::Error),
}

/// Recreates the RSA EK and returns its marshalled public area.
pub fn ek_pub<T: Tpm + ?Sized>(tpm: &mut T) -> Result<Vec<u8>, CertifyError> {
    let ek = tpm
        .create_primary(Hierarchy::Endorsement, &templates::rsa_ek_template()?)
        .map_err(|e| CertifyError::KeyCreation("RSA EK", e))?;
    tpm.flush(ek.handle)?;
    Ok(ek.public.marshall()?)
}

/// Solves a challenge: imports the wrapped HMAC key under the RSA EK, creates a fresh AK of
/// `algorithm` in the owner hierarchy and certifies it with the HMAC key.
///
/// Every transient object created here is flushed before returning, on success or failure.
#[cfg(feature = "attester")]
pub fn create_certified_ak_blob<T: Tpm + ?Sized>(
    tpm: &mut T,
    blob: &ImportBlob,
    algorithm: AkAlgorithm,
) -> Result<CertifiedBlob, CertifyError> {
    let hmac_public = Public::unmarshall(&blob.public_area)
        .map_err(|e| CertifyError::Import(TpmError::Tss(e)))?;
    let ek_template = templates::rsa_ek_template()?;
    let ak_template = algorithm.template()?;
    let mut objects = TransientObjects::new(tpm);

    // the SVSM vTPM only exposes an RSA EK
    let ek = objects
        .create_primary(Hierarchy::Endorsement, &ek_template)
        .map_err(|e| CertifyError::KeyCreation("RSA EK", e))?;
    debug!("recreated RSA EK {}", ek.handle);

    let ek_auth = Authorization::PolicySecret(Hierarchy::Endorsement);
    let private = objects
        .tpm()
        .import(
            ek.handle,
            ek_auth,
            &hmac_public,
            &blob.duplicate,
            &blob.encrypted_seed,
        )
        .map_err(CertifyError::Import)?;
    let hmac_key = objects
        .load(ek.handle, ek_auth, &hmac_public, &private)
        .map_err(CertifyError::Load)?;
    debug!("loaded restricted HMAC key {}", hmac_key.handle);

    objects.flush(ek.handle)?;

    let ak = objects
        .create_primary(Hierarchy::Owner, &ak_template)
        .map_err(|e| CertifyError::KeyCreation("AK", e))?;
    debug!("created {algorithm:?} AK {}", ak.handle);

    let certification = objects
        .tpm()
        .certify(ak.handle, hmac_key.handle, &[])
        .map_err(CertifyError::Certify)?;
    info!("certified {algorithm:?} AK with restricted HMAC key");

    Ok(CertifiedBlob {
        ak_pub: ak.public.marshall()?,
        certify_info: certification.attest.marshall()?,
        raw_sig: certification.signature.marshall()?,
    })
}

/// [`create_certified_ak_blob`] with the AK algorithm given as a TPM_ALG_ID.
#[cfg(feature = "attester")]
pub fn create_certified_ak_blob_with_alg_id<T: Tpm + ?Sized>(
    tpm: &mut T,
    blob: &ImportBlob,
    alg_id: crate::tpm2::AlgId,
) -> Result<CertifiedBlob, CertifyError> {
    let algorithm = AkAlgorithm::try_from(alg_id)?;
    create_certified_ak_blob(tpm, blob, algorithm)
}
