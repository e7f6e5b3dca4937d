// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Proves that a freshly created Attestation Key (AK) lives in the same TPM as a known
//! Endorsement Key (EK), without trusting the platform that hosts the TPM.
//!
//! The verifier wraps a *restricted HMAC key* for import under the EK ([`challenge`]). Only
//! the TPM holding the EK's private key can import it. The attester creates an AK and has the
//! TPM certify it with the imported key ([`certify`]), so the "signature" of the resulting
//! attestation structure is a keyed hash that the verifier can recompute from the secret it
//! kept.
//!
//!  #
//!  ```no_run
//!  use vtpm_certify::certify;
//!  use vtpm_certify::challenge;
//!  use vtpm_certify::templates::AkAlgorithm;
//!  use vtpm_certify::tpm::Tpm;
//!  use std::error::Error;
//!
//!  fn prove_co_residence<T: Tpm>(tpm: &mut T) -> Result<(), Box<dyn Error>> {
//!    // verifier: wrap a challenge for the EK it already knows
//!    let ek_pub = certify::ek_pub(tpm)?;
//!    let (blob, secret) = challenge::create_restricted_hmac_blob(&ek_pub)?;
//!
//!    // attester: solve it with a new ECC AK
//!    let certified = certify::create_certified_ak_blob(tpm, &blob, AkAlgorithm::Ecc)?;
//!
//!    // verifier: check the keyed hash and the certified AK name
//!    certify::verify_certified_ak_blob(&certified, secret.as_ref())?;
//!    Ok(())
//!  }
//!  ```

pub mod certify;
pub mod challenge;
pub mod duplicate;
pub mod templates;
pub mod tpm;
pub mod tpm2;
