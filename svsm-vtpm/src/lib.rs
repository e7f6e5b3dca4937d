// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  Binds a vTPM attestation key to an SEV-SNP report issued on behalf of an SVSM (Secure VM
//!  Service Module) running at VMPL0.
//!
//!  The attester solves the EK challenge of [`vtpm_certify`], then asks the SVSM vTPM service
//!  for a report over the verifier's nonce. The SVSM sets `report_data` to
//!  `SHA512(nonce || manifest)`, where the manifest of the vTPM service is the public area of
//!  its EK. The verifier checks the certified AK, the report binding and the privilege level,
//!  and optionally the AMD certificate chain and report signature.
//!
//!  #
//!  ```no_run
//!  use svsm_vtpm::attest::{make_svsm_attestation, SvsmOptions};
//!  use svsm_vtpm::provider::configfs::ConfigfsProvider;
//!  use svsm_vtpm::verify::{verify_svsm_attestation, SnpVerifyOptions, VerifySvsmOptions};
//!  use vtpm_certify::{certify, challenge};
//!  use vtpm_certify::templates::AkAlgorithm;
//!  use vtpm_certify::tpm::Tpm;
//!  use std::error::Error;
//!
//!  fn attest<T: Tpm>(tpm: &mut T) -> Result<(), Box<dyn Error>> {
//!    let ek_pub = certify::ek_pub(tpm)?;
//!    let (blob, secret) = challenge::create_restricted_hmac_blob(&ek_pub)?;
//!    let nonce = [0x5a; 64];
//!
//!    let mut provider = ConfigfsProvider::new()?;
//!    let options = SvsmOptions { blob: &blob, ak_algorithm: AkAlgorithm::Ecc, tee_nonce: &nonce };
//!    let attestation = make_svsm_attestation(tpm, &mut provider, &options)?;
//!
//!    let snp = SnpVerifyOptions::default();
//!    verify_svsm_attestation(&VerifySvsmOptions {
//!      attestation: &attestation,
//!      tee_nonce: &nonce,
//!      secret: secret.as_ref(),
//!      snp: Some(&snp),
//!    })?;
//!    Ok(())
//!  }
//!  ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::{uuid, Uuid};
use vtpm_certify::certify::CertifiedBlob;

pub use vtpm_certify;

pub const REPORT_DATA_SIZE: usize = 64;

/// Service provider of the SVSM vTPM in configfs-tsm
pub const SVSM_SERVICE_PROVIDER: &str = "svsm";
pub const SVSM_SERVICE_GUID: Uuid = uuid!("c476f1eb-0123-45a5-9641-b4e7dde5bfe3");

/// The SVSM runs at VMPL0
pub const SVSM_VMPL: u32 = 0;
/// Privilege level used to fetch the platform certificates
pub const LEAST_PRIVILEGED_VMPL: u32 = 3;

/// Report data of an SVSM vTPM report requested with `nonce`.
pub fn svsm_report_data(nonce: &[u8], manifest: &[u8]) -> [u8; REPORT_DATA_SIZE] {
    let digest = Sha512::new()
        .chain_update(nonce)
        .chain_update(manifest)
        .finalize();
    let mut report_data = [0; REPORT_DATA_SIZE];
    report_data.copy_from_slice(&digest);
    report_data
}

/// A raw SEV-SNP report with the certificate table returned next to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SevSnpAttestation {
    pub report: Vec<u8>,
    pub certificate_chain: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SevSnpSvsmAttestation {
    pub certified_blob: CertifiedBlob,
    /// Service manifest of the SVSM vTPM, the marshalled public area of its EK
    pub vtpm_service_manifest: Vec<u8>,
    pub sev_snp_attestation: SevSnpAttestation,
}

#[cfg(feature = "attester")]
pub mod attest;
pub mod certs;
pub mod provider;
pub mod report;
#[cfg(feature = "verifier")]
pub mod verify;
