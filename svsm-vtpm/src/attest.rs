// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::certs::{self, CertTable};
use crate::provider::{ProviderError, ReportProvider, ReportRequest};
use crate::report::{self, ReportError};
use crate::{SevSnpAttestation, SevSnpSvsmAttestation, LEAST_PRIVILEGED_VMPL, REPORT_DATA_SIZE};
use log::{debug, info};
use thiserror::Error;
use vtpm_certify::certify::{self, CertifyError};
use vtpm_certify::challenge::ImportBlob;
use vtpm_certify::templates::AkAlgorithm;
use vtpm_certify::tpm::Tpm;

pub struct SvsmOptions<'a> {
    pub blob: &'a ImportBlob,
    pub ak_algorithm: AkAlgorithm,
    /// Verifier nonce, exactly [`REPORT_DATA_SIZE`] bytes
    pub tee_nonce: &'a [u8],
}

#[derive(Error, Debug)]
pub enum AttestError {
    #[error("the TEE nonce is {0} bytes, SEV-SNP requires 64")]
    InvalidNonceSize(usize),
    #[error("failed to create certified AK blob")]
    Certify(#[from] CertifyError),
    #[error("failed to get SVSM vTPM report")]
    Report(#[source] ProviderError),
    #[error("failed to get platform certificates")]
    Certificates(#[source] ProviderError),
    #[error("invalid SNP report")]
    MalformedReport(#[from] ReportError),
    #[error("invalid certificate table")]
    MalformedCertificates(#[from] certs::ParseError),
    #[error("SVSM returned no service manifest")]
    MissingManifest,
    #[error("service manifest does not match EK pub")]
    ManifestMismatch,
}

/// Solves the challenge in `options.blob` and binds the certified AK to an SVSM vTPM report
/// over `options.tee_nonce`.
pub fn make_svsm_attestation<T, P>(
    tpm: &mut T,
    provider: &mut P,
    options: &SvsmOptions<'_>,
) -> Result<SevSnpSvsmAttestation, AttestError>
where
    T: Tpm + ?Sized,
    P: ReportProvider + ?Sized,
{
    if options.tee_nonce.len() != REPORT_DATA_SIZE {
        return Err(AttestError::InvalidNonceSize(options.tee_nonce.len()));
    }

    let certified_blob =
        certify::create_certified_ak_blob(tpm, options.blob, options.ak_algorithm)?;

    let response = provider
        .get_report(&ReportRequest::svsm_vtpm(options.tee_nonce))
        .map_err(AttestError::Report)?;
    let snp_report = report::parse(&response.out_blob)?;
    debug!("got SVSM vTPM report from VMPL{}", snp_report.vmpl);

    // a report for another vTPM instance would fail verification later on
    if response.manifest_blob.is_empty() {
        return Err(AttestError::MissingManifest);
    }
    let ek_pub = certify::ek_pub(tpm)?;
    if ek_pub != response.manifest_blob {
        return Err(AttestError::ManifestMismatch);
    }

    // the SVSM report comes without certificates
    let certificate_chain = provider
        .get_certificates(options.tee_nonce, LEAST_PRIVILEGED_VMPL)
        .map_err(AttestError::Certificates)?;
    let table = CertTable::parse(&certificate_chain)?;
    debug!("got {} platform certificates", table.entries.len());

    info!("created SVSM vTPM attestation");
    Ok(SevSnpSvsmAttestation {
        certified_blob,
        vtpm_service_manifest: response.manifest_blob,
        sev_snp_attestation: SevSnpAttestation {
            report: response.out_blob,
            certificate_chain,
        },
    })
}

#[cfg(all(test, feature = "verifier"))]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::{SVSM_SERVICE_GUID, SVSM_SERVICE_PROVIDER};
    use rstest::rstest;
    use vtpm_certify::challenge::create_restricted_hmac_blob;
    use vtpm_certify::tpm::soft::SoftTpm;

    fn setup() -> (SoftTpm, ImportBlob, Vec<u8>) {
        let mut tpm = SoftTpm::new();
        let ek_pub = certify::ek_pub(&mut tpm).unwrap();
        let (blob, _) = create_restricted_hmac_blob(&ek_pub).unwrap();
        (tpm, blob, ek_pub)
    }

    #[test]
    fn attestation_carries_manifest_and_certificates() {
        let (mut tpm, blob, ek_pub) = setup();
        let mut provider = FakeProvider::new(ek_pub.clone()).unwrap();
        let nonce = [0; 64];
        let options = SvsmOptions {
            blob: &blob,
            ak_algorithm: AkAlgorithm::Ecc,
            tee_nonce: &nonce,
        };

        let attestation = make_svsm_attestation(&mut tpm, &mut provider, &options).unwrap();
        assert_eq!(attestation.vtpm_service_manifest, ek_pub);
        assert_eq!(tpm.transient_objects(), 0);

        let table = CertTable::parse(&attestation.sev_snp_attestation.certificate_chain).unwrap();
        assert!(table.vcek().is_ok());

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].service_provider.as_deref(),
            Some(SVSM_SERVICE_PROVIDER)
        );
        assert_eq!(requests[0].service_guid, Some(SVSM_SERVICE_GUID));
        assert_eq!(requests[0].inblob, nonce);
        assert_eq!(requests[0].privilege_level, None);
        assert_eq!(requests[1].service_provider, None);
        assert_eq!(requests[1].privilege_level, Some(LEAST_PRIVILEGED_VMPL));
    }

    #[rstest]
    #[case(0)]
    #[case(32)]
    #[case(63)]
    #[case(65)]
    fn wrong_nonce_size_fails_before_hardware(#[case] size: usize) {
        let (mut tpm, blob, ek_pub) = setup();
        let commands = tpm.commands_executed();
        let mut provider = FakeProvider::new(ek_pub).unwrap();
        let nonce = vec![0; size];
        let options = SvsmOptions {
            blob: &blob,
            ak_algorithm: AkAlgorithm::Rsa,
            tee_nonce: &nonce,
        };

        let result = make_svsm_attestation(&mut tpm, &mut provider, &options);
        assert!(matches!(result, Err(AttestError::InvalidNonceSize(s)) if s == size));
        assert!(result.unwrap_err().to_string().contains("requires 64"));
        assert_eq!(tpm.commands_executed(), commands);
        assert!(provider.requests().is_empty());
    }

    #[test]
    fn manifest_of_another_vtpm_is_rejected() {
        let (mut tpm, blob, _) = setup();
        let other_ek = certify::ek_pub(&mut SoftTpm::new()).unwrap();
        let mut provider = FakeProvider::new(other_ek).unwrap();
        let options = SvsmOptions {
            blob: &blob,
            ak_algorithm: AkAlgorithm::Ecc,
            tee_nonce: &[0; 64],
        };

        let result = make_svsm_attestation(&mut tpm, &mut provider, &options);
        assert!(matches!(result, Err(AttestError::ManifestMismatch)));
        assert_eq!(tpm.transient_objects(), 0);
    }

    #[test]
    fn missing_manifest_is_rejected() {
        let (mut tpm, blob, _) = setup();
        let mut provider = FakeProvider::new(vec![]).unwrap();
        let options = SvsmOptions {
            blob: &blob,
            ak_algorithm: AkAlgorithm::Ecc,
            tee_nonce: &[0; 64],
        };

        let result = make_svsm_attestation(&mut tpm, &mut provider, &options);
        assert!(matches!(result, Err(AttestError::MissingManifest)));
    }
}
