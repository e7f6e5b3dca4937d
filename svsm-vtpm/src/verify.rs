// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::certs::{self, AmdChain, CertTable};
use crate::report::{self, ReportError, Validateable};
use crate::{svsm_report_data, SevSnpAttestation, SevSnpSvsmAttestation, SVSM_VMPL};
use log::{debug, info};
use openssl::memcmp;
use thiserror::Error;
use vtpm_certify::certify;

/// Checks of the SNP report beyond its binding to the vTPM.
#[derive(Default)]
pub struct SnpVerifyOptions {
    /// ARK and ASK the report's chain must be made of, any self-consistent chain when `None`
    pub trusted_chain: Option<AmdChain>,
}

pub struct VerifySvsmOptions<'a> {
    pub attestation: &'a SevSnpSvsmAttestation,
    pub tee_nonce: &'a [u8],
    pub secret: &'a [u8],
    /// Skipped when `None`, e.g. when the chain was checked by other means
    pub snp: Option<&'a SnpVerifyOptions>,
}

#[derive(Error, Debug)]
pub enum SnpVerifyError {
    #[error("invalid certificate table")]
    CertTable(#[from] certs::ParseError),
    #[error("certificate chain is not valid")]
    Chain(#[from] certs::ValidateError),
    #[error("invalid SNP report")]
    MalformedReport(#[from] ReportError),
    #[error("report is not signed by the VCEK")]
    Signature(#[from] report::ValidateError),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("challenge verification failed")]
    Challenge(#[from] certify::VerifyError),
    #[error("invalid SNP report")]
    MalformedReport(#[from] ReportError),
    #[error("report data does not match expected value")]
    ReportDataMismatch,
    #[error("attestation report was not requested from VMPL0, SVSM should be in VMPL0 (found VMPL{0})")]
    WrongPrivilegeLevel(u32),
    #[error("SNP attestation verification failed")]
    ExternalVerificationFailure(#[from] SnpVerifyError),
}

/// Verifies the certificate table and the signature of an SNP report.
pub fn verify_snp_attestation(
    attestation: &SevSnpAttestation,
    options: &SnpVerifyOptions,
) -> Result<(), SnpVerifyError> {
    let table = CertTable::parse(&attestation.certificate_chain)?;
    let chain = table.amd_chain()?;
    match &options.trusted_chain {
        Some(trusted) => chain.validate_against(trusted)?,
        None => chain.validate()?,
    }
    let vcek = table.vcek()?;
    vcek.validate(&chain)?;

    let snp_report = report::parse(&attestation.report)?;
    snp_report.validate(&vcek)?;
    debug!("SNP report signature verified");
    Ok(())
}

/// Verifies that the certified AK of `options.attestation` answers the challenge for
/// `options.secret` and lives in the vTPM of an SVSM that reported from VMPL0 over
/// `options.tee_nonce`.
pub fn verify_svsm_attestation(options: &VerifySvsmOptions<'_>) -> Result<(), VerifyError> {
    let attestation = options.attestation;
    certify::verify_certified_ak_blob(&attestation.certified_blob, options.secret)?;

    let snp_report = report::parse(&attestation.sev_snp_attestation.report)?;
    let expected = svsm_report_data(options.tee_nonce, &attestation.vtpm_service_manifest);
    if !memcmp::eq(&expected, &snp_report.report_data) {
        return Err(VerifyError::ReportDataMismatch);
    }

    if snp_report.vmpl != SVSM_VMPL {
        return Err(VerifyError::WrongPrivilegeLevel(snp_report.vmpl));
    }

    if let Some(snp) = options.snp {
        verify_snp_attestation(&attestation.sev_snp_attestation, snp)?;
    }

    info!("SVSM vTPM attestation verified");
    Ok(())
}

#[cfg(all(test, feature = "attester"))]
mod tests {
    use super::*;
    use crate::attest::{make_svsm_attestation, SvsmOptions};
    use crate::provider::fake::FakeProvider;
    use rstest::rstest;
    use vtpm_certify::challenge::{create_restricted_hmac_blob, Secret};
    use vtpm_certify::templates::AkAlgorithm;
    use vtpm_certify::tpm::soft::SoftTpm;

    const NONCE: [u8; 64] = [0; 64];

    fn attest(
        configure: impl FnOnce(FakeProvider) -> FakeProvider,
    ) -> (SevSnpSvsmAttestation, Secret, FakeProvider) {
        let mut tpm = SoftTpm::new();
        let ek_pub = certify::ek_pub(&mut tpm).unwrap();
        let (blob, secret) = create_restricted_hmac_blob(&ek_pub).unwrap();
        let mut provider = configure(FakeProvider::new(ek_pub).unwrap());
        let options = SvsmOptions {
            blob: &blob,
            ak_algorithm: AkAlgorithm::Ecc,
            tee_nonce: &NONCE,
        };
        let attestation = make_svsm_attestation(&mut tpm, &mut provider, &options).unwrap();
        (attestation, secret, provider)
    }

    fn verify(
        attestation: &SevSnpSvsmAttestation,
        secret: &Secret,
        snp: Option<&SnpVerifyOptions>,
    ) -> Result<(), VerifyError> {
        verify_svsm_attestation(&VerifySvsmOptions {
            attestation,
            tee_nonce: &NONCE,
            secret: secret.as_ref(),
            snp,
        })
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn report_must_come_from_vmpl0(#[case] vmpl: u32) {
        let (attestation, secret, _) = attest(|p| p.with_vmpl(vmpl));
        let result = verify(&attestation, &secret, None);
        if vmpl == 0 {
            result.unwrap();
        } else {
            let err = result.unwrap_err();
            assert!(matches!(err, VerifyError::WrongPrivilegeLevel(found) if found == vmpl));
            assert!(err.to_string().contains("VMPL0"));
        }
    }

    #[test]
    fn unbound_report_data_is_rejected() {
        let (attestation, secret, _) = attest(|p| p.with_report_data([0; 64]));
        let err = verify(&attestation, &secret, None).unwrap_err();
        assert!(matches!(err, VerifyError::ReportDataMismatch));
        assert_eq!(err.to_string(), "report data does not match expected value");
    }

    #[test]
    fn other_nonce_is_rejected() {
        let (attestation, secret, _) = attest(|p| p);
        let result = verify_svsm_attestation(&VerifySvsmOptions {
            attestation: &attestation,
            tee_nonce: &[1; 64],
            secret: secret.as_ref(),
            snp: None,
        });
        assert!(matches!(result, Err(VerifyError::ReportDataMismatch)));
    }

    #[test]
    fn wrong_secret_fails_challenge() {
        let (attestation, _, _) = attest(|p| p);
        let secret = Secret::from([0x42; 32]);
        let err = verify(&attestation, &secret, None).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Challenge(certify::VerifyError::InvalidHmac)
        ));
    }

    #[test]
    fn snp_chain_and_signature_are_verified() {
        let (attestation, secret, provider) = attest(|p| p);
        verify(&attestation, &secret, Some(&SnpVerifyOptions::default())).unwrap();

        let pinned = SnpVerifyOptions {
            trusted_chain: Some(provider.amd().chain()),
        };
        verify(&attestation, &secret, Some(&pinned)).unwrap();

        let other = FakeProvider::new(vec![]).unwrap();
        let untrusted = SnpVerifyOptions {
            trusted_chain: Some(other.amd().chain()),
        };
        let err = verify(&attestation, &secret, Some(&untrusted)).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::ExternalVerificationFailure(SnpVerifyError::Chain(
                certs::ValidateError::UntrustedChain
            ))
        ));
    }

    #[test]
    fn tampered_report_fails_snp_verification() {
        let (mut attestation, secret, _) = attest(|p| p);
        // measurement, neither report data nor VMPL
        attestation.sev_snp_attestation.report[0x90] ^= 0xff;
        verify(&attestation, &secret, None).unwrap();

        let err = verify(&attestation, &secret, Some(&SnpVerifyOptions::default())).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::ExternalVerificationFailure(SnpVerifyError::Signature(_))
        ));
    }

    #[test]
    fn missing_certificates_fail_snp_verification() {
        let (mut attestation, secret, _) = attest(|p| p);
        attestation.sev_snp_attestation.certificate_chain = vec![0; 24];
        let err = verify(&attestation, &secret, Some(&SnpVerifyOptions::default())).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::ExternalVerificationFailure(SnpVerifyError::CertTable(
                certs::ParseError::Missing(_)
            ))
        ));
    }
}
