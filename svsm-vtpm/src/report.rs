// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[cfg(feature = "verifier")]
use super::certs::Vcek;
#[cfg(feature = "verifier")]
use openssl::{ecdsa::EcdsaSig, sha::Sha384};
#[cfg(feature = "verifier")]
use sev::certs::snp::ecdsa::Signature;
pub use sev::firmware::guest::AttestationReport;
use thiserror::Error;

/// Size of a raw SNP attestation report
pub const REPORT_SIZE: usize = 0x4a0;
/// The signature covers the report up to this offset
pub const SIGNED_SIZE: usize = 0x2a0;

#[derive(Error, Debug)]
pub enum ValidateError {
    #[cfg(feature = "verifier")]
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("report signature is not valid")]
    ReportSignature,
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("bincode error")]
    Bincode(#[from] Box<bincode::ErrorKind>),
}

#[cfg(feature = "verifier")]
pub trait Validateable {
    fn validate(&self, vcek: &Vcek) -> Result<(), ValidateError>;
}

#[cfg(feature = "verifier")]
impl Validateable for AttestationReport {
    fn validate(&self, vcek: &Vcek) -> Result<(), ValidateError> {
        let report_sig: EcdsaSig = (&self.signature).try_into()?;
        let vcek_pubkey = vcek.0.public_key()?.ec_key()?;

        let mut hasher = Sha384::new();
        let base_message = get_report_base(self)?;
        hasher.update(&base_message);
        let base_message_digest = hasher.finish();

        if !report_sig.verify(&base_message_digest, &vcek_pubkey)? {
            return Err(ValidateError::ReportSignature);
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("deserialization error")]
    Parse(#[from] Box<bincode::ErrorKind>),
    #[error("wrong report size (expected {0}, found {1})")]
    Size(usize, usize),
}

pub fn parse(bytes: &[u8]) -> Result<AttestationReport, ReportError> {
    if bytes.len() != REPORT_SIZE {
        return Err(ReportError::Size(REPORT_SIZE, bytes.len()));
    }
    let snp_report = bincode::deserialize::<AttestationReport>(bytes)?;
    Ok(snp_report)
}

#[cfg(feature = "verifier")]
fn get_report_base(report: &AttestationReport) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
    let report_len = std::mem::size_of::<AttestationReport>();
    let signature_len = std::mem::size_of::<Signature>();
    let bytes = bincode::serialize(report)?;
    let report_bytes_without_sig = &bytes[0..(report_len - signature_len)];
    Ok(report_bytes_without_sig.to_vec())
}
