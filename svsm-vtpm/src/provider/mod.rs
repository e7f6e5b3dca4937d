// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sources of SEV-SNP attestation reports.

use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub mod configfs;
#[cfg(any(test, feature = "fake"))]
pub mod fake;

/// A report request, the attributes of a configfs-tsm report entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRequest<'a> {
    /// Service that should produce the report, the platform firmware when `None`
    pub service_provider: Option<&'a str>,
    pub service_guid: Option<Uuid>,
    /// Caller data placed in, or bound into, `report_data`
    pub inblob: &'a [u8],
    /// VMPL the report is requested for, the provider's default when `None`
    pub privilege_level: Option<u32>,
}

impl<'a> ReportRequest<'a> {
    pub fn new(inblob: &'a [u8]) -> Self {
        ReportRequest {
            service_provider: None,
            service_guid: None,
            inblob,
            privilege_level: None,
        }
    }

    /// A request for the vTPM service of the SVSM.
    pub fn svsm_vtpm(inblob: &'a [u8]) -> Self {
        ReportRequest {
            service_provider: Some(crate::SVSM_SERVICE_PROVIDER),
            service_guid: Some(crate::SVSM_SERVICE_GUID),
            ..Self::new(inblob)
        }
    }

    pub fn with_privilege_level(mut self, level: u32) -> Self {
        self.privilege_level = Some(level);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportResponse {
    /// The raw attestation report
    pub out_blob: Vec<u8>,
    /// Certificate table, empty when the provider returned none
    pub aux_blob: Vec<u8>,
    /// Service manifest, empty for plain platform reports
    pub manifest_blob: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("configfs-tsm is not available at {0}")]
    Unavailable(PathBuf),
    #[error("invalid generation value")]
    Generation(#[from] ParseIntError),
    #[error("report entry changed while reading (generation {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },
    #[error("inblob is {0} bytes, at most 64 are supported")]
    InblobTooLarge(usize),
    #[error("unknown service provider {0}")]
    UnknownService(String),
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("certificate table error")]
    CertTable(#[from] crate::certs::ParseError),
}

pub trait ReportProvider {
    fn get_report(&mut self, request: &ReportRequest<'_>) -> Result<ReportResponse, ProviderError>;

    /// Fetches the platform certificate table with a report requested at `privilege_level`.
    fn get_certificates(
        &mut self,
        nonce: &[u8],
        privilege_level: u32,
    ) -> Result<Vec<u8>, ProviderError> {
        let request = ReportRequest::new(nonce).with_privilege_level(privilege_level);
        let response = self.get_report(&request)?;
        Ok(response.aux_blob)
    }
}

impl<P: ReportProvider + ?Sized> ReportProvider for &mut P {
    fn get_report(&mut self, request: &ReportRequest<'_>) -> Result<ReportResponse, ProviderError> {
        (**self).get_report(request)
    }

    fn get_certificates(
        &mut self,
        nonce: &[u8],
        privilege_level: u32,
    ) -> Result<Vec<u8>, ProviderError> {
        (**self).get_certificates(nonce, privilege_level)
    }
}
