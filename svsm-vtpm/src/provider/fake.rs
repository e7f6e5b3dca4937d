// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process stand-in for the SNP firmware and the SVSM.

use super::{ProviderError, ReportProvider, ReportRequest, ReportResponse};
use crate::certs::{AmdChain, CertTable, CertTableEntry, CertType, ParseError, Vcek};
use crate::report::{REPORT_SIZE, SIGNED_SIZE};
use crate::{
    svsm_report_data, REPORT_DATA_SIZE, SVSM_SERVICE_GUID, SVSM_SERVICE_PROVIDER, SVSM_VMPL,
};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use sha2::{Digest, Sha384};
use uuid::Uuid;

// offsets into the raw report
const VERSION: usize = 0x00;
const POLICY: usize = 0x08;
const VMPL: usize = 0x30;
const SIGNATURE_ALGO: usize = 0x34;
const REPORT_DATA: usize = 0x50;
const MEASUREMENT: usize = 0x90;
const SIGNATURE_R: usize = SIGNED_SIZE;
const SIGNATURE_S: usize = SIGNED_SIZE + SIGNATURE_COMPONENT_SIZE;
const SIGNATURE_COMPONENT_SIZE: usize = 72;

const ECDSA_P384_SHA384: u32 = 1;

/// A throw-away ARK, ASK and VCEK hierarchy signing synthetic reports.
pub struct FakeAmd {
    ark: X509,
    ask: X509,
    vcek: X509,
    vcek_key: PKey<Private>,
}

fn p384_key() -> Result<PKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
    PKey::from_ec_key(EcKey::generate(&group)?)
}

fn issue(
    common_name: &str,
    serial: u32,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(1)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    let signing_key = match issuer {
        Some((cert, issuer_key)) => {
            builder.set_issuer_name(cert.subject_name())?;
            issuer_key
        }
        None => {
            builder.set_issuer_name(&name)?;
            key
        }
    };
    builder.sign(signing_key, MessageDigest::sha384())?;
    Ok(builder.build())
}

/// Little endian, zero padded, as SNP stores ECDSA components.
fn signature_component(value: &openssl::bn::BigNumRef) -> [u8; SIGNATURE_COMPONENT_SIZE] {
    let mut component = [0; SIGNATURE_COMPONENT_SIZE];
    for (dst, src) in component.iter_mut().zip(value.to_vec().iter().rev()) {
        *dst = *src;
    }
    component
}

impl FakeAmd {
    pub fn new() -> Result<Self, ErrorStack> {
        let ark_key = p384_key()?;
        let ark = issue("ARK-Fake", 1, &ark_key, None)?;
        let ask_key = p384_key()?;
        let ask = issue("SEV-Fake", 2, &ask_key, Some((&ark, &ark_key)))?;
        let vcek_key = p384_key()?;
        let vcek = issue("SEV-VCEK", 3, &vcek_key, Some((&ask, &ask_key)))?;
        Ok(FakeAmd {
            ark,
            ask,
            vcek,
            vcek_key,
        })
    }

    pub fn chain(&self) -> AmdChain {
        AmdChain {
            ask: self.ask.clone(),
            ark: self.ark.clone(),
        }
    }

    pub fn vcek(&self) -> Vcek {
        Vcek(self.vcek.clone())
    }

    /// Encoded certificate table holding VCEK, ASK and ARK.
    pub fn cert_table(&self) -> Result<Vec<u8>, ParseError> {
        let entries = [
            (CertType::VCEK, &self.vcek),
            (CertType::ASK, &self.ask),
            (CertType::ARK, &self.ark),
        ]
        .into_iter()
        .map(|(cert_type, cert)| Ok(CertTableEntry::new(cert_type, cert.to_der()?)))
        .collect::<Result<_, ParseError>>()?;
        CertTable { entries }.to_bytes()
    }

    /// A raw report for `vmpl` carrying `report_data`, signed by the VCEK.
    pub fn report(
        &self,
        vmpl: u32,
        report_data: &[u8; REPORT_DATA_SIZE],
    ) -> Result<Vec<u8>, ErrorStack> {
        let mut report = vec![0; REPORT_SIZE];
        report[VERSION..VERSION + 4].copy_from_slice(&2u32.to_le_bytes());
        // SMT allowed, reserved bit 17 set
        report[POLICY..POLICY + 8].copy_from_slice(&0x3_0000u64.to_le_bytes());
        report[VMPL..VMPL + 4].copy_from_slice(&vmpl.to_le_bytes());
        report[SIGNATURE_ALGO..SIGNATURE_ALGO + 4]
            .copy_from_slice(&ECDSA_P384_SHA384.to_le_bytes());
        report[REPORT_DATA..REPORT_DATA + REPORT_DATA_SIZE].copy_from_slice(report_data);
        report[MEASUREMENT..MEASUREMENT + 48].fill(0xa5);

        let digest = Sha384::digest(&report[..SIGNED_SIZE]);
        let signature = EcdsaSig::sign(&digest, &*self.vcek_key.ec_key()?)?;
        report[SIGNATURE_R..SIGNATURE_R + SIGNATURE_COMPONENT_SIZE]
            .copy_from_slice(&signature_component(signature.r()));
        report[SIGNATURE_S..SIGNATURE_S + SIGNATURE_COMPONENT_SIZE]
            .copy_from_slice(&signature_component(signature.s()));
        Ok(report)
    }
}

/// A request as seen by [`FakeProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub service_provider: Option<String>,
    pub service_guid: Option<Uuid>,
    pub inblob: Vec<u8>,
    pub privilege_level: Option<u32>,
}

/// Serves SVSM vTPM reports with `report_data = SHA512(inblob || manifest)` and platform
/// reports carrying the certificate table of a [`FakeAmd`].
pub struct FakeProvider {
    amd: FakeAmd,
    manifest: Vec<u8>,
    vmpl: u32,
    report_data: Option<[u8; REPORT_DATA_SIZE]>,
    requests: Vec<RecordedRequest>,
}

impl FakeProvider {
    /// A provider whose SVSM vTPM reports `manifest` from VMPL0.
    pub fn new(manifest: Vec<u8>) -> Result<Self, ErrorStack> {
        Ok(FakeProvider {
            amd: FakeAmd::new()?,
            manifest,
            vmpl: SVSM_VMPL,
            report_data: None,
            requests: vec![],
        })
    }

    /// Reports SVSM vTPM reports as requested from `vmpl`.
    pub fn with_vmpl(mut self, vmpl: u32) -> Self {
        self.vmpl = vmpl;
        self
    }

    /// Replaces the report data of SVSM vTPM reports.
    pub fn with_report_data(mut self, report_data: [u8; REPORT_DATA_SIZE]) -> Self {
        self.report_data = Some(report_data);
        self
    }

    pub fn amd(&self) -> &FakeAmd {
        &self.amd
    }

    pub fn requests(&self) -> &[RecordedRequest] {
        &self.requests
    }
}

impl ReportProvider for FakeProvider {
    fn get_report(&mut self, request: &ReportRequest<'_>) -> Result<ReportResponse, ProviderError> {
        self.requests.push(RecordedRequest {
            service_provider: request.service_provider.map(str::to_string),
            service_guid: request.service_guid,
            inblob: request.inblob.to_vec(),
            privilege_level: request.privilege_level,
        });
        if request.inblob.len() > REPORT_DATA_SIZE {
            return Err(ProviderError::InblobTooLarge(request.inblob.len()));
        }

        match request.service_provider {
            None => {
                let mut report_data = [0; REPORT_DATA_SIZE];
                report_data[..request.inblob.len()].copy_from_slice(request.inblob);
                let vmpl = request.privilege_level.unwrap_or(0);
                Ok(ReportResponse {
                    out_blob: self.amd.report(vmpl, &report_data)?,
                    aux_blob: self.amd.cert_table()?,
                    manifest_blob: vec![],
                })
            }
            Some(SVSM_SERVICE_PROVIDER) if request.service_guid == Some(SVSM_SERVICE_GUID) => {
                let report_data = self
                    .report_data
                    .unwrap_or_else(|| svsm_report_data(request.inblob, &self.manifest));
                Ok(ReportResponse {
                    out_blob: self.amd.report(self.vmpl, &report_data)?,
                    aux_blob: vec![],
                    manifest_blob: self.manifest.clone(),
                })
            }
            Some(other) => Err(ProviderError::UnknownService(other.to_string())),
        }
    }
}
