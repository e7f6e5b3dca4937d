// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AMD certificates and the certificate table of an extended SNP report.

pub use openssl::x509::X509;
pub use sev::firmware::host::{CertTableEntry, CertType};
use thiserror::Error;
use uuid::Uuid;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub struct AmdChain {
    pub ask: X509,
    pub ark: X509,
}

#[derive(Error, Debug)]
pub enum ValidateError {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("ARK is not self-signed")]
    ArkNotSelfSigned,
    #[error("ASK is not signed by ARK")]
    AskNotSignedByArk,
    #[error("VCEK is not signed by ASK")]
    VcekNotSignedByAsk,
    #[error("ARK or ASK is not the trusted AMD certificate")]
    UntrustedChain,
}

impl AmdChain {
    pub fn validate(&self) -> Result<(), ValidateError> {
        let ark_pubkey = self.ark.public_key()?;

        let ark_signed = self.ark.verify(&ark_pubkey)?;
        if !ark_signed {
            return Err(ValidateError::ArkNotSelfSigned);
        }

        let ask_signed = self.ask.verify(&ark_pubkey)?;
        if !ask_signed {
            return Err(ValidateError::AskNotSignedByArk);
        }

        Ok(())
    }

    /// Requires ARK and ASK to be the very certificates of `trusted`.
    pub fn validate_against(&self, trusted: &AmdChain) -> Result<(), ValidateError> {
        if self.ark.to_der()? != trusted.ark.to_der()? || self.ask.to_der()? != trusted.ask.to_der()?
        {
            return Err(ValidateError::UntrustedChain);
        }
        self.validate()
    }
}

/// The chip endorsement key, a VCEK or a VLEK.
pub struct Vcek(pub X509);

impl Vcek {
    pub fn from_der(der: &[u8]) -> Result<Self, ParseError> {
        let cert = X509::from_der(der)?;
        Ok(Self(cert))
    }

    pub fn validate(&self, amd_chain: &AmdChain) -> Result<(), ValidateError> {
        let ask_pubkey = amd_chain.ask.public_key()?;
        let vcek_signed = self.0.verify(&ask_pubkey)?;
        if !vcek_signed {
            return Err(ValidateError::VcekNotSignedByAsk);
        }

        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("wrong amount of certificates (expected {0:?}, found {1:?})")]
    WrongAmount(usize, usize),
    #[error("certificate table is not terminated")]
    Unterminated,
    #[error("certificate {guid} is out of bounds (offset {offset}, length {length})")]
    OutOfBounds { guid: Uuid, offset: u32, length: u32 },
    #[error("certificate table is too large")]
    TooLarge,
    #[error("missing {0} certificate")]
    Missing(&'static str),
    #[error("invalid certificate GUID")]
    Guid(#[from] uuid::Error),
}

/// build ASK + ARK certificate chain from a multi-pem string
pub fn build_cert_chain(pem: &str) -> Result<AmdChain, ParseError> {
    let certs = X509::stack_from_pem(pem.as_bytes())?;

    if certs.len() != 2 {
        return Err(ParseError::WrongAmount(2, certs.len()));
    }

    let ask = certs[0].clone();
    let ark = certs[1].clone();

    let chain = AmdChain { ask, ark };

    Ok(chain)
}

#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, Debug)]
#[repr(C)]
struct RawEntry {
    guid: [u8; 16],
    offset: U32<LittleEndian>,
    length: U32<LittleEndian>,
}

const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

/// Certificates returned with an extended report: `{guid, offset, length}` entries terminated
/// by an all-zero entry, followed by the certificates. Offsets are relative to the start of
/// the table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertTable {
    pub entries: Vec<CertTableEntry>,
}

impl CertTable {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut entries = vec![];
        let mut position = 0;
        loop {
            let raw = bytes
                .get(position..)
                .and_then(RawEntry::read_from_prefix)
                .ok_or(ParseError::Unterminated)?;
            position += ENTRY_SIZE;

            let guid = Uuid::from_bytes(raw.guid);
            let (offset, length) = (raw.offset.get(), raw.length.get());
            if guid.is_nil() && offset == 0 && length == 0 {
                break;
            }

            let start = offset as usize;
            let data = start
                .checked_add(length as usize)
                .and_then(|end| bytes.get(start..end))
                .ok_or(ParseError::OutOfBounds {
                    guid,
                    offset,
                    length,
                })?;
            entries.push(CertTableEntry::from_guid(&guid, data.to_vec())?);
        }
        Ok(CertTable { entries })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let header_len = (self.entries.len() + 1) * ENTRY_SIZE;
        let mut header = Vec::with_capacity(header_len);
        let mut data = vec![];
        for entry in &self.entries {
            let offset = u32::try_from(header_len + data.len()).map_err(|_| ParseError::TooLarge)?;
            let length = u32::try_from(entry.data.len()).map_err(|_| ParseError::TooLarge)?;
            let guid = Uuid::try_from(entry.cert_type.clone())?;
            let raw = RawEntry {
                guid: *guid.as_bytes(),
                offset: offset.into(),
                length: length.into(),
            };
            header.extend_from_slice(raw.as_bytes());
            data.extend_from_slice(&entry.data);
        }
        header.extend_from_slice(RawEntry::new_zeroed().as_bytes());
        header.extend_from_slice(&data);
        Ok(header)
    }

    pub fn get(&self, cert_type: CertType) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.cert_type == cert_type)
            .map(|entry| entry.data())
    }

    pub fn amd_chain(&self) -> Result<AmdChain, ParseError> {
        let ask = self.get(CertType::ASK).ok_or(ParseError::Missing("ASK"))?;
        let ark = self.get(CertType::ARK).ok_or(ParseError::Missing("ARK"))?;
        Ok(AmdChain {
            ask: X509::from_der(ask)?,
            ark: X509::from_der(ark)?,
        })
    }

    /// The VCEK, or the VLEK when the platform is configured with one.
    pub fn vcek(&self) -> Result<Vcek, ParseError> {
        let der = self
            .get(CertType::VCEK)
            .or_else(|| self.get(CertType::VLEK))
            .ok_or(ParseError::Missing("VCEK"))?;
        Vcek::from_der(der)
    }
}
