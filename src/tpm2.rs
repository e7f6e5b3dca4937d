// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Values a TPM derives from its structures, computed outside of it: object names, qualified
//! names and the sized sensitive area of a duplicate. The structures themselves are the TSS
//! ones from [`tss_esapi::structures`].

use log::error;
use sha2::{Sha256, Sha384, Sha512};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{Name, Public, Sensitive, SensitiveBuffer};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::{TPM2_ALG_ID, TPMI_ALG_HASH};
use tss_esapi::{Error, Result, WrapperErrorKind};

pub type AlgId = TPM2_ALG_ID;

fn unsupported(alg: HashingAlgorithm) -> Error {
    error!("unsupported hash algorithm {alg:?}");
    Error::WrapperError(WrapperErrorKind::UnsupportedParam)
}

/// Size in bytes of a digest produced by `alg`.
pub fn digest_size(alg: HashingAlgorithm) -> Result<usize> {
    match alg {
        HashingAlgorithm::Sha256 => Ok(32),
        HashingAlgorithm::Sha384 => Ok(48),
        HashingAlgorithm::Sha512 => Ok(64),
        other => Err(unsupported(other)),
    }
}

/// Hash the concatenation of `parts` with `alg`.
pub fn hash(alg: HashingAlgorithm, parts: &[&[u8]]) -> Result<Vec<u8>> {
    fn run<D: sha2::Digest>(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = D::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    match alg {
        HashingAlgorithm::Sha256 => Ok(run::<Sha256>(parts)),
        HashingAlgorithm::Sha384 => Ok(run::<Sha384>(parts)),
        HashingAlgorithm::Sha512 => Ok(run::<Sha512>(parts)),
        other => Err(unsupported(other)),
    }
}

fn prefixed(alg: HashingAlgorithm, digest: Vec<u8>) -> Result<Name> {
    let mut name = TPMI_ALG_HASH::from(alg).to_be_bytes().to_vec();
    name.extend(digest);
    Name::try_from(name)
}

/// Name of an object as the TPM computes it: `nameAlg || H_nameAlg(TPMT_PUBLIC)`.
pub fn name(public: &Public) -> Result<Name> {
    let alg = public.name_hashing_algorithm();
    prefixed(alg, hash(alg, &[&public.marshall()?])?)
}

/// Qualified name of an object: `nameAlg || H_nameAlg(QN(parent) || name)`.
pub fn qualified_name(
    alg: HashingAlgorithm,
    parent_qualified_name: &[u8],
    name: &Name,
) -> Result<Name> {
    prefixed(alg, hash(alg, &[parent_qualified_name, name.value()])?)
}

/// Marshalled TPM2B_SENSITIVE.
pub fn marshall_sensitive(sensitive: &Sensitive) -> Result<Vec<u8>> {
    SensitiveBuffer::try_from(sensitive.clone())?.marshall()
}

pub fn unmarshall_sensitive(bytes: &[u8]) -> Result<Sensitive> {
    Sensitive::try_from(SensitiveBuffer::unmarshall(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{self, AkAlgorithm};
    use tss_esapi::constants::tss::TPM2_RH_OWNER;
    use tss_esapi::structures::{Auth, Digest, SensitiveData};

    #[test]
    fn names_use_the_name_algorithm() {
        let ek = templates::rsa_ek_template().unwrap();
        let name = name(&ek).unwrap();
        assert_eq!(name.value().len(), 2 + 32);
        assert_eq!(name.value()[..2], [0x00, 0x0b]);
    }

    #[test]
    fn qualified_name_differs_from_name() {
        let ak = AkAlgorithm::Rsa.template().unwrap();
        let name = name(&ak).unwrap();
        let qualified =
            qualified_name(HashingAlgorithm::Sha256, &TPM2_RH_OWNER.to_be_bytes(), &name).unwrap();
        assert_eq!(qualified.value().len(), name.value().len());
        assert_ne!(qualified, name);
    }

    #[test]
    fn sensitive_area_is_size_prefixed() {
        let sensitive = Sensitive::Bits {
            auth_value: Auth::default(),
            seed_value: Digest::try_from(vec![7; 32]).unwrap(),
            sensitive: SensitiveData::try_from(vec![42; 32]).unwrap(),
        };
        let bytes = marshall_sensitive(&sensitive).unwrap();
        assert_eq!(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])), bytes.len() - 2);
        // type, empty auth, seed, key
        assert_eq!(bytes.len(), 2 + 2 + 2 + 34 + 34);
        assert_eq!(unmarshall_sensitive(&bytes).unwrap(), sensitive);
    }

    #[test]
    fn sha1_is_not_a_name_algorithm() {
        assert!(hash(HashingAlgorithm::Sha1, &[b"data".as_slice()]).is_err());
        assert!(digest_size(HashingAlgorithm::Sha1).is_err());
    }
}
