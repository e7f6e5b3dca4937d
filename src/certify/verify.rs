// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::CertifiedBlob;
use crate::tpm2::{self, AlgId};
use log::debug;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tss_esapi::constants::tss::{TPM2_ALG_HMAC, TPM2_ALG_SHA256};
use tss_esapi::structures::{Attest, AttestInfo, Public};
use tss_esapi::traits::UnMarshall;

const HMAC_HASH_ALG: AlgId = TPM2_ALG_SHA256;
const HMAC_SIZE: usize = 32;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("signature is not a keyed hash")]
    MalformedSignature,
    #[error("wrong hash algorithm (expected 0x{expected:04x}, found 0x{found:04x})")]
    WrongHashAlgorithm { expected: AlgId, found: AlgId },
    #[error("invalid HMAC")]
    InvalidHmac,
    #[error("attestation statement was invalid")]
    InvalidAttestation,
    #[error("incorrect name")]
    IncorrectName,
    #[error("malformed AK public area")]
    MalformedPublic(#[source] tss_esapi::Error),
}

/// Checks that `blob` certifies its AK with the restricted HMAC key whose sensitive value is
/// `secret`.
pub fn verify_certified_ak_blob(blob: &CertifiedBlob, secret: &[u8]) -> Result<(), VerifyError> {
    // TPMT_SIGNATURE: sigAlg, hashAlg, then a digest sized by hashAlg
    let [s0, s1, h0, h1, digest @ ..] = blob.raw_sig.as_slice() else {
        return Err(VerifyError::MalformedSignature);
    };
    if u16::from_be_bytes([*s0, *s1]) != TPM2_ALG_HMAC {
        return Err(VerifyError::MalformedSignature);
    }
    let hash_alg = u16::from_be_bytes([*h0, *h1]);
    if hash_alg != HMAC_HASH_ALG {
        return Err(VerifyError::WrongHashAlgorithm {
            expected: HMAC_HASH_ALG,
            found: hash_alg,
        });
    }
    if digest.len() != HMAC_SIZE {
        return Err(VerifyError::MalformedSignature);
    }

    let key = PKey::hmac(secret).map_err(|_| VerifyError::InvalidHmac)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(&Sha256::digest(&blob.certify_info))?;
    let expected = signer.sign_to_vec()?;
    if !memcmp::eq(&expected, digest) {
        return Err(VerifyError::InvalidHmac);
    }

    let attest =
        Attest::unmarshall(&blob.certify_info).map_err(|_| VerifyError::InvalidAttestation)?;
    let AttestInfo::Certify { info } = attest.attested() else {
        return Err(VerifyError::InvalidAttestation);
    };

    let ak = Public::unmarshall(&blob.ak_pub).map_err(VerifyError::MalformedPublic)?;
    let ak_name = tpm2::name(&ak).map_err(VerifyError::MalformedPublic)?;
    if ak_name != *info.name() {
        return Err(VerifyError::IncorrectName);
    }
    if info.qualified_name() == info.name() {
        return Err(VerifyError::IncorrectName);
    }

    debug!("certified AK blob verified");
    Ok(())
}

#[cfg(all(test, feature = "attester"))]
mod tests {
    use super::*;
    use crate::certify::create_certified_ak_blob;
    use crate::certify::ek_pub;
    use crate::challenge::{create_restricted_hmac_blob, Secret};
    use crate::templates::AkAlgorithm;
    use crate::tpm::soft::{self, SoftTpm};
    use rstest::rstest;
    use tss_esapi::structures::Name;
    use tss_esapi::traits::Marshall;

    fn certified() -> (CertifiedBlob, Secret) {
        let mut tpm = SoftTpm::new();
        let (blob, secret) = create_restricted_hmac_blob(&ek_pub(&mut tpm).unwrap()).unwrap();
        let certified = create_certified_ak_blob(&mut tpm, &blob, AkAlgorithm::Ecc).unwrap();
        (certified, secret)
    }

    fn hmac_signature(hash_alg: AlgId, digest: &[u8]) -> Vec<u8> {
        let mut raw_sig = TPM2_ALG_HMAC.to_be_bytes().to_vec();
        raw_sig.extend(hash_alg.to_be_bytes());
        raw_sig.extend(digest);
        raw_sig
    }

    fn re_sign(certify_info: Vec<u8>, blob: &CertifiedBlob, secret: &Secret) -> CertifiedBlob {
        let key = PKey::hmac(secret.as_ref()).unwrap();
        let mut signer = Signer::new(MessageDigest::sha256(), &key).unwrap();
        signer.update(&Sha256::digest(&certify_info)).unwrap();
        CertifiedBlob {
            ak_pub: blob.ak_pub.clone(),
            raw_sig: hmac_signature(HMAC_HASH_ALG, &signer.sign_to_vec().unwrap()),
            certify_info,
        }
    }

    /// Re-issues the certification of `blob` with other names, signed with `secret`.
    fn with_names(
        blob: &CertifiedBlob,
        secret: &Secret,
        names: impl FnOnce(&Name, &Name) -> (Name, Name),
    ) -> CertifiedBlob {
        let attest = Attest::unmarshall(&blob.certify_info).unwrap();
        let AttestInfo::Certify { info } = attest.attested() else {
            panic!("not a certification");
        };
        let (name, qualified_name) = names(info.name(), info.qualified_name());
        let attest = soft::certify_attest(
            attest.qualified_signer(),
            attest.extra_data(),
            attest.clock_info().clock(),
            &name,
            &qualified_name,
        )
        .unwrap();
        re_sign(attest.marshall().unwrap(), blob, secret)
    }

    enum Tamper {
        Secret,
        HashAlgorithm,
        HmacDigest,
        CertifyInfo,
        Magic,
        Name,
        QualifiedName,
        AttestationType,
    }

    #[rstest]
    #[case(Tamper::Secret, "invalid HMAC")]
    #[case(Tamper::HashAlgorithm, "wrong hash algorithm")]
    #[case(Tamper::HmacDigest, "invalid HMAC")]
    #[case(Tamper::CertifyInfo, "invalid HMAC")]
    #[case(Tamper::Magic, "attestation statement was invalid")]
    #[case(Tamper::Name, "incorrect name")]
    #[case(Tamper::QualifiedName, "incorrect name")]
    #[case(Tamper::AttestationType, "attestation statement was invalid")]
    fn tampered_blob_is_rejected(#[case] tamper: Tamper, #[case] message: &str) {
        let (good, secret) = certified();
        verify_certified_ak_blob(&good, secret.as_ref()).unwrap();

        let mut blob = good.clone();
        let mut verify_secret = secret.as_ref().to_vec();
        match tamper {
            Tamper::Secret => verify_secret = b"bad secret".to_vec(),
            Tamper::HashAlgorithm => blob.raw_sig[2..4].copy_from_slice(&0x000cu16.to_be_bytes()),
            Tamper::HmacDigest => blob.raw_sig[4] ^= 0xff,
            Tamper::CertifyInfo => blob.certify_info[0] ^= 0xff,
            Tamper::Magic => {
                let mut certify_info = good.certify_info.clone();
                certify_info[..4].fill(0);
                blob = re_sign(certify_info, &good, &secret);
            }
            Tamper::Name => {
                blob = with_names(&good, &secret, |name, qualified_name| {
                    let mut bytes = name.value().to_vec();
                    bytes[2] ^= 0xff;
                    (Name::try_from(bytes).unwrap(), qualified_name.clone())
                })
            }
            Tamper::QualifiedName => {
                blob = with_names(&good, &secret, |name, _| (name.clone(), name.clone()))
            }
            Tamper::AttestationType => {
                // TPM_ST_ATTEST_QUOTE
                let mut certify_info = good.certify_info.clone();
                certify_info[4..6].copy_from_slice(&[0x80, 0x18]);
                blob = re_sign(certify_info, &good, &secret);
            }
        }

        let err = verify_certified_ak_blob(&blob, &verify_secret).unwrap_err();
        assert!(
            err.to_string().contains(message),
            "got {err}, want {message}"
        );
    }

    #[rstest]
    #[case(0x0004, 20)]
    #[case(0x000c, 48)]
    #[case(0x000d, 64)]
    #[case(0x00b3, 32)]
    fn foreign_hash_algorithm_is_reported(#[case] hash_alg: AlgId, #[case] size: usize) {
        let (mut blob, secret) = certified();
        blob.raw_sig = hmac_signature(hash_alg, &vec![0; size]);
        let result = verify_certified_ak_blob(&blob, secret.as_ref());
        assert!(
            matches!(
                result,
                Err(VerifyError::WrongHashAlgorithm { found, .. }) if found == hash_alg
            ),
            "got {result:?}"
        );
    }

    #[test]
    fn non_hmac_signature_is_malformed() {
        let (mut blob, secret) = certified();
        // TPM_ALG_NULL
        blob.raw_sig = vec![0x00, 0x10];
        let result = verify_certified_ak_blob(&blob, secret.as_ref());
        assert!(matches!(result, Err(VerifyError::MalformedSignature)));

        blob.raw_sig = vec![0x00, 0x05];
        let result = verify_certified_ak_blob(&blob, secret.as_ref());
        assert!(matches!(result, Err(VerifyError::MalformedSignature)));

        blob.raw_sig = hmac_signature(HMAC_HASH_ALG, &[0; HMAC_SIZE + 1]);
        let result = verify_certified_ak_blob(&blob, secret.as_ref());
        assert!(matches!(result, Err(VerifyError::MalformedSignature)));
    }

    #[test]
    fn empty_secret_is_invalid_hmac() {
        let (blob, _) = certified();
        let result = verify_certified_ak_blob(&blob, &[]);
        assert!(matches!(result, Err(VerifyError::InvalidHmac)));
    }

    #[test]
    fn swapped_ak_pub_is_incorrect_name() {
        let (mut blob, secret) = certified();
        blob.ak_pub = AkAlgorithm::Ecc.template().unwrap().marshall().unwrap();
        let result = verify_certified_ak_blob(&blob, secret.as_ref());
        assert!(matches!(result, Err(VerifyError::IncorrectName)));
    }
}
