// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Public area templates for the keys the protocol creates, and the policy digests that
//! guard them.

use crate::tpm2::AlgId;
use sha2::{Digest as _, Sha256};
use std::str::FromStr;
use thiserror::Error;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::tss::{
    TPM2_ALG_ECC, TPM2_ALG_RSA, TPM2_CC_Duplicate, TPM2_CC_PolicyCommandCode,
    TPM2_CC_PolicySecret, TPM2_RH_ENDORSEMENT,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, SymmetricMode};
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::key_bits::{AesKeyBits, RsaKeyBits};
use tss_esapi::structures::{
    Digest, EccPoint, EccScheme, HashScheme, KeyDerivationFunctionScheme, KeyedHashScheme,
    Public, PublicBuilder, PublicEccParametersBuilder, PublicKeyRsa, PublicKeyedHashParameters,
    PublicRsaParametersBuilder, RsaExponent, RsaScheme, SymmetricDefinitionObject,
};
use tss_esapi::Result;

/// PolicySecret(TPM_RH_ENDORSEMENT), the authPolicy of the TCG default EK.
pub const EK_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7,
    0x24, 0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14,
    0x69, 0xaa,
];

/// nameAlg of the restricted HMAC key. Its unique field is hashed with it too.
pub const HMAC_KEY_NAME_ALG: HashingAlgorithm = HashingAlgorithm::Sha256;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unsupported AK algorithm: {0}")]
pub struct UnsupportedAlgorithm(pub String);

/// Algorithm of the attestation key created by the attester.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AkAlgorithm {
    Rsa,
    Ecc,
}

impl AkAlgorithm {
    pub fn public_algorithm(self) -> PublicAlgorithm {
        match self {
            AkAlgorithm::Rsa => PublicAlgorithm::Rsa,
            AkAlgorithm::Ecc => PublicAlgorithm::Ecc,
        }
    }

    /// Restricted signing key template: RSA-2048 with RSASSA-SHA256, or NIST P-256 with
    /// ECDSA-SHA256.
    pub fn template(self) -> Result<Public> {
        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_restricted(true)
            .with_sign_encrypt(true)
            .build()?;
        let builder = PublicBuilder::new()
            .with_public_algorithm(self.public_algorithm())
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes);

        match self {
            AkAlgorithm::Rsa => builder
                .with_rsa_parameters(
                    PublicRsaParametersBuilder::new()
                        .with_scheme(RsaScheme::RsaSsa(HashScheme::new(HashingAlgorithm::Sha256)))
                        .with_key_bits(RsaKeyBits::Rsa2048)
                        .with_exponent(RsaExponent::default())
                        .with_is_signing_key(true)
                        .with_restricted(true)
                        .build()?,
                )
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build(),
            AkAlgorithm::Ecc => builder
                .with_ecc_parameters(
                    PublicEccParametersBuilder::new()
                        .with_ecc_scheme(EccScheme::EcDsa(HashScheme::new(
                            HashingAlgorithm::Sha256,
                        )))
                        .with_curve(EccCurve::NistP256)
                        .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                        .with_is_signing_key(true)
                        .with_restricted(true)
                        .build()?,
                )
                .with_ecc_unique_identifier(EccPoint::default())
                .build(),
        }
    }
}

impl TryFrom<AlgId> for AkAlgorithm {
    type Error = UnsupportedAlgorithm;

    fn try_from(alg: AlgId) -> std::result::Result<Self, Self::Error> {
        match alg {
            TPM2_ALG_RSA => Ok(AkAlgorithm::Rsa),
            TPM2_ALG_ECC => Ok(AkAlgorithm::Ecc),
            other => Err(UnsupportedAlgorithm(format!("0x{other:04x}"))),
        }
    }
}

impl FromStr for AkAlgorithm {
    type Err = UnsupportedAlgorithm;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(AkAlgorithm::Rsa),
            "ecc" | "ecdsa" => Ok(AkAlgorithm::Ecc),
            _ => Err(UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// TCG EK Credential Profile template L-1 (RSA-2048, AES-128-CFB).
pub fn rsa_ek_template() -> Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_admin_with_policy(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;
    let symmetric = SymmetricDefinitionObject::Aes {
        key_bits: AesKeyBits::Aes128,
        mode: SymmetricMode::Cfb,
    };

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_auth_policy(Digest::try_from(EK_POLICY.to_vec())?)
        .with_rsa_parameters(
            PublicRsaParametersBuilder::new_restricted_decryption_key(
                symmetric,
                RsaKeyBits::Rsa2048,
                RsaExponent::default(),
            )
            .build()?,
        )
        .with_rsa_unique_identifier(PublicKeyRsa::new_empty_with_size(RsaKeyBits::Rsa2048))
        .build()
}

/// Restricted HMAC-SHA256 signing key that may only be duplicated with endorsement
/// authorization. `unique` binds the public area to the sensitive part.
pub fn restricted_hmac_template(unique: Vec<u8>) -> Result<Public> {
    let policy = policy_command_code(
        &policy_secret(&[0; 32], &TPM2_RH_ENDORSEMENT.to_be_bytes(), &[]),
        TPM2_CC_Duplicate,
    );
    let attributes = ObjectAttributesBuilder::new()
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_sign_encrypt(true)
        .build()?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HMAC_KEY_NAME_ALG)
        .with_object_attributes(attributes)
        .with_auth_policy(Digest::try_from(policy.to_vec())?)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(
            KeyedHashScheme::HMAC_SHA_256,
        ))
        .with_keyed_hash_unique_identifier(Digest::try_from(unique)?)
        .build()
}

/// Extends `previous` with TPM2_PolicySecret against the entity named `auth_name`.
pub fn policy_secret(previous: &[u8], auth_name: &[u8], policy_ref: &[u8]) -> [u8; 32] {
    let step = Sha256::new()
        .chain_update(previous)
        .chain_update(TPM2_CC_PolicySecret.to_be_bytes())
        .chain_update(auth_name)
        .finalize();
    Sha256::new()
        .chain_update(step)
        .chain_update(policy_ref)
        .finalize()
        .into()
}

/// Extends `previous` with TPM2_PolicyCommandCode(`code`).
pub fn policy_command_code(previous: &[u8], code: u32) -> [u8; 32] {
    Sha256::new()
        .chain_update(previous)
        .chain_update(TPM2_CC_PolicyCommandCode.to_be_bytes())
        .chain_update(code.to_be_bytes())
        .finalize()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tss_esapi::constants::tss::TPM2_ALG_SHA1;
    use tss_esapi::tss2_esys::TPMA_OBJECT;
    use tss_esapi::traits::Marshall;

    fn attributes(public: &Public) -> TPMA_OBJECT {
        public.object_attributes().into()
    }

    #[test]
    fn ek_policy_is_policy_secret_endorsement() {
        let policy = policy_secret(&[0; 32], &TPM2_RH_ENDORSEMENT.to_be_bytes(), &[]);
        assert_eq!(policy, EK_POLICY);
    }

    #[test]
    fn template_attributes() {
        assert_eq!(attributes(&rsa_ek_template().unwrap()), 0x0003_00b2);
        assert_eq!(attributes(&AkAlgorithm::Rsa.template().unwrap()), 0x0005_0072);
        assert_eq!(attributes(&AkAlgorithm::Ecc.template().unwrap()), 0x0005_0072);

        let hmac = restricted_hmac_template(vec![0; 32]).unwrap();
        assert_eq!(attributes(&hmac), 0x0005_0040);
        assert!(matches!(hmac, Public::KeyedHash { .. }));
        assert!(!hmac.object_attributes().fixed_parent());
        assert_ne!(hmac.auth_policy().value(), EK_POLICY);
        assert_eq!(hmac.name_hashing_algorithm(), HMAC_KEY_NAME_ALG);
    }

    #[test]
    fn ek_template_marshals_to_tcg_layout() {
        let bytes = rsa_ek_template().unwrap().marshall().unwrap();
        // type, nameAlg, attributes, policy, symmetric, scheme, keyBits, exponent, unique
        assert_eq!(bytes.len(), 2 + 2 + 4 + 34 + 6 + 2 + 2 + 4 + 258);
        assert_eq!(bytes[..8], [0x00, 0x01, 0x00, 0x0b, 0x00, 0x03, 0x00, 0xb2]);
    }

    #[test]
    fn ak_algorithm_selection() {
        assert_eq!(AkAlgorithm::try_from(TPM2_ALG_RSA), Ok(AkAlgorithm::Rsa));
        assert_eq!(AkAlgorithm::try_from(TPM2_ALG_ECC), Ok(AkAlgorithm::Ecc));
        assert_eq!(
            AkAlgorithm::try_from(TPM2_ALG_SHA1),
            Err(UnsupportedAlgorithm("0x0004".to_string()))
        );
        assert_eq!("ECC".parse::<AkAlgorithm>(), Ok(AkAlgorithm::Ecc));
        assert!("dsa".parse::<AkAlgorithm>().is_err());
    }
}
