// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outer wrapping of a TPM object for TPM2_Import under an RSA storage parent
//! (TPM 2.0 Library, Part 1, "Protected Storage" and "Duplication").

use crate::tpm2::{self, digest_size};
use openssl::bn::BigNum;
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::memcmp;
use openssl::pkey::{PKey, PKeyRef, Private, Public as PublicKey};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::symm::{self, Cipher};
use thiserror::Error;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, SymmetricMode};
use tss_esapi::interface_types::key_bits::AesKeyBits;
use tss_esapi::structures::{Name, Public, Sensitive, SymmetricDefinitionObject};

const OAEP_LABEL: &[u8] = b"DUPLICATE\0";
const RSA_DEFAULT_EXPONENT: u32 = 65537;
const IV: [u8; 16] = [0; 16];

#[derive(Error, Debug)]
pub enum DuplicateError {
    #[error("openssl error")]
    OpenSsl(#[from] ErrorStack),
    #[error("tss error")]
    Tss(#[from] tss_esapi::Error),
    #[error("unsupported parent: {0}")]
    UnsupportedParent(&'static str),
    #[error("integrity check of the duplicate failed")]
    Integrity,
}

/// `duplicate` and `inSymSeed` arguments of TPM2_Import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wrapped {
    pub duplicate: Vec<u8>,
    pub encrypted_seed: Vec<u8>,
}

pub(crate) fn message_digest(alg: HashingAlgorithm) -> Result<MessageDigest, DuplicateError> {
    match alg {
        HashingAlgorithm::Sha256 => Ok(MessageDigest::sha256()),
        HashingAlgorithm::Sha384 => Ok(MessageDigest::sha384()),
        HashingAlgorithm::Sha512 => Ok(MessageDigest::sha512()),
        _ => Err(DuplicateError::UnsupportedParent("unsupported name algorithm")),
    }
}

fn hmac(alg: HashingAlgorithm, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, DuplicateError> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(message_digest(alg)?, &pkey)?;
    for part in parts {
        signer.update(part)?;
    }
    Ok(signer.sign_to_vec()?)
}

/// KDFa from SP800-108 in counter mode, with HMAC over `alg`.
pub fn kdfa(
    alg: HashingAlgorithm,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>, DuplicateError> {
    let bytes = bits.div_ceil(8) as usize;
    let mut label = label.as_bytes().to_vec();
    if label.last() != Some(&0) {
        label.push(0);
    }

    let mut out = Vec::with_capacity(bytes + digest_size(alg)?);
    let mut counter: u32 = 1;
    while out.len() < bytes {
        out.extend(hmac(
            alg,
            key,
            &[
                counter.to_be_bytes().as_slice(),
                label.as_slice(),
                context_u,
                context_v,
                bits.to_be_bytes().as_slice(),
            ],
        )?);
        counter += 1;
    }
    out.truncate(bytes);
    // unaligned sizes drop the excess high bits of the first byte
    if bits % 8 != 0 {
        out[0] &= (1u8 << (bits % 8)) - 1;
    }
    Ok(out)
}

struct StorageParent {
    name_alg: HashingAlgorithm,
    cipher: Cipher,
    sym_bits: u32,
    key: PKey<PublicKey>,
}

impl StorageParent {
    fn new(parent: &Public) -> Result<Self, DuplicateError> {
        let Public::Rsa {
            name_hashing_algorithm,
            parameters,
            unique,
            ..
        } = parent
        else {
            return Err(DuplicateError::UnsupportedParent("only RSA parents are supported"));
        };
        let (cipher, sym_bits) = match parameters.symmetric_definition_object() {
            SymmetricDefinitionObject::Aes {
                key_bits,
                mode: SymmetricMode::Cfb,
            } => match key_bits {
                AesKeyBits::Aes128 => (Cipher::aes_128_cfb128(), 128),
                AesKeyBits::Aes192 => (Cipher::aes_192_cfb128(), 192),
                AesKeyBits::Aes256 => (Cipher::aes_256_cfb128(), 256),
            },
            _ => {
                return Err(DuplicateError::UnsupportedParent(
                    "parent is not an AES-CFB storage key",
                ))
            }
        };
        let exponent = match parameters.exponent().value() {
            0 => RSA_DEFAULT_EXPONENT,
            e => e,
        };
        let rsa = Rsa::from_public_components(
            BigNum::from_slice(unique.value())?,
            BigNum::from_u32(exponent)?,
        )?;
        Ok(StorageParent {
            name_alg: *name_hashing_algorithm,
            cipher,
            sym_bits,
            key: PKey::from_rsa(rsa)?,
        })
    }

    /// Storage and integrity keys derived from the seed for the object `name`.
    fn keys(&self, seed: &[u8], name: &Name) -> Result<(Vec<u8>, Vec<u8>), DuplicateError> {
        let sym_key = kdfa(self.name_alg, seed, "STORAGE", name.value(), &[], self.sym_bits)?;
        let hmac_bits = digest_size(self.name_alg)? as u32 * 8;
        let hmac_key = kdfa(self.name_alg, seed, "INTEGRITY", &[], &[], hmac_bits)?;
        Ok((sym_key, hmac_key))
    }
}

/// Wraps `sensitive`, the private part of the object called `name`, so that only the holder
/// of `parent`'s private key can import it.
pub fn wrap(
    parent: &Public,
    name: &Name,
    sensitive: &Sensitive,
) -> Result<Wrapped, DuplicateError> {
    let parent = StorageParent::new(parent)?;
    let md = message_digest(parent.name_alg)?;

    let mut seed = vec![0; digest_size(parent.name_alg)?];
    openssl::rand::rand_bytes(&mut seed)?;

    let mut encrypter = Encrypter::new(&parent.key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(md)?;
    encrypter.set_rsa_mgf1_md(md)?;
    encrypter.set_rsa_oaep_label(OAEP_LABEL)?;
    let mut encrypted_seed = vec![0; encrypter.encrypt_len(&seed)?];
    let len = encrypter.encrypt(&seed, &mut encrypted_seed)?;
    encrypted_seed.truncate(len);

    let (sym_key, hmac_key) = parent.keys(&seed, name)?;
    let plain = tpm2::marshall_sensitive(sensitive)?;
    let enc_sensitive = symm::encrypt(parent.cipher, &sym_key, Some(&IV), &plain)?;
    let integrity = hmac(parent.name_alg, &hmac_key, &[enc_sensitive.as_slice(), name.value()])?;

    // TPM2B_DIGEST integrity, then the encrypted TPM2B_SENSITIVE
    let mut duplicate = Vec::with_capacity(2 + integrity.len() + enc_sensitive.len());
    duplicate.extend((integrity.len() as u16).to_be_bytes());
    duplicate.extend(integrity);
    duplicate.extend(enc_sensitive);

    Ok(Wrapped {
        duplicate,
        encrypted_seed,
    })
}

/// Reverses [`wrap`] with the parent's private key, checking the outer integrity first.
pub fn unwrap(
    parent: &Public,
    parent_key: &PKeyRef<Private>,
    name: &Name,
    wrapped: &Wrapped,
) -> Result<Sensitive, DuplicateError> {
    let parent_info = StorageParent::new(parent)?;
    let md = message_digest(parent_info.name_alg)?;

    let mut decrypter = Decrypter::new(parent_key)?;
    decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    decrypter.set_rsa_oaep_md(md)?;
    decrypter.set_rsa_mgf1_md(md)?;
    decrypter.set_rsa_oaep_label(OAEP_LABEL)?;
    let mut seed = vec![0; decrypter.decrypt_len(&wrapped.encrypted_seed)?];
    let len = decrypter.decrypt(&wrapped.encrypted_seed, &mut seed)?;
    seed.truncate(len);

    let (sym_key, hmac_key) = parent_info.keys(&seed, name)?;

    let [s0, s1, rest @ ..] = wrapped.duplicate.as_slice() else {
        return Err(DuplicateError::Integrity);
    };
    let size = usize::from(u16::from_be_bytes([*s0, *s1]));
    if rest.len() < size {
        return Err(DuplicateError::Integrity);
    }
    let (integrity, enc_sensitive) = rest.split_at(size);
    let expected = hmac(parent_info.name_alg, &hmac_key, &[enc_sensitive, name.value()])?;
    if integrity.len() != expected.len() || !memcmp::eq(integrity, &expected) {
        return Err(DuplicateError::Integrity);
    }

    let plain = symm::decrypt(parent_info.cipher, &sym_key, Some(&IV), enc_sensitive)?;
    Ok(tpm2::unmarshall_sensitive(&plain)?)
}
