// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process TPM for tests and demos. It implements the handful of commands the
//! certification protocol uses with the same observable behavior as a TPM: primaries are
//! deterministic per hierarchy and template, imports are decrypted and integrity checked,
//! and certification with a keyed hash signer produces an HMAC over the attestation digest.
//! Nothing here is protected; private areas are returned in the clear.

use super::{
    Authorization, Certification, CreatedPrimary, Handle, Hierarchy, LoadedObject, Tpm, TpmError,
};
use crate::duplicate::{self, Wrapped};
use crate::templates;
use crate::tpm2;
use log::debug;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use std::collections::HashMap;
use tss_esapi::constants::tss::{TPM2_GENERATED_VALUE, TPM2_ST_ATTEST_CERTIFY};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::structures::{
    Attest, Data, Digest, EccParameter, EccPoint, HashAgile, HashScheme, KeyedHashScheme, Name,
    Public, PublicKeyRsa, PublicKeyedHashParameters, Sensitive, Signature,
};
use tss_esapi::traits::Marshall;
use tss_esapi::tss2_esys::{
    TPMS_ATTEST, TPMS_CERTIFY_INFO, TPMS_CLOCK_INFO, TPMS_KEYEDHASH_PARMS, TPMU_ATTEST,
};

const FIRST_TRANSIENT_HANDLE: u32 = 0x8000_0000;
/// Transient object slots, the minimum a TPM must provide
const DEFAULT_CAPACITY: usize = 3;
const FIRMWARE_VERSION: u64 = 0x0001_0002_0003_0004;

/// Commands of the TPM double, used to inject failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    CreatePrimary,
    Import,
    Load,
    Certify,
    Flush,
}

enum Key {
    Asymmetric(PKey<Private>),
    KeyedHash(Vec<u8>),
}

struct Object {
    public: Public,
    name: Name,
    qualified_name: Name,
    key: Key,
}

pub struct SoftTpm {
    primaries: HashMap<(u32, Vec<u8>), PKey<Private>>,
    objects: HashMap<u32, Object>,
    next_handle: u32,
    capacity: usize,
    commands: usize,
    failing: Option<Command>,
}

impl Default for SoftTpm {
    fn default() -> Self {
        SoftTpm::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        SoftTpm {
            primaries: HashMap::new(),
            objects: HashMap::new(),
            next_handle: FIRST_TRANSIENT_HANDLE,
            capacity: DEFAULT_CAPACITY,
            commands: 0,
            failing: None,
        }
    }

    /// Number of transient objects currently loaded
    pub fn transient_objects(&self) -> usize {
        self.objects.len()
    }

    /// Number of commands executed so far, successful or not
    pub fn commands_executed(&self) -> usize {
        self.commands
    }

    /// Makes every later `command` fail.
    pub fn fail_command(&mut self, command: Command) {
        self.failing = Some(command);
    }

    fn execute(&mut self, command: Command) -> Result<(), TpmError> {
        self.commands += 1;
        debug!("soft tpm: {command:?}");
        if self.failing == Some(command) {
            return Err(TpmError::Rejected(format!("{command:?} failure injected")));
        }
        Ok(())
    }

    fn insert(&mut self, object: Object) -> Result<Handle, TpmError> {
        if self.objects.len() >= self.capacity {
            return Err(TpmError::Rejected("out of object memory".to_string()));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, object);
        Ok(Handle(handle))
    }

    fn object(&self, handle: Handle) -> Result<&Object, TpmError> {
        self.objects
            .get(&handle.0)
            .ok_or_else(|| TpmError::Rejected(format!("unknown handle {handle}")))
    }

    fn primary_key(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<PKey<Private>, TpmError> {
        let id = (hierarchy.handle(), template.marshall()?);
        if let Some(key) = self.primaries.get(&id) {
            return Ok(key.clone());
        }
        let key = match template {
            Public::Rsa { parameters, .. } => {
                let bits = u16::from(parameters.key_bits());
                PKey::from_rsa(Rsa::generate(u32::from(bits))?)?
            }
            Public::Ecc { parameters, .. } if parameters.ecc_curve() == EccCurve::NistP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
            _ => return Err(TpmError::Rejected("unsupported primary template".to_string())),
        };
        self.primaries.insert(id, key.clone());
        Ok(key)
    }

    /// Checks user authorization for `object`.
    fn authorize(&self, object: &Object, auth: Authorization) -> Result<(), TpmError> {
        let authorized = match auth {
            Authorization::Password => object.public.object_attributes().user_with_auth(),
            Authorization::PolicySecret(hierarchy) => {
                let digest =
                    templates::policy_secret(&[0; 32], &hierarchy.qualified_name(), &[]);
                object.public.auth_policy().value() == digest
            }
        };
        if !authorized {
            return Err(TpmError::Rejected("authorization failed".to_string()));
        }
        Ok(())
    }
}

fn with_unique(template: &Public, key: &PKey<Private>) -> Result<Public, TpmError> {
    match template.clone() {
        Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            ..
        } => Ok(Public::Rsa {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            unique: PublicKeyRsa::try_from(key.rsa()?.n().to_vec())?,
        }),
        Public::Ecc {
            object_attributes,
            name_hashing_algorithm,
            auth_policy,
            parameters,
            ..
        } => {
            let ec = key.ec_key()?;
            let mut ctx = BigNumContext::new()?;
            let mut x = BigNum::new()?;
            let mut y = BigNum::new()?;
            ec.public_key()
                .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
            Ok(Public::Ecc {
                object_attributes,
                name_hashing_algorithm,
                auth_policy,
                parameters,
                unique: EccPoint::new(
                    EccParameter::try_from(x.to_vec_padded(32)?)?,
                    EccParameter::try_from(y.to_vec_padded(32)?)?,
                ),
            })
        }
        _ => Err(TpmError::Rejected("unsupported primary template".to_string())),
    }
}

/// The unique field of a keyed hash object binds its public area to the sensitive part.
fn check_binding(public: &Public, sensitive: &Sensitive) -> Result<(), TpmError> {
    let Public::KeyedHash { unique, .. } = public else {
        return Err(TpmError::Rejected("only keyed hash objects can be imported".to_string()));
    };
    let Sensitive::Bits {
        seed_value,
        sensitive,
        ..
    } = sensitive
    else {
        return Err(TpmError::Rejected("sensitive type mismatch".to_string()));
    };
    let expected = tpm2::hash(
        public.name_hashing_algorithm(),
        &[seed_value.value(), sensitive.value()],
    )?;
    if unique.value() != expected {
        return Err(TpmError::Rejected("public area not bound to sensitive".to_string()));
    }
    Ok(())
}

fn hmac_algorithm(parameters: &PublicKeyedHashParameters) -> Result<HashingAlgorithm, TpmError> {
    match KeyedHashScheme::try_from(TPMS_KEYEDHASH_PARMS::from(*parameters).scheme)? {
        KeyedHashScheme::Hmac { hmac_scheme } => {
            Ok(HashScheme::from(hmac_scheme).hashing_algorithm())
        }
        _ => Err(TpmError::Rejected("signer has no HMAC scheme".to_string())),
    }
}

/// TPMS_ATTEST of a TPM2_Certify, as produced by this TPM.
pub fn certify_attest(
    qualified_signer: &Name,
    extra_data: &Data,
    clock: u64,
    name: &Name,
    qualified_name: &Name,
) -> Result<Attest, TpmError> {
    let attest = TPMS_ATTEST {
        magic: TPM2_GENERATED_VALUE,
        type_: TPM2_ST_ATTEST_CERTIFY,
        qualifiedSigner: qualified_signer.clone().into(),
        extraData: extra_data.clone().into(),
        clockInfo: TPMS_CLOCK_INFO {
            clock,
            resetCount: 0,
            restartCount: 0,
            safe: 1,
        },
        firmwareVersion: FIRMWARE_VERSION,
        attested: TPMU_ATTEST {
            certify: TPMS_CERTIFY_INFO {
                name: name.clone().into(),
                qualifiedName: qualified_name.clone().into(),
            },
        },
    };
    Ok(Attest::try_from(attest)?)
}

impl Tpm for SoftTpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<CreatedPrimary, TpmError> {
        self.execute(Command::CreatePrimary)?;
        let key = self.primary_key(hierarchy, template)?;
        let public = with_unique(template, &key)?;
        let name = tpm2::name(&public)?;
        let qualified_name = tpm2::qualified_name(
            public.name_hashing_algorithm(),
            &hierarchy.qualified_name(),
            &name,
        )?;

        let handle = self.insert(Object {
            public: public.clone(),
            name: name.clone(),
            qualified_name,
            key: Key::Asymmetric(key),
        })?;
        Ok(CreatedPrimary {
            handle,
            public,
            name,
        })
    }

    fn import(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        duplicate: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        self.execute(Command::Import)?;
        let parent = self.object(parent)?;
        self.authorize(parent, auth)?;
        let Key::Asymmetric(parent_key) = &parent.key else {
            return Err(TpmError::Rejected("parent is not a storage key".to_string()));
        };

        let attributes = public.object_attributes();
        if attributes.fixed_tpm() || attributes.fixed_parent() {
            return Err(TpmError::Rejected("object is not duplicable".to_string()));
        }
        let wrapped = Wrapped {
            duplicate: duplicate.to_vec(),
            encrypted_seed: encrypted_seed.to_vec(),
        };
        let sensitive =
            duplicate::unwrap(&parent.public, parent_key, &tpm2::name(public)?, &wrapped)?;
        check_binding(public, &sensitive)?;
        Ok(tpm2::marshall_sensitive(&sensitive)?)
    }

    fn load(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        private: &[u8],
    ) -> Result<LoadedObject, TpmError> {
        self.execute(Command::Load)?;
        let parent = self.object(parent)?;
        self.authorize(parent, auth)?;
        let parent_qualified_name = parent.qualified_name.clone();

        let sensitive = tpm2::unmarshall_sensitive(private)?;
        check_binding(public, &sensitive)?;
        let Sensitive::Bits { sensitive: key, .. } = sensitive else {
            return Err(TpmError::Rejected("sensitive type mismatch".to_string()));
        };
        let name = tpm2::name(public)?;
        let qualified_name = tpm2::qualified_name(
            public.name_hashing_algorithm(),
            parent_qualified_name.value(),
            &name,
        )?;

        let handle = self.insert(Object {
            public: public.clone(),
            name: name.clone(),
            qualified_name,
            key: Key::KeyedHash(key.value().to_vec()),
        })?;
        Ok(LoadedObject { handle, name })
    }

    fn certify(
        &mut self,
        object: Handle,
        signer: Handle,
        qualifying_data: &[u8],
    ) -> Result<Certification, TpmError> {
        self.execute(Command::Certify)?;
        let clock = self.commands as u64;
        let object = self.object(object)?;
        let signer = self.object(signer)?;

        let (Key::KeyedHash(key), Public::KeyedHash { parameters, .. }) =
            (&signer.key, &signer.public)
        else {
            return Err(TpmError::Rejected("only keyed hash signers are supported".to_string()));
        };
        let hash_alg = hmac_algorithm(parameters)?;
        if !signer.public.object_attributes().sign_encrypt() {
            return Err(TpmError::Rejected("signer is not a signing key".to_string()));
        }

        let attest = certify_attest(
            &signer.qualified_name,
            &Data::try_from(qualifying_data.to_vec())?,
            clock,
            &object.name,
            &object.qualified_name,
        )?;

        let digest = tpm2::hash(hash_alg, &[attest.marshall()?.as_slice()])?;
        let pkey = PKey::hmac(key)?;
        let mut hmac = Signer::new(duplicate::message_digest(hash_alg)?, &pkey)?;
        hmac.update(&digest)?;
        let signature = Signature::Hmac(HashAgile::new(
            hash_alg,
            Digest::try_from(hmac.sign_to_vec()?)?,
        ));

        Ok(Certification { attest, signature })
    }

    fn flush(&mut self, handle: Handle) -> Result<(), TpmError> {
        self.execute(Command::Flush)?;
        self.objects
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| TpmError::Rejected(format!("unknown handle {handle}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::AkAlgorithm;

    #[test]
    fn primaries_are_deterministic() {
        let mut tpm = SoftTpm::new();
        let ek = templates::rsa_ek_template().unwrap();
        let first = tpm.create_primary(Hierarchy::Endorsement, &ek).unwrap();
        let second = tpm.create_primary(Hierarchy::Endorsement, &ek).unwrap();
        assert_ne!(first.handle, second.handle);
        assert_eq!(first.public, second.public);
        assert_eq!(first.name, tpm2::name(&first.public).unwrap());
    }

    #[test]
    fn object_memory_is_bounded() {
        let mut tpm = SoftTpm::new();
        let template = AkAlgorithm::Ecc.template().unwrap();
        for _ in 0..DEFAULT_CAPACITY {
            tpm.create_primary(Hierarchy::Owner, &template).unwrap();
        }
        let result = tpm.create_primary(Hierarchy::Owner, &template);
        assert!(matches!(result, Err(TpmError::Rejected(_))));
    }

    #[test]
    fn ek_requires_endorsement_policy() {
        let mut tpm = SoftTpm::new();
        let ek = tpm
            .create_primary(Hierarchy::Endorsement, &templates::rsa_ek_template().unwrap())
            .unwrap();
        let hmac_key = templates::restricted_hmac_template(vec![0; 32]).unwrap();
        let result = tpm.load(ek.handle, Authorization::Password, &hmac_key, &[]);
        assert!(matches!(result, Err(TpmError::Rejected(m)) if m == "authorization failed"));

        let result = tpm.load(
            ek.handle,
            Authorization::PolicySecret(Hierarchy::Owner),
            &hmac_key,
            &[],
        );
        assert!(matches!(result, Err(TpmError::Rejected(m)) if m == "authorization failed"));
    }

    #[test]
    fn certify_attest_is_a_certification() {
        let name = Name::try_from(vec![0x00, 0x0b, 1, 2, 3]).unwrap();
        let qualified_name = Name::try_from(vec![0x00, 0x0b, 4, 5, 6]).unwrap();
        let attest = certify_attest(
            &qualified_name,
            &Data::try_from(b"nonce".to_vec()).unwrap(),
            7,
            &name,
            &qualified_name,
        )
        .unwrap();
        let bytes = attest.marshall().unwrap();
        assert_eq!(bytes[..6], [0xff, 0x54, 0x43, 0x47, 0x80, 0x17]);
        assert_eq!(attest.extra_data().value(), b"nonce");
    }

    #[test]
    fn injected_failures_count_as_commands() {
        let mut tpm = SoftTpm::new();
        tpm.fail_command(Command::CreatePrimary);
        let result = tpm.create_primary(Hierarchy::Owner, &AkAlgorithm::Rsa.template().unwrap());
        assert!(result.is_err());
        assert_eq!(tpm.commands_executed(), 1);
        assert_eq!(tpm.transient_objects(), 0);
    }

    #[test]
    fn flush_unknown_handle() {
        let mut tpm = SoftTpm::new();
        assert!(tpm.flush(Handle(0x8000_1234)).is_err());
    }
}
