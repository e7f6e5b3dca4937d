// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The TPM commands the protocol needs, behind a trait so the attester runs against a real
//! TPM (`tpm` feature) or the in-process [`SoftTpm`](soft::SoftTpm).

use crate::duplicate::DuplicateError;
use log::warn;
use openssl::error::ErrorStack;
use std::fmt;
use thiserror::Error;
use tss_esapi::constants::tss::{TPM2_RH_ENDORSEMENT, TPM2_RH_OWNER};
use tss_esapi::structures::{Attest, Name, Public, Signature};

#[cfg(any(test, feature = "soft-tpm"))]
pub mod soft;
#[cfg(feature = "tpm")]
mod tss;

#[cfg(feature = "tpm")]
pub use tss::TssTpm;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TpmError {
    #[error("tss error")]
    Tss(#[from] tss_esapi::Error),
    #[error("openssl error")]
    OpenSsl(#[from] ErrorStack),
    #[error("duplicate error")]
    Duplicate(#[from] DuplicateError),
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// A transient object handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hierarchy {
    Owner,
    Endorsement,
}

impl Hierarchy {
    pub fn handle(self) -> u32 {
        match self {
            Hierarchy::Owner => TPM2_RH_OWNER,
            Hierarchy::Endorsement => TPM2_RH_ENDORSEMENT,
        }
    }

    /// A hierarchy's name and qualified name are its handle.
    pub fn qualified_name(self) -> [u8; 4] {
        self.handle().to_be_bytes()
    }
}

/// How the parent of an import or load is authorized
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorization {
    /// Empty password
    Password,
    /// A policy session satisfied with TPM2_PolicySecret against the hierarchy
    PolicySecret(Hierarchy),
}

#[derive(Clone, Debug)]
pub struct CreatedPrimary {
    pub handle: Handle,
    pub public: Public,
    pub name: Name,
}

#[derive(Clone, Debug)]
pub struct LoadedObject {
    pub handle: Handle,
    pub name: Name,
}

#[derive(Clone, Debug)]
pub struct Certification {
    pub attest: Attest,
    pub signature: Signature,
}

pub trait Tpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<CreatedPrimary, TpmError>;

    /// Returns the private area of the imported object, protected by `parent`.
    fn import(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        duplicate: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<Vec<u8>, TpmError>;

    fn load(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        private: &[u8],
    ) -> Result<LoadedObject, TpmError>;

    fn certify(
        &mut self,
        object: Handle,
        signer: Handle,
        qualifying_data: &[u8],
    ) -> Result<Certification, TpmError>;

    fn flush(&mut self, handle: Handle) -> Result<(), TpmError>;
}

impl<T: Tpm + ?Sized> Tpm for &mut T {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<CreatedPrimary, TpmError> {
        (**self).create_primary(hierarchy, template)
    }

    fn import(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        duplicate: &[u8],
        encrypted_seed: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        (**self).import(parent, auth, public, duplicate, encrypted_seed)
    }

    fn load(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        private: &[u8],
    ) -> Result<LoadedObject, TpmError> {
        (**self).load(parent, auth, public, private)
    }

    fn certify(
        &mut self,
        object: Handle,
        signer: Handle,
        qualifying_data: &[u8],
    ) -> Result<Certification, TpmError> {
        (**self).certify(object, signer, qualifying_data)
    }

    fn flush(&mut self, handle: Handle) -> Result<(), TpmError> {
        (**self).flush(handle)
    }
}

/// Tracks the transient objects created through it and flushes the ones still loaded when
/// it goes out of scope, whatever the exit path.
pub struct TransientObjects<'a, T: Tpm + ?Sized> {
    tpm: &'a mut T,
    handles: Vec<Handle>,
}

impl<'a, T: Tpm + ?Sized> TransientObjects<'a, T> {
    pub fn new(tpm: &'a mut T) -> Self {
        TransientObjects {
            tpm,
            handles: Vec::new(),
        }
    }

    pub fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<CreatedPrimary, TpmError> {
        let created = self.tpm.create_primary(hierarchy, template)?;
        self.handles.push(created.handle);
        Ok(created)
    }

    pub fn load(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        private: &[u8],
    ) -> Result<LoadedObject, TpmError> {
        let loaded = self.tpm.load(parent, auth, public, private)?;
        self.handles.push(loaded.handle);
        Ok(loaded)
    }

    /// Commands that do not create transient objects
    pub fn tpm(&mut self) -> &mut T {
        self.tpm
    }

    /// Releases `handle` before the scope ends.
    pub fn flush(&mut self, handle: Handle) -> Result<(), TpmError> {
        self.handles.retain(|h| *h != handle);
        self.tpm.flush(handle)
    }
}

impl<T: Tpm + ?Sized> Drop for TransientObjects<'_, T> {
    fn drop(&mut self) {
        while let Some(handle) = self.handles.pop() {
            if let Err(e) = self.tpm.flush(handle) {
                warn!("failed to flush transient object {handle}: {e}");
            }
        }
    }
}
