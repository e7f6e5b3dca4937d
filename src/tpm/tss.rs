// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{
    Authorization, Certification, CreatedPrimary, Handle, Hierarchy, LoadedObject, Tpm, TpmError,
};
use log::{debug, warn};
use tss_esapi::attributes::SessionAttributesBuilder;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::{AuthHandle, KeyHandle, ObjectHandle, SessionHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::resource_handles::Hierarchy as TssHierarchy;
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Data, EncryptedSecret, Name, Private, Public, SignatureScheme, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::Context;

/// A TPM reached through the TSS ESAPI.
pub struct TssTpm {
    context: Context,
}

impl TssTpm {
    /// Connects to the TCTI named by `TCTI`/`TPM2TOOLS_TCTI`, or the default device.
    pub fn new() -> Result<Self, TpmError> {
        let conf = TctiNameConf::from_environment_variable()
            .unwrap_or_else(|_| TctiNameConf::Device(DeviceConfig::default()));
        Self::with_tcti(conf)
    }

    pub fn with_tcti(conf: TctiNameConf) -> Result<Self, TpmError> {
        let context = Context::new(conf)?;
        Ok(TssTpm { context })
    }

    fn policy_secret_session(&mut self, hierarchy: Hierarchy) -> Result<AuthSession, TpmError> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(|| TpmError::Rejected("no policy session returned".to_string()))?;
        let (attributes, mask) = SessionAttributesBuilder::new().build();
        self.context
            .tr_sess_set_attributes(session, attributes, mask)?;

        let policy_session = PolicySession::try_from(session)?;
        let auth_handle = match hierarchy {
            Hierarchy::Owner => AuthHandle::Owner,
            Hierarchy::Endorsement => AuthHandle::Endorsement,
        };
        let result = self.context.execute_with_nullauth_session(|ctx| {
            ctx.policy_secret(
                policy_session,
                auth_handle,
                Default::default(),
                Default::default(),
                Default::default(),
                None,
            )
        });
        if let Err(e) = result {
            self.flush_session(session);
            return Err(e.into());
        }
        Ok(session)
    }

    fn flush_session(&mut self, session: AuthSession) {
        let handle: ObjectHandle = SessionHandle::from(session).into();
        if let Err(e) = self.context.flush_context(handle) {
            warn!("failed to flush policy session: {e}");
        }
    }

    /// Runs `f` with the parent authorized as `auth`. A policy session is consumed by the
    /// command when it succeeds and flushed here when it does not.
    fn with_parent_auth<R>(
        &mut self,
        auth: Authorization,
        f: impl FnOnce(&mut Context) -> tss_esapi::Result<R>,
    ) -> Result<R, TpmError> {
        match auth {
            Authorization::Password => Ok(self.context.execute_with_nullauth_session(f)?),
            Authorization::PolicySecret(hierarchy) => {
                let session = self.policy_secret_session(hierarchy)?;
                let result = self.context.execute_with_session(Some(session), f);
                if result.is_err() {
                    self.flush_session(session);
                }
                Ok(result?)
            }
        }
    }

    fn name(&mut self, handle: ObjectHandle) -> Result<Name, TpmError> {
        Ok(self.context.tr_get_name(handle)?)
    }
}

impl Tpm for TssTpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Public,
    ) -> Result<CreatedPrimary, TpmError> {
        let public = template.clone();
        let hierarchy = match hierarchy {
            Hierarchy::Owner => TssHierarchy::Owner,
            Hierarchy::Endorsement => TssHierarchy::Endorsement,
        };
        let result = self.context.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(hierarchy, public, None, None, None, None)
        })?;

        let handle = ObjectHandle::from(result.key_handle);
        let name = self.name(handle)?;
        debug!("created primary {:08x}", u32::from(handle));
        Ok(CreatedPrimary {
            handle: Handle(handle.into()),
            public: result.out_public,
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
        let public = public.clone();
        let duplicate = Private::try_from(duplicate.to_vec())?;
        let encrypted_seed = EncryptedSecret::try_from(encrypted_seed.to_vec())?;
        let private = self.with_parent_auth(auth, |ctx| {
            ctx.import(
                ObjectHandle::from(parent.0),
                None,
                public,
                duplicate,
                encrypted_seed,
                SymmetricDefinitionObject::Null,
            )
        })?;
        Ok(private.value().to_vec())
    }

    fn load(
        &mut self,
        parent: Handle,
        auth: Authorization,
        public: &Public,
        private: &[u8],
    ) -> Result<LoadedObject, TpmError> {
        let public = public.clone();
        let private = Private::try_from(private.to_vec())?;
        let key_handle = self.with_parent_auth(auth, |ctx| {
            ctx.load(KeyHandle::from(parent.0), private, public)
        })?;

        let handle = ObjectHandle::from(key_handle);
        let name = self.name(handle)?;
        Ok(LoadedObject {
            handle: Handle(handle.into()),
            name,
        })
    }

    fn certify(
        &mut self,
        object: Handle,
        signer: Handle,
        qualifying_data: &[u8],
    ) -> Result<Certification, TpmError> {
        let qualifying_data = Data::try_from(qualifying_data.to_vec())?;
        let (attest, signature) = self.context.execute_with_sessions(
            (Some(AuthSession::Password), Some(AuthSession::Password), None),
            |ctx| {
                ctx.certify(
                    ObjectHandle::from(object.0),
                    KeyHandle::from(signer.0),
                    qualifying_data,
                    SignatureScheme::Null,
                )
            },
        )?;
        Ok(Certification { attest, signature })
    }

    fn flush(&mut self, handle: Handle) -> Result<(), TpmError> {
        self.context.flush_context(ObjectHandle::from(handle.0))?;
        Ok(())
    }
}
