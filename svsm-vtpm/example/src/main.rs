// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error;
use svsm_vtpm::attest::{make_svsm_attestation, SvsmOptions};
use svsm_vtpm::provider::fake::FakeProvider;
use svsm_vtpm::verify::{verify_svsm_attestation, SnpVerifyOptions, VerifySvsmOptions};
use svsm_vtpm::SevSnpSvsmAttestation;
use vtpm_certify::certify;
use vtpm_certify::challenge::{self, ImportBlob, Secret};
use vtpm_certify::templates::AkAlgorithm;
use vtpm_certify::tpm::soft::SoftTpm;

/// The guest: a vTPM served by an SVSM at VMPL0.
struct Attester {
    tpm: SoftTpm,
    provider: FakeProvider,
}

impl Attester {
    fn new() -> Result<Self, Box<dyn Error>> {
        let mut tpm = SoftTpm::new();
        let manifest = certify::ek_pub(&mut tpm)?;
        let provider = FakeProvider::new(manifest)?;
        Ok(Attester { tpm, provider })
    }

    fn ek_pub(&mut self) -> Result<Vec<u8>, Box<dyn Error>> {
        Ok(certify::ek_pub(&mut self.tpm)?)
    }

    fn gather_evidence(
        &mut self,
        blob: &ImportBlob,
        nonce: &[u8],
    ) -> Result<SevSnpSvsmAttestation, Box<dyn Error>> {
        let options = SvsmOptions {
            blob,
            ak_algorithm: AkAlgorithm::Ecc,
            tee_nonce: nonce,
        };
        Ok(make_svsm_attestation(
            &mut self.tpm,
            &mut self.provider,
            &options,
        )?)
    }
}

#[derive(Default)]
struct RelyingParty {
    nonce: Vec<u8>,
    secret: Option<Secret>,
}

impl RelyingParty {
    pub fn request_secret(
        &mut self,
        ek_pub: &[u8],
    ) -> Result<(ImportBlob, Vec<u8>), Box<dyn Error>> {
        let (blob, secret) = challenge::create_restricted_hmac_blob(ek_pub)?;
        self.secret = Some(secret);

        // placeholder for a real nonce, it is usually randomly generated ephemeral value.
        let nonce = [0x5a; 64].to_vec();
        self.nonce.clone_from(&nonce);
        Ok((blob, nonce))
    }

    pub fn release_secret(
        &self,
        evidence: &SevSnpSvsmAttestation,
    ) -> Result<&'static str, Box<dyn Error>> {
        let secret = self.secret.as_ref().ok_or("no challenge issued")?;
        let snp = SnpVerifyOptions::default();
        verify_svsm_attestation(&VerifySvsmOptions {
            attestation: evidence,
            tee_nonce: &self.nonce,
            secret: secret.as_ref(),
            snp: Some(&snp),
        })?;
        Ok("secret")
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut attester = Attester::new()?;
    let mut rp = RelyingParty::default();
    let (blob, nonce) = rp.request_secret(&attester.ek_pub()?)?;

    let evidence = attester.gather_evidence(&blob, &nonce)?;
    let secret = rp.release_secret(&evidence)?;

    println!("Secret: {secret}");
    Ok(())
}
