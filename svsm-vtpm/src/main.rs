// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use clap::Parser;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use svsm_vtpm::attest::{make_svsm_attestation, SvsmOptions};
use svsm_vtpm::certs;
use svsm_vtpm::provider::configfs::{ConfigfsProvider, TSM_REPORT_PATH};
use svsm_vtpm::verify::{verify_svsm_attestation, SnpVerifyOptions, VerifySvsmOptions};
use svsm_vtpm::SevSnpSvsmAttestation;
use vtpm_certify::certify;
use vtpm_certify::challenge::{self, ImportBlob};
use vtpm_certify::templates::AkAlgorithm;
use vtpm_certify::tpm::TssTpm;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand)]
enum Action {
    /// Write the marshalled public area of the vTPM's RSA EK
    EkPub {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Create a restricted HMAC key challenge for an EK
    Challenge {
        /// Marshalled EK public area
        #[arg(short, long)]
        ek: PathBuf,

        /// Where to write the challenge blob (JSON)
        #[arg(short, long)]
        blob: PathBuf,

        /// Where to write the secret, keep it private
        #[arg(short, long)]
        secret: PathBuf,
    },
    /// Answer a challenge and bind the AK to an SVSM vTPM report
    Attest {
        #[arg(short, long)]
        blob: PathBuf,

        /// 64 hex encoded bytes
        #[arg(short, long)]
        nonce: String,

        /// AK algorithm (rsa, ecc)
        #[arg(short, long, default_value = "ecc")]
        algo: AkAlgorithm,

        /// configfs-tsm report directory
        #[arg(short, long, default_value = TSM_REPORT_PATH)]
        tsm: PathBuf,

        #[arg(short, long)]
        out: PathBuf,
    },
    /// Verify an SVSM vTPM attestation
    Verify {
        #[arg(short, long)]
        attestation: PathBuf,

        #[arg(short, long)]
        secret: PathBuf,

        /// 64 hex encoded bytes
        #[arg(short, long)]
        nonce: String,

        /// Verify the certificate chain and report signature
        #[arg(long)]
        snp: bool,

        /// Pin the chain to an ASK + ARK PEM bundle, implies --snp
        #[arg(long)]
        amd_chain: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.action {
        Action::EkPub { out } => {
            let mut tpm = TssTpm::new()?;
            let ek_pub = certify::ek_pub(&mut tpm)?;
            fs::write(out, ek_pub)?;
        }
        Action::Challenge { ek, blob, secret } => {
            let (import_blob, key) = challenge::create_restricted_hmac_blob(&fs::read(ek)?)?;
            fs::write(blob, serde_json::to_vec_pretty(&import_blob)?)?;
            fs::write(secret, key.as_ref())?;
        }
        Action::Attest {
            blob,
            nonce,
            algo,
            tsm,
            out,
        } => {
            let blob: ImportBlob = serde_json::from_slice(&fs::read(blob)?)?;
            let nonce = hex::decode(nonce)?;
            let mut tpm = TssTpm::new()?;
            let mut provider = ConfigfsProvider::with_path(tsm)?;
            let options = SvsmOptions {
                blob: &blob,
                ak_algorithm: algo,
                tee_nonce: &nonce,
            };
            let attestation = make_svsm_attestation(&mut tpm, &mut provider, &options)?;
            fs::write(out, serde_json::to_vec_pretty(&attestation)?)?;
        }
        Action::Verify {
            attestation,
            secret,
            nonce,
            snp,
            amd_chain,
        } => {
            let attestation: SevSnpSvsmAttestation =
                serde_json::from_slice(&fs::read(attestation)?)?;
            let secret = fs::read(secret)?;
            let nonce = hex::decode(nonce)?;

            let snp_options = match amd_chain {
                Some(path) => Some(SnpVerifyOptions {
                    trusted_chain: Some(certs::build_cert_chain(&fs::read_to_string(path)?)?),
                }),
                None if snp => Some(SnpVerifyOptions::default()),
                None => None,
            };
            verify_svsm_attestation(&VerifySvsmOptions {
                attestation: &attestation,
                tee_nonce: &nonce,
                secret: &secret,
                snp: snp_options.as_ref(),
            })?;
            println!("attestation verified");
        }
    }

    Ok(())
}
