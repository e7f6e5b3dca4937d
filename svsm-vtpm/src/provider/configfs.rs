// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reports from the Linux configfs-tsm interface.

use super::{ProviderError, ReportProvider, ReportRequest, ReportResponse};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

pub const TSM_REPORT_PATH: &str = "/sys/kernel/config/tsm/report";

static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct ConfigfsProvider {
    root: PathBuf,
}

impl ConfigfsProvider {
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_path(TSM_REPORT_PATH)
    }

    pub fn with_path(root: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ProviderError::Unavailable(root));
        }
        Ok(ConfigfsProvider { root })
    }
}

/// A report entry directory, removed when dropped.
struct ReportEntry {
    path: PathBuf,
}

impl ReportEntry {
    fn create(root: &Path) -> Result<Self, ProviderError> {
        let id = ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = root.join(format!("svsm-vtpm-{}-{id}", process::id()));
        fs::create_dir(&path)?;
        debug!("created report entry {}", path.display());
        Ok(ReportEntry { path })
    }

    fn write(&self, attribute: &str, value: &[u8]) -> io::Result<()> {
        fs::write(self.path.join(attribute), value)
    }

    fn read(&self, attribute: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path.join(attribute))
    }

    /// Reads an attribute that older kernels or other providers may not expose.
    fn read_optional(&self, attribute: &str) -> io::Result<Vec<u8>> {
        match self.read(attribute) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(vec![]),
            result => result,
        }
    }

    fn generation(&self) -> Result<u64, ProviderError> {
        parse_generation(&self.read("generation")?)
    }
}

impl Drop for ReportEntry {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("failed to remove report entry {}: {e}", self.path.display());
        }
    }
}

fn parse_generation(bytes: &[u8]) -> Result<u64, ProviderError> {
    let generation = String::from_utf8_lossy(bytes).trim().parse()?;
    Ok(generation)
}

/// Every attribute write bumps the generation once. Anything else means another writer
/// touched the entry.
fn check_generation(initial: u64, writes: usize, found: u64) -> Result<(), ProviderError> {
    let expected = initial + writes as u64;
    if found != expected {
        return Err(ProviderError::Conflict { expected, found });
    }
    Ok(())
}

impl ReportProvider for ConfigfsProvider {
    fn get_report(&mut self, request: &ReportRequest<'_>) -> Result<ReportResponse, ProviderError> {
        if request.inblob.len() > crate::REPORT_DATA_SIZE {
            return Err(ProviderError::InblobTooLarge(request.inblob.len()));
        }

        let mut attributes = vec![];
        if let Some(service_provider) = request.service_provider {
            attributes.push(("service_provider", service_provider.as_bytes().to_vec()));
        }
        if let Some(guid) = request.service_guid {
            attributes.push(("service_guid", guid.to_string().into_bytes()));
        }
        if let Some(level) = request.privilege_level {
            attributes.push(("privlevel", level.to_string().into_bytes()));
        }
        attributes.push(("inblob", request.inblob.to_vec()));

        let entry = ReportEntry::create(&self.root)?;
        let initial = entry.generation()?;
        for (attribute, value) in &attributes {
            entry.write(attribute, value)?;
        }

        let out_blob = entry.read("outblob")?;
        let aux_blob = entry.read_optional("auxblob")?;
        let manifest_blob = entry.read_optional("manifestblob")?;
        let provider = entry.read_optional("provider")?;

        check_generation(initial, attributes.len(), entry.generation()?)?;

        debug!(
            "read {} byte report from provider {}",
            out_blob.len(),
            String::from_utf8_lossy(&provider).trim()
        );
        Ok(ReportResponse {
            out_blob,
            aux_blob,
            manifest_blob,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::env;

    #[test]
    fn missing_root_is_unavailable() {
        let root = env::temp_dir().join("svsm-vtpm-no-such-tsm");
        let result = ConfigfsProvider::with_path(&root);
        assert!(matches!(result, Err(ProviderError::Unavailable(path)) if path == root));
    }

    #[test]
    fn oversized_inblob_is_rejected_before_entry_creation() {
        let root = env::temp_dir().join(format!("svsm-vtpm-tsm-{}", process::id()));
        fs::create_dir_all(&root).unwrap();
        let mut provider = ConfigfsProvider::with_path(&root).unwrap();

        let inblob = [0; 65];
        let result = provider.get_report(&ReportRequest::new(&inblob));
        assert!(matches!(result, Err(ProviderError::InblobTooLarge(65))));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn entry_without_generation_is_removed() {
        let root = env::temp_dir().join(format!("svsm-vtpm-tsm-attrs-{}", process::id()));
        fs::create_dir_all(&root).unwrap();
        let mut provider = ConfigfsProvider::with_path(&root).unwrap();

        // a plain directory has no generation attribute, so nothing is written
        let request = ReportRequest::svsm_vtpm(&[0x11; 64]).with_privilege_level(2);
        let result = provider.get_report(&request);
        assert!(matches!(result, Err(ProviderError::Io(_))));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);

        fs::remove_dir_all(&root).unwrap();
    }

    #[rstest]
    #[case(3, 4, 7, None)]
    #[case(0, 1, 1, None)]
    #[case(3, 4, 3, Some(7))]
    #[case(3, 4, 8, Some(7))]
    fn generation_counts_every_write(
        #[case] initial: u64,
        #[case] writes: usize,
        #[case] found: u64,
        #[case] conflict: Option<u64>,
    ) {
        let result = check_generation(initial, writes, found);
        match conflict {
            None => result.unwrap(),
            Some(expected) => assert!(matches!(
                result,
                Err(ProviderError::Conflict { expected: e, found: f })
                    if e == expected && f == found
            )),
        }
    }

    #[rstest]
    #[case(b"1\n", 1)]
    #[case(b" 42 ", 42)]
    fn generation_is_parsed(#[case] bytes: &[u8], #[case] expected: u64) {
        assert_eq!(parse_generation(bytes).unwrap(), expected);
    }

    #[test]
    fn garbage_generation_is_rejected() {
        assert!(matches!(
            parse_generation(b"x"),
            Err(ProviderError::Generation(_))
        ));
    }
}
