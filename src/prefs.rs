//! Persisted sink-device preference
//!
//! A small fixed-layout binary record at a well-known path: the
//! last-known sink address followed by its opaque pairing-settings
//! blob. Absence of the file is valid and means "no preferred device
//! yet". The record is persisted only when dirtied.
//!
//! Trust boundary: at load the transport's authoritative pairing record
//! wins over the locally-cached one; at runtime (`set_address`) the
//! local view is updated from whatever the transport reports for the
//! newly connected address. The asymmetry is deliberate.

use crate::address::{DeviceAddress, ADDRESS_LEN};
use crate::error::{Error, Result};
use crate::services::transport::{PairingRecord, TransportDriver, PAIRING_SETTINGS_LEN};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// On-disk record length: address bytes plus settings blob
pub const RECORD_LEN: usize = ADDRESS_LEN + PAIRING_SETTINGS_LEN;

/// Persisted device-preference record
pub struct PreferenceStore {
    path: PathBuf,
    record: PairingRecord,
}

impl PreferenceStore {
    /// Load the persisted record and reconcile it with the transport's
    /// authoritative pairing store.
    ///
    /// If the transport holds a record for the loaded address, that
    /// record is adopted and re-persisted when it differs. Otherwise a
    /// non-empty loaded record is pushed into the transport's pairing
    /// store so the sink stays pairable across transport resets.
    pub fn load(path: PathBuf, transport: &mut dyn TransportDriver) -> Result<Self> {
        let mut store = PreferenceStore {
            path,
            record: PairingRecord::empty(),
        };

        let bytes = match std::fs::read(&store.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no preference record at {}", store.path.display());
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        let loaded = parse_record(&bytes)
            .ok_or_else(|| Error::Preference(format!("truncated record: {} bytes", bytes.len())))?;

        let mut needs_update = false;

        match transport.paired_device_settings(loaded.addr) {
            Ok(Some(current)) => {
                needs_update = current != loaded;
                store.record = current;
            }
            Ok(None) | Err(_) => {
                store.record = loaded;
                if !store.record.is_empty() {
                    // Transport lost the pairing; re-register our copy.
                    transport.register_paired_device(&store.record)?;
                }
            }
        }

        if needs_update {
            info!("adopting transport pairing record for {}", store.record.addr);
            store.save()?;
        }

        Ok(store)
    }

    /// Last-known sink address, if any
    pub fn address(&self) -> Option<DeviceAddress> {
        if self.record.addr.is_empty() {
            None
        } else {
            Some(self.record.addr)
        }
    }

    pub fn settings(&self) -> &[u8] {
        &self.record.settings
    }

    /// Record a newly connected sink as the preferred device.
    ///
    /// Reads the transport's current settings for the address; persists
    /// immediately when either the address or the settings changed.
    pub fn set_address(&mut self, addr: DeviceAddress, transport: &mut dyn TransportDriver) -> Result<()> {
        let mut dirty = addr != self.record.addr;

        match transport.paired_device_settings(addr) {
            Ok(Some(current)) => {
                dirty = dirty || current != self.record;
                self.record = current;
            }
            // The address must be remembered even before the transport
            // has a pairing record for it; keep the cached settings.
            Ok(None) => self.record.addr = addr,
            Err(e) => {
                warn!("pairing lookup for {addr} failed: {e}");
                self.record.addr = addr;
            }
        }

        if dirty {
            self.save()?;
        }
        Ok(())
    }

    /// Serialize the fixed-layout record to stable storage
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(RECORD_LEN);
        bytes.extend_from_slice(self.record.addr.as_bytes());
        bytes.extend_from_slice(&self.record.settings);
        std::fs::write(&self.path, bytes)?;

        debug!("saved preference record to {}", self.path.display());
        Ok(())
    }
}

fn parse_record(bytes: &[u8]) -> Option<PairingRecord> {
    if bytes.len() < RECORD_LEN {
        return None;
    }

    let mut addr = [0u8; ADDRESS_LEN];
    addr.copy_from_slice(&bytes[..ADDRESS_LEN]);

    let mut settings = [0u8; PAIRING_SETTINGS_LEN];
    settings.copy_from_slice(&bytes[ADDRESS_LEN..RECORD_LEN]);

    Some(PairingRecord {
        addr: DeviceAddress(addr),
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sim::SimTransport;

    fn record_for(addr: DeviceAddress, fill: u8) -> PairingRecord {
        PairingRecord {
            addr,
            settings: [fill; PAIRING_SETTINGS_LEN],
        }
    }

    #[test]
    fn test_absent_file_means_no_preferred_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = SimTransport::new();

        let store =
            PreferenceStore::load(dir.path().join("settings.bin"), &mut transport).unwrap();
        assert_eq!(store.address(), None);
    }

    #[test]
    fn test_set_address_persists_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);

        let mut transport = SimTransport::new();
        transport.insert_pairing(record_for(addr, 0xab));

        let mut store = PreferenceStore::load(path.clone(), &mut transport).unwrap();
        store.set_address(addr, &mut transport).unwrap();
        assert_eq!(store.address(), Some(addr));

        // Simulated restart
        let reloaded = PreferenceStore::load(path, &mut transport).unwrap();
        assert_eq!(reloaded.address(), Some(addr));
        assert_eq!(reloaded.settings(), &[0xab; PAIRING_SETTINGS_LEN]);
    }

    #[test]
    fn test_load_adopts_authoritative_transport_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);

        // Persist a stale local record
        let stale = PreferenceStore {
            path: path.clone(),
            record: record_for(addr, 0x01),
        };
        stale.save().unwrap();

        // The transport holds a newer record for the same address
        let mut transport = SimTransport::new();
        transport.insert_pairing(record_for(addr, 0x02));

        let store = PreferenceStore::load(path.clone(), &mut transport).unwrap();
        assert_eq!(store.settings(), &[0x02; PAIRING_SETTINGS_LEN]);

        // The adopted record was re-persisted
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[ADDRESS_LEN], 0x02);
    }

    #[test]
    fn test_load_pushes_local_record_into_empty_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let addr = DeviceAddress([9, 8, 7, 6, 5, 4]);

        let local = PreferenceStore {
            path: path.clone(),
            record: record_for(addr, 0x33),
        };
        local.save().unwrap();

        let mut transport = SimTransport::new();
        let ctl = transport.clone();

        PreferenceStore::load(path, &mut transport).unwrap();
        assert_eq!(ctl.pairing_record(addr), Some(record_for(addr, 0x33)));
    }

    #[test]
    fn test_set_address_without_pairing_record_still_remembers_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);

        // The transport has no pairing record for the sink yet
        let mut transport = SimTransport::new();

        let mut store = PreferenceStore::load(path.clone(), &mut transport).unwrap();
        store.set_address(addr, &mut transport).unwrap();
        assert_eq!(store.address(), Some(addr));

        // The address survives a restart so reconnect attempts can use it
        let reloaded = PreferenceStore::load(path, &mut transport).unwrap();
        assert_eq!(reloaded.address(), Some(addr));
    }

    #[test]
    fn test_set_address_skips_save_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        let addr = DeviceAddress([1, 2, 3, 4, 5, 6]);

        let mut transport = SimTransport::new();
        transport.insert_pairing(record_for(addr, 0xab));

        let mut store = PreferenceStore::load(path.clone(), &mut transport).unwrap();
        store.set_address(addr, &mut transport).unwrap();

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        store.set_address(addr, &mut transport).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            modified
        );
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut transport = SimTransport::new();
        assert!(PreferenceStore::load(path, &mut transport).is_err());
    }
}
