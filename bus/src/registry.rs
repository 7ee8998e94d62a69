//! Mapping from bus device numbers to attached device objects and their
//! per-device bus state.

use crate::device::{Device, FastLoad, Loader};
use crate::MAX_DEVICES;
use alloc::boxed::Box;
use alloc::vec::Vec;
use ferriec_shared::flags::LoaderFlags;

pub struct DeviceEntry {
    devnr: u8,
    active: bool,
    fl_enabled: u8,
    pub(crate) fl_flags: LoaderFlags,
    pub(crate) fl_protocol: Option<FastLoad>,
    pub(crate) dev: Box<dyn Device>,
}

impl DeviceEntry {
    pub fn devnr(&self) -> u8 {
        self.devnr
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Deactivated devices stay attached but stop responding on the bus.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn loader_enabled(&self, loader: Loader) -> bool {
        self.fl_enabled & loader.mask() != 0
    }

    pub(crate) fn set_loader_enabled(&mut self, loader: Loader, enable: bool) {
        if enable {
            self.fl_enabled |= loader.mask();
        } else {
            self.fl_enabled &= !loader.mask();
        }
    }

    pub fn active_protocol(&self) -> Option<FastLoad> {
        self.fl_protocol
    }

    pub fn loader_flags(&self) -> LoaderFlags {
        self.fl_flags
    }

    pub fn device_mut(&mut self) -> &mut dyn Device {
        &mut *self.dev
    }
}

/// The devices attached to one bus handler.
///
/// At most one entry per device number; lookups by number skip deactivated
/// entries unless asked otherwise.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            entries: Vec::with_capacity(4),
        }
    }

    /// Attach `dev` as device number `devnr`. Fails when the registry is
    /// full or the number is already taken (even by an inactive device).
    pub fn attach(&mut self, devnr: u8, dev: Box<dyn Device>) -> Result<(), Box<dyn Device>> {
        if self.entries.len() >= MAX_DEVICES || devnr > 30 || self.index_of(devnr, true).is_some()
        {
            return Err(dev);
        }
        self.entries.push(DeviceEntry {
            devnr,
            active: true,
            fl_enabled: 0,
            fl_flags: LoaderFlags::new(),
            fl_protocol: None,
            dev,
        });
        Ok(())
    }

    /// Detach the device with number `devnr`, returning it. Bus-visible
    /// state is unaffected beyond the entry's removal, so an attach/detach
    /// pair is a no-op.
    pub fn detach(&mut self, devnr: u8) -> Option<Box<dyn Device>> {
        let idx = self.index_of(devnr, true)?;
        Some(self.entries.swap_remove(idx).dev)
    }

    pub(crate) fn index_of(&self, devnr: u8, include_inactive: bool) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.devnr == devnr && (include_inactive || e.active))
    }

    pub fn get(&self, devnr: u8) -> Option<&DeviceEntry> {
        self.index_of(devnr, false).map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, devnr: u8) -> Option<&mut DeviceEntry> {
        self.index_of(devnr, false).map(move |i| &mut self.entries[i])
    }

    pub(crate) fn entry(&mut self, idx: usize) -> &mut DeviceEntry {
        &mut self.entries[idx]
    }

    pub(crate) fn device(&mut self, idx: usize) -> &mut dyn Device {
        &mut *self.entries[idx].dev
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceEntry> {
        self.entries.iter_mut()
    }

    /// Whether any attached device has a parallel-cable loader enabled.
    pub fn any_parallel_loader(&self) -> bool {
        self.entries.iter().any(|e| {
            e.loader_enabled(Loader::Dolphin) || e.loader_enabled(Loader::SpeedDos)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Device;

    struct Dummy;
    impl Device for Dummy {}

    #[test]
    fn attach_rejects_duplicates() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.attach(8, Box::new(Dummy)).is_ok());
        assert!(reg.attach(8, Box::new(Dummy)).is_err());
        assert!(reg.attach(9, Box::new(Dummy)).is_ok());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn attach_detach_roundtrip() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.attach(8, Box::new(Dummy)).is_ok());
        assert!(reg.detach(8).is_some());
        assert!(reg.get(8).is_none());
        assert!(reg.attach(8, Box::new(Dummy)).is_ok());
    }

    #[test]
    fn inactive_devices_are_skipped() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.attach(8, Box::new(Dummy)).is_ok());
        reg.get_mut(8).expect("attached").set_active(false);
        assert!(reg.get(8).is_none());
        assert!(reg.index_of(8, true).is_some());
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.attach(31, Box::new(Dummy)).is_err());
    }
}
