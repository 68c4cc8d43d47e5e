//! Driver Loader
//!
//! Materializes a classic driver image from the resource provider. Sources
//! are tried in a fixed order:
//!
//! 1. `DRVR` resource by explicit id
//! 2. `DRVR` resource by name
//! 3. Slot ROM (no expansion ROMs are simulated, so this never hits)
//! 4. Scan of every `DRVR` resource for a matching header name
//! 5. Synthesized template, if the configuration allows it
//!
//! A resource found by id or name that fails validation is reported as an
//! install failure rather than falling through to later sources.

use log::{debug, warn};

use crate::device::driver::ClassicDriver;
use crate::device::resource::{ResourceHandle, ResourceProvider};
use crate::device::stats::Counter;
use crate::device::DeviceManager;
use crate::error::{DeviceError, DeviceResult};
use crate::types::{RefNum, DRVR};

/// Where a loaded image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Resource id given by the caller
    ResourceId(i16),
    /// Resource found by name, with its id
    ResourceName(i16),
    SlotRom,
    /// Found while scanning, with its resource id
    IndexedScan(i16),
    /// Synthesized
    Template,
}

/// Loaded driver image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDriver {
    pub image: ClassicDriver,
    pub source: LoadSource,
}

/// Loader statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderStats {
    pub attempts: u64,
    pub loaded: u64,
    pub failures: u64,
    /// Resources rejected as malformed
    pub validation_failures: u64,
    pub not_found: u64,
}

/// Driver image loader
#[derive(Debug)]
pub struct DriverLoader {
    synthesize: bool,
    attempts: Counter,
    loaded: Counter,
    failures: Counter,
    validation_failures: Counter,
    not_found: Counter,
}

impl DriverLoader {
    pub const fn new(synthesize: bool) -> Self {
        Self {
            synthesize,
            attempts: Counter::new("attempts"),
            loaded: Counter::new("loaded"),
            failures: Counter::new("failures"),
            validation_failures: Counter::new("validation_failures"),
            not_found: Counter::new("not_found"),
        }
    }

    /// Load the image for `name`, trying each source in turn
    pub fn load(
        &self,
        resources: &mut dyn ResourceProvider,
        name: &[u8],
        res_id: Option<i16>,
    ) -> DeviceResult<LoadedDriver> {
        self.attempts.inc();
        if name.is_empty() || name.len() > u8::MAX as usize {
            self.failures.inc();
            return Err(DeviceError::InvalidParameter);
        }

        if let Some(id) = res_id {
            if let Some(handle) = resources.get(DRVR, id) {
                if let Some(loaded) = self.accept(resources, handle, None, LoadSource::ResourceId(id)) {
                    return loaded;
                }
            }
        }

        if let Some(handle) = resources.get_named(DRVR, name) {
            let id = resources.id(handle).unwrap_or(0);
            if let Some(loaded) = self.accept(resources, handle, Some(name), LoadSource::ResourceName(id)) {
                return loaded;
            }
        }

        if let Some(image) = self.load_from_slot_rom(name) {
            self.loaded.inc();
            return Ok(LoadedDriver {
                image,
                source: LoadSource::SlotRom,
            });
        }

        if let Some(loaded) = self.scan(resources, name) {
            return Ok(loaded);
        }

        if self.synthesize {
            let image = ClassicDriver::template(name).inspect_err(|_| self.failures.inc())?;
            self.loaded.inc();
            debug!("synthesized driver image for {:?}", core::str::from_utf8(name));
            return Ok(LoadedDriver {
                image,
                source: LoadSource::Template,
            });
        }

        self.not_found.inc();
        self.failures.inc();
        Err(DeviceError::ResourceNotFound)
    }

    /// Validate a resource found by id or name. A header name that does not
    /// match yields `None` so later sources are tried.
    fn accept(
        &self,
        resources: &mut dyn ResourceProvider,
        handle: ResourceHandle,
        expect: Option<&[u8]>,
        source: LoadSource,
    ) -> Option<DeviceResult<LoadedDriver>> {
        let parsed = resources
            .data(handle)
            .map_or(Err(DeviceError::InstallFailed), ClassicDriver::parse);
        match parsed {
            Err(e) => {
                resources.release(handle);
                self.validation_failures.inc();
                self.failures.inc();
                warn!("malformed driver resource ({:?}): {}", source, e);
                Some(Err(DeviceError::InstallFailed))
            }
            Ok(image) if expect.is_some_and(|n| image.name() != n) => {
                resources.release(handle);
                None
            }
            Ok(image) => {
                resources.detach(handle);
                self.loaded.inc();
                Some(Ok(LoadedDriver { image, source }))
            }
        }
    }

    fn load_from_slot_rom(&self, _name: &[u8]) -> Option<ClassicDriver> {
        None
    }

    /// Walk every driver resource looking for a header name match
    fn scan(&self, resources: &mut dyn ResourceProvider, name: &[u8]) -> Option<LoadedDriver> {
        let count = resources.count(DRVR);
        for index in 1..=count {
            let Some(handle) = resources.get_indexed(DRVR, index) else {
                continue;
            };
            let parsed = resources.data(handle).map(ClassicDriver::parse);
            match parsed {
                Some(Ok(image)) if image.name() == name => {
                    let id = resources.id(handle).unwrap_or(0);
                    resources.detach(handle);
                    self.loaded.inc();
                    return Some(LoadedDriver {
                        image,
                        source: LoadSource::IndexedScan(id),
                    });
                }
                Some(Err(_)) => {
                    self.validation_failures.inc();
                    resources.release(handle);
                }
                _ => resources.release(handle),
            }
        }
        None
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            attempts: self.attempts.get(),
            loaded: self.loaded.get(),
            failures: self.failures.get(),
            validation_failures: self.validation_failures.get(),
            not_found: self.not_found.get(),
        }
    }
}

// ============================================================================
// Device Manager Loading Interface
// ============================================================================

impl DeviceManager {
    /// Load an image without installing it
    pub fn load_driver(&self, name: &str, res_id: Option<i16>) -> DeviceResult<LoadedDriver> {
        self.ensure_initialized()?;
        let mut resources = self.resources.lock();
        self.loader.load(resources.as_mut(), name.as_bytes(), res_id)
    }

    /// Load an image and install it
    pub fn load_and_install(
        &self,
        name: &str,
        res_id: Option<i16>,
        ref_num: Option<RefNum>,
    ) -> DeviceResult<RefNum> {
        let loaded = self.load_driver(name, res_id)?;
        debug!("loaded {} from {:?}", name, loaded.source);
        self.install_classic(loaded.image, ref_num)
    }

    /// Open a driver by name, loading and installing it first if needed
    pub fn open_driver(&self, name: &str) -> DeviceResult<RefNum> {
        self.ensure_initialized()?;
        let installed = self.units.lock().find_by_name(name.as_bytes());
        let ref_num = match installed {
            Some(ref_num) => ref_num,
            None => self.load_and_install(name, None, None)?,
        };
        self.open_device(ref_num)?;
        Ok(ref_num)
    }

    pub fn loader_stats(&self) -> LoaderStats {
        self.loader.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::driver::EntryOffsets;
    use crate::device::resource::ResourceMap;

    fn image(name: &[u8]) -> alloc::vec::Vec<u8> {
        ClassicDriver::template(name).unwrap().to_bytes()
    }

    #[test]
    fn test_explicit_id_first() {
        let mut map = ResourceMap::new()
            .with_resource(DRVR, 12, b".Sony", image(b".Sony"))
            .with_resource(DRVR, 40, b"", image(b".Sony"));
        let loader = DriverLoader::new(false);
        let loaded = loader.load(&mut map, b".Sony", Some(40)).unwrap();
        assert_eq!(loaded.source, LoadSource::ResourceId(40));
        assert_eq!(map.detached_count(), 1);
    }

    #[test]
    fn test_name_then_scan() {
        let mut map = ResourceMap::new()
            .with_resource(DRVR, 3, b".Named", image(b".Named"))
            .with_resource(DRVR, 7, b"", image(b".Hidden"));
        let loader = DriverLoader::new(false);
        assert_eq!(
            loader.load(&mut map, b".Named", None).unwrap().source,
            LoadSource::ResourceName(3)
        );
        assert_eq!(
            loader.load(&mut map, b".Hidden", None).unwrap().source,
            LoadSource::IndexedScan(7)
        );
        assert_eq!(map.loaded_count(), 0);
    }

    #[test]
    fn test_named_mismatch_falls_through() {
        let mut map = ResourceMap::new().with_resource(DRVR, 3, b".Alias", image(b".Real"));
        let loader = DriverLoader::new(true);
        let loaded = loader.load(&mut map, b".Alias", None).unwrap();
        assert_eq!(loaded.source, LoadSource::Template);
        assert_eq!(loaded.image.name(), b".Alias");
    }

    #[test]
    fn test_malformed_resource_reported() {
        let mut map = ResourceMap::new().with_resource(DRVR, 5, b".Bad", alloc::vec![0; 4]);
        let loader = DriverLoader::new(true);
        assert_eq!(
            loader.load(&mut map, b".Bad", Some(5)),
            Err(DeviceError::InstallFailed)
        );
        let stats = loader.stats();
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(map.loaded_count(), 0);
    }

    #[test]
    fn test_scan_skips_invalid_images() {
        let mut bad = ClassicDriver::template(b".X").unwrap().to_bytes();
        bad.truncate(10);
        let good = ClassicDriver::new(
            b".Y",
            0,
            EntryOffsets {
                open: 0x20,
                ..Default::default()
            },
            alloc::vec![0; 8],
        )
        .unwrap()
        .to_bytes();
        let mut map = ResourceMap::new()
            .with_resource(DRVR, 1, b"", bad)
            .with_resource(DRVR, 2, b"", good);
        let loader = DriverLoader::new(false);
        assert_eq!(
            loader.load(&mut map, b".Y", None).unwrap().source,
            LoadSource::IndexedScan(2)
        );
        assert_eq!(loader.stats().validation_failures, 1);
    }

    #[test]
    fn test_not_found_without_template() {
        let mut map = ResourceMap::new();
        let loader = DriverLoader::new(false);
        assert_eq!(
            loader.load(&mut map, b".Gone", None),
            Err(DeviceError::ResourceNotFound)
        );
        assert_eq!(loader.load(&mut map, b"", None), Err(DeviceError::InvalidParameter));
        let stats = loader.stats();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.failures, 2);
    }
}
