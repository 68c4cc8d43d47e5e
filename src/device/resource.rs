//! Resource provider
//!
//! The driver loader materializes driver images from typed, numbered and
//! optionally named resources. Indexed access is 1-based.

use alloc::vec::Vec;

use crate::types::ResType;

/// Handle to a loaded resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

/// Source of typed resources
pub trait ResourceProvider: Send {
    /// Load a resource by type and id
    fn get(&mut self, res_type: ResType, id: i16) -> Option<ResourceHandle>;

    /// Load a resource by type and resource name
    fn get_named(&mut self, res_type: ResType, name: &[u8]) -> Option<ResourceHandle>;

    /// Load the `index`th resource of a type (1-based)
    fn get_indexed(&mut self, res_type: ResType, index: u16) -> Option<ResourceHandle>;

    /// Number of resources of a type
    fn count(&self, res_type: ResType) -> u16;

    /// Resource id of a loaded resource
    fn id(&self, handle: ResourceHandle) -> Option<i16>;

    /// Contents of a loaded resource
    fn data(&self, handle: ResourceHandle) -> Option<&[u8]>;

    /// Drop a loaded resource from the cache
    fn release(&mut self, handle: ResourceHandle);

    /// Take ownership of the contents; the cache forgets the handle
    fn detach(&mut self, handle: ResourceHandle) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct Resource {
    res_type: ResType,
    id: i16,
    name: Vec<u8>,
    data: Vec<u8>,
    loaded: bool,
}

/// In-memory resource map
#[derive(Debug, Default)]
pub struct ResourceMap {
    resources: Vec<Resource>,
    detached: usize,
}

impl ResourceMap {
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
            detached: 0,
        }
    }

    /// Add a resource, replacing any with the same type and id
    pub fn add(&mut self, res_type: ResType, id: i16, name: &[u8], data: Vec<u8>) {
        self.resources
            .retain(|r| !(r.res_type == res_type && r.id == id));
        self.resources.push(Resource {
            res_type,
            id,
            name: name.to_vec(),
            data,
            loaded: false,
        });
    }

    pub fn with_resource(mut self, res_type: ResType, id: i16, name: &[u8], data: Vec<u8>) -> Self {
        self.add(res_type, id, name, data);
        self
    }

    /// Number of resources currently loaded into the cache
    pub fn loaded_count(&self) -> usize {
        self.resources.iter().filter(|r| r.loaded).count()
    }

    /// Number of detach calls served
    pub fn detached_count(&self) -> usize {
        self.detached
    }

    fn load(&mut self, position: usize) -> ResourceHandle {
        self.resources[position].loaded = true;
        ResourceHandle(position as u32 + 1)
    }

    fn position(&self, handle: ResourceHandle) -> Option<usize> {
        let position = (handle.0 as usize).checked_sub(1)?;
        self.resources
            .get(position)
            .filter(|r| r.loaded)
            .map(|_| position)
    }
}

impl ResourceProvider for ResourceMap {
    fn get(&mut self, res_type: ResType, id: i16) -> Option<ResourceHandle> {
        let position = self
            .resources
            .iter()
            .position(|r| r.res_type == res_type && r.id == id)?;
        Some(self.load(position))
    }

    fn get_named(&mut self, res_type: ResType, name: &[u8]) -> Option<ResourceHandle> {
        let position = self
            .resources
            .iter()
            .position(|r| r.res_type == res_type && !r.name.is_empty() && r.name == name)?;
        Some(self.load(position))
    }

    fn get_indexed(&mut self, res_type: ResType, index: u16) -> Option<ResourceHandle> {
        let nth = usize::from(index).checked_sub(1)?;
        let position = self
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.res_type == res_type)
            .nth(nth)
            .map(|(position, _)| position)?;
        Some(self.load(position))
    }

    fn count(&self, res_type: ResType) -> u16 {
        let n = self
            .resources
            .iter()
            .filter(|r| r.res_type == res_type)
            .count();
        n.min(u16::MAX as usize) as u16
    }

    fn id(&self, handle: ResourceHandle) -> Option<i16> {
        self.position(handle).map(|p| self.resources[p].id)
    }

    fn data(&self, handle: ResourceHandle) -> Option<&[u8]> {
        self.position(handle)
            .map(|p| self.resources[p].data.as_slice())
    }

    fn release(&mut self, handle: ResourceHandle) {
        if let Some(p) = self.position(handle) {
            self.resources[p].loaded = false;
        }
    }

    fn detach(&mut self, handle: ResourceHandle) -> Option<Vec<u8>> {
        let p = self.position(handle)?;
        let resource = &mut self.resources[p];
        resource.loaded = false;
        self.detached += 1;
        Some(resource.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DRVR;

    fn map() -> ResourceMap {
        ResourceMap::new()
            .with_resource(DRVR, 4, b".Sony", vec![1, 2, 3])
            .with_resource(*b"CODE", 1, b"", vec![9])
            .with_resource(DRVR, 9, b".Serial", vec![4, 5])
    }

    #[test]
    fn test_get_by_id_and_name() {
        let mut m = map();
        let h = m.get(DRVR, 4).unwrap();
        assert_eq!(m.data(h), Some(&[1u8, 2, 3][..]));
        assert_eq!(m.id(h), Some(4));
        let h = m.get_named(DRVR, b".Serial").unwrap();
        assert_eq!(m.id(h), Some(9));
        assert!(m.get(DRVR, 5).is_none());
        assert!(m.get_named(DRVR, b".Nope").is_none());
    }

    #[test]
    fn test_indexed_is_one_based_and_typed() {
        let mut m = map();
        assert_eq!(m.count(DRVR), 2);
        assert!(m.get_indexed(DRVR, 0).is_none());
        let first = m.get_indexed(DRVR, 1).unwrap();
        let second = m.get_indexed(DRVR, 2).unwrap();
        assert_eq!(m.id(first), Some(4));
        assert_eq!(m.id(second), Some(9));
        assert!(m.get_indexed(DRVR, 3).is_none());
    }

    #[test]
    fn test_release_and_detach() {
        let mut m = map();
        let h = m.get(DRVR, 4).unwrap();
        assert_eq!(m.loaded_count(), 1);
        assert_eq!(m.detach(h), Some(vec![1, 2, 3]));
        assert_eq!(m.loaded_count(), 0);
        assert_eq!(m.detached_count(), 1);
        assert!(m.data(h).is_none());

        let h = m.get(DRVR, 9).unwrap();
        m.release(h);
        assert_eq!(m.loaded_count(), 0);
    }
}
