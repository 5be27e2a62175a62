//! The set of devices tracked across poll cycles
use crate::{Device, VbdId};

/// Tracked devices, unique by [`VbdId`].
///
/// Removal leaves a vacant slot behind instead of shifting the remaining
/// devices, so positions stay stable while a [`Registry::sweep`] is in
/// progress.  Vacant slots are reused by later insertions.
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Option<Device>>,
    len: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn position(&self, id: VbdId) -> Option<usize> {
        self.slots.iter()
            .position(|s| s.as_ref().map(|d| d.id() == id).unwrap_or(false))
    }

    pub fn find(&self, id: VbdId) -> Option<&Device> {
        self.position(id).and_then(|i| self.slots[i].as_ref())
    }

    pub fn find_mut(&mut self, id: VbdId) -> Option<&mut Device> {
        match self.position(id) {
            Some(i) => self.slots[i].as_mut(),
            None => None
        }
    }

    /// Start tracking `device`.
    ///
    /// If a device with the same id is already tracked, `device` is dropped
    /// (releasing its binding) and `false` is returned.
    pub fn insert(&mut self, device: Device) -> bool {
        if self.position(device.id()).is_some() {
            return false;
        }
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(vacant) => *vacant = Some(device),
            None => self.slots.push(Some(device))
        }
        self.len += 1;
        true
    }

    /// Stop tracking the device with this id, releasing its binding before
    /// returning.  Returns `false` if no such device was tracked.
    pub fn remove(&mut self, id: VbdId) -> bool {
        match self.position(id) {
            Some(i) => {
                drop(self.slots[i].take());
                self.len -= 1;
                true
            }
            None => false
        }
    }

    /// Remove and release every device.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<VbdId> {
        self.iter().map(Device::id).collect()
    }

    /// Visit every device exactly once, evicting those for which `f` returns
    /// `false`.
    ///
    /// An evicted device is released immediately, before the next device is
    /// visited.  Returns the number of evicted devices.
    pub fn sweep<F>(&mut self, mut f: F) -> usize
        where F: FnMut(&mut Device) -> bool
    {
        let mut evicted = 0;
        for slot in self.slots.iter_mut() {
            let keep = match slot.as_mut() {
                Some(device) => f(device),
                None => continue
            };
            if !keep {
                drop(slot.take());
                evicted += 1;
            }
        }
        self.len -= evicted;
        evicted
    }
}
