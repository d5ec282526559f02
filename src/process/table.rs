use super::object::{KfdProcess, ProcessRef};
use crate::mm::MmId;
use crate::sync::{Srcu, SrcuReadGuard};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Live processes keyed by address space.
///
/// Lookups run inside an SRCU read section. Creation and removal serialize on the
/// creation lock; a remover waits out a grace period before the process is torn down.
#[derive(Debug)]
pub(crate) struct ProcessTable {
    creation: Mutex<()>,
    map: RwLock<HashMap<MmId, Arc<KfdProcess>>>,
    srcu: Arc<Srcu>,
}

impl ProcessTable {
    pub fn new(srcu: Arc<Srcu>) -> Self {
        Self {
            creation: Mutex::new(()),
            map: RwLock::new(HashMap::new()),
            srcu,
        }
    }

    pub fn creation_lock(&self) -> MutexGuard<'_, ()> {
        self.creation.lock()
    }

    pub fn read_lock(&self) -> SrcuReadGuard<'_> {
        self.srcu.read_lock()
    }

    pub fn find_by_mm(&self, mm: MmId) -> Option<Arc<KfdProcess>> {
        let _read = self.srcu.read_lock();
        self.map.read().get(&mm).cloned()
    }

    /// Looks up the process of `mm` and takes a reference inside the same read
    /// section, so a process whose last reference is gone is never handed out.
    pub fn find_by_mm_ref(&self, mm: MmId) -> Option<ProcessRef> {
        let _read = self.srcu.read_lock();
        self.map.read().get(&mm).and_then(KfdProcess::get_ref)
    }

    pub fn find_by_pasid_ref(&self, pasid: u32) -> Option<ProcessRef> {
        let _read = self.srcu.read_lock();
        self.map
            .read()
            .values()
            .find(|p| p.pasid() == pasid)
            .and_then(KfdProcess::get_ref)
    }

    /// Publishes `process`. The caller holds the creation lock.
    pub fn insert(&self, mm: MmId, process: Arc<KfdProcess>) {
        self.map.write().insert(mm, process);
    }

    /// Unpublishes `process` if it is still the entry for `mm`.
    pub fn remove(&self, mm: MmId, process: &KfdProcess) {
        let _creation = self.creation.lock();
        let mut map = self.map.write();
        if map.get(&mm).is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), process)) {
            map.remove(&mm);
        }
    }

    /// Every published process, for iteration inside a read section.
    pub fn snapshot(&self) -> Vec<Arc<KfdProcess>> {
        self.map.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn clear(&self) {
        let _creation = self.creation.lock();
        self.map.write().clear();
    }
}
