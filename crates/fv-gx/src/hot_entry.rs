//! One-entry fast path in front of the program map
//!
//! Consecutive draws usually share their pipeline state, so the signature of
//! the previous lookup is compared before walking the map. The slot holds a
//! copy of the native id, never the owning entry; the cache invalidates it
//! whenever entries are dropped.

use crate::backend::ProgramId;

#[derive(Debug)]
pub struct HotEntry<K> {
    slot: Option<(K, ProgramId)>,
    enabled: bool,
}

impl<K: PartialEq + Copy> HotEntry<K> {
    pub fn new(enabled: bool) -> Self {
        Self {
            slot: None,
            enabled,
        }
    }

    /// Program of the previous lookup, if `key` equals its signature
    #[inline]
    pub fn lookup(&self, key: &K) -> Option<ProgramId> {
        if !self.enabled {
            return None;
        }
        match &self.slot {
            Some((hot_key, id)) if hot_key == key => Some(*id),
            _ => None,
        }
    }

    /// Remember the latest resolution. Key and id always change together.
    #[inline]
    pub fn update(&mut self, key: K, id: ProgramId) {
        self.slot = Some((key, id));
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }

    /// Signature and program of the most recent resolution
    pub fn current(&self) -> Option<(K, ProgramId)> {
        self.slot
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.slot = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
