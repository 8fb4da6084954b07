//! Program cache
//!
//! Maps signatures to native programs. Lookups try the hot entry, then the
//! ordered map, and only then generate source and compile. Compiled bytecode
//! is kept beside each program so the map can be written back to the store,
//! and the next session starts warm without compiling anything.
//!
//! The cache is owned by the render thread and takes the backend by
//! reference on every call that touches native objects.

use crate::backend::{GraphicsBackend, OwnedProgram, ProgramId};
use crate::hot_entry::HotEntry;
use crate::signature::ProgramKey;
use crate::store::ProgramStore;
use crate::utility::UtilityPrograms;
use fv_core::{Result, StoreError, VideoError};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Construction options, usually derived from the config
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Directory of the persisted store; `None` keeps the cache in memory only
    pub store_dir: Option<PathBuf>,
    pub hot_path: bool,
    /// Write each generated source here before compiling it
    pub dump_dir: Option<PathBuf>,
}

/// Lookup and compile counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub map_hits: u64,
    pub misses: u64,
    pub compiles: u64,
    pub failures: u64,
    /// Entries restored from the store
    pub precompiled: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hot_hits + self.map_hits + self.misses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Uninitialized,
    Ready,
    ShutDown,
}

/// One compiled program and the bytecode it was created from
struct ProgramEntry {
    program: OwnedProgram,
    bytecode: Vec<u8>,
}

/// Program cache for one stage
pub struct ProgramCache<K: ProgramKey> {
    entries: BTreeMap<K, ProgramEntry>,
    hot: HotEntry<K>,
    utilities: UtilityPrograms<K::Utility>,
    store: Option<ProgramStore>,
    dump_dir: Option<PathBuf>,
    fingerprint: String,
    state: CacheState,
    stats: CacheStats,
    /// Sample count used for multisampled utility variants
    samples: u32,
    /// Entries compiled since the store was last written
    dirty: bool,
}

impl<K: ProgramKey> ProgramCache<K> {
    pub fn new(options: &CacheOptions) -> Self {
        Self {
            entries: BTreeMap::new(),
            hot: HotEntry::new(options.hot_path),
            utilities: UtilityPrograms::new(K::STAGE),
            store: options.store_dir.as_deref().map(ProgramStore::for_key::<K>),
            dump_dir: options.dump_dir.clone(),
            fingerprint: String::new(),
            state: CacheState::Uninitialized,
            stats: CacheStats::default(),
            samples: 1,
            dirty: false,
        }
    }

    /// Bind the cache to `backend` and load the persisted store.
    ///
    /// Returns the number of programs restored. Calling it again while
    /// initialized does nothing.
    pub fn init<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> usize {
        if self.state == CacheState::Ready {
            return 0;
        }
        self.fingerprint = backend.driver_fingerprint();
        self.state = CacheState::Ready;
        self.load_store(backend)
    }

    pub fn is_ready(&self) -> bool {
        self.state == CacheState::Ready
    }

    fn load_store<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> usize {
        let Some(store) = self.store.clone() else {
            return 0;
        };

        let entries = match store.load::<K>(&self.fingerprint) {
            Ok(entries) => entries,
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No {} program store at {}, cold start", K::STORE_TAG, store.path().display());
                return 0;
            }
            Err(e) => {
                tracing::warn!("Discarding {} program store: {}", K::STORE_TAG, e);
                store.discard();
                return 0;
            }
        };

        let total = entries.len();
        let mut loaded = 0;
        for (index, (key, bytecode)) in entries.into_iter().enumerate() {
            if bytecode.is_empty() {
                tracing::warn!("{}", StoreError::EmptyProgram(index));
                continue;
            }
            if self.insert_precompiled(key, &bytecode, backend) {
                loaded += 1;
            }
        }

        self.stats.precompiled += loaded as u64;
        tracing::info!("Loaded {}/{} {} programs from {}", loaded, total, K::STORE_TAG, store.path().display());
        loaded
    }

    /// Program for `key`, compiling it on a miss.
    ///
    /// A compile failure leaves no entry behind, so the next call with the
    /// same key tries again.
    pub fn resolve<B: GraphicsBackend + ?Sized>(&mut self, key: &K, backend: &mut B) -> Result<ProgramId> {
        if self.state != CacheState::Ready {
            return Err(VideoError::NotInitialized);
        }

        if let Some(id) = self.hot.lookup(key) {
            self.stats.hot_hits += 1;
            return Ok(id);
        }

        if let Some(entry) = self.entries.get(key) {
            let id = entry.program.id();
            self.stats.map_hits += 1;
            self.hot.update(*key, id);
            return Ok(id);
        }

        self.stats.misses += 1;
        let source = key.generate_source();
        self.dump_source(&source);

        self.stats.compiles += 1;
        let compiled = backend
            .compile_program(K::STAGE, &source)
            .and_then(|bytecode| {
                backend
                    .create_program(K::STAGE, &bytecode)
                    .map(|id| (id, bytecode))
            });
        let (id, bytecode) = match compiled {
            Ok(compiled) => compiled,
            Err(e) => {
                self.stats.failures += 1;
                tracing::warn!("Failed to compile {} program: {}", K::STORE_TAG, e);
                return Err(VideoError::ProgramCompilation(e));
            }
        };

        tracing::debug!(
            "Compiled {} program {:?} ({} bytes), {} cached",
            K::STORE_TAG,
            id,
            bytecode.len(),
            self.entries.len() + 1
        );
        let program = OwnedProgram::new(id, backend.retire_queue());
        self.entries.insert(*key, ProgramEntry { program, bytecode });
        self.hot.update(*key, id);
        self.dirty = true;
        Ok(id)
    }

    /// Add a program from previously compiled bytecode.
    ///
    /// An empty payload counts as a failed compile and is dropped. Replacing
    /// an existing key retires the old program.
    pub fn insert_precompiled<B: GraphicsBackend + ?Sized>(&mut self, key: K, bytecode: &[u8], backend: &mut B) -> bool {
        if self.state != CacheState::Ready || bytecode.is_empty() {
            return false;
        }

        let id = match backend.create_program(K::STAGE, bytecode) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Rejected precompiled {} program: {}", K::STORE_TAG, e);
                return false;
            }
        };

        let entry = ProgramEntry {
            program: OwnedProgram::new(id, backend.retire_queue()),
            bytecode: bytecode.to_vec(),
        };
        if self.entries.insert(key, entry).is_some() && self.hot.current().map(|(k, _)| k) == Some(key) {
            self.hot.invalidate();
        }
        true
    }

    /// Utility program of `kind`, compiled on first use
    pub fn get_utility_program<B: GraphicsBackend + ?Sized>(
        &mut self,
        kind: K::Utility,
        multisampled: bool,
        backend: &mut B,
    ) -> Result<ProgramId> {
        if self.state != CacheState::Ready {
            return Err(VideoError::NotInitialized);
        }
        self.utilities.get(kind, multisampled, self.samples, backend)
    }

    /// Switch the sample count, dropping multisampled utility variants
    pub fn invalidate_multisample_variants(&mut self, samples: u32) -> usize {
        self.samples = samples.max(1);
        let dropped = self.utilities.invalidate_multisampled();
        if dropped > 0 {
            tracing::debug!("Dropped {} multisampled {} utility programs", dropped, K::STORE_TAG);
        }
        dropped
    }

    /// Drop every program. Unsaved bytecode is written to the store first.
    ///
    /// Native programs go to the backend's retire queue.
    pub fn clear(&mut self) {
        self.flush_store();
        self.hot.invalidate();
        self.entries.clear();
        self.utilities.clear();
    }

    /// Clear, then rebind to the backend's current fingerprint and reload
    /// the store
    pub fn reload<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> usize {
        if self.state != CacheState::Ready {
            return 0;
        }
        self.clear();
        self.fingerprint = backend.driver_fingerprint();
        self.load_store(backend)
    }

    /// Persist, drop everything and refuse further lookups. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state != CacheState::Ready {
            return;
        }
        self.clear();
        self.state = CacheState::ShutDown;
        tracing::debug!("{} program cache shut down", K::STORE_TAG);
    }

    /// Write the store if anything was compiled since the last write.
    ///
    /// Returns the number of entries written.
    pub fn flush_store(&mut self) -> Option<usize> {
        if !self.dirty || self.state != CacheState::Ready {
            return None;
        }
        let store = self.store.as_ref()?;
        self.dirty = false;

        let entries = self
            .entries
            .iter()
            .map(|(key, entry)| (key, entry.bytecode.as_slice()));
        match store.save(&self.fingerprint, entries) {
            Ok(count) => {
                tracing::debug!("Wrote {} {} programs to {}", count, K::STORE_TAG, store.path().display());
                Some(count)
            }
            Err(e) => {
                tracing::warn!("Could not write {} program store: {}", K::STORE_TAG, e);
                None
            }
        }
    }

    fn dump_source(&self, source: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("{}_{:05}.glsl", K::STORE_TAG, self.stats.compiles));
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, source)) {
            tracing::warn!("Could not dump program source to {}: {}", path.display(), e);
        }
    }

    pub fn set_hot_path_enabled(&mut self, enabled: bool) {
        self.hot.set_enabled(enabled);
    }

    /// Signature and program of the most recent resolution
    pub fn hot_entry(&self) -> Option<(K, ProgramId)> {
        self.hot.current()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn utility_count(&self) -> usize {
        self.utilities.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref().map(|store| store.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::signature::{PixelSignature, VertexSignature};
    use crate::state::{GxState, BP_TEV_COLOR_ENV_BASE};
    use crate::utility::PixelUtility;
    use bytemuck::Zeroable;

    fn ready() -> (NullBackend, ProgramCache<PixelSignature>) {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut cache = ProgramCache::new(&CacheOptions {
            hot_path: true,
            ..Default::default()
        });
        cache.init(&mut backend);
        (backend, cache)
    }

    fn sig(color_env: u32) -> PixelSignature {
        let mut state = GxState::new();
        state.write_bp(BP_TEV_COLOR_ENV_BASE, color_env);
        PixelSignature::from_state(&state, false)
    }

    #[test]
    fn test_resolve_before_init() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut cache = ProgramCache::<PixelSignature>::new(&CacheOptions::default());
        assert!(matches!(cache.resolve(&sig(1), &mut backend), Err(VideoError::NotInitialized)));
    }

    #[test]
    fn test_distinct_signatures_distinct_programs() {
        let (mut backend, mut cache) = ready();
        let a = cache.resolve(&sig(0x08_F8AF), &mut backend).unwrap();
        let b = cache.resolve(&sig(0x08_F8AE), &mut backend).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
        assert_eq!(backend.compile_count(), 2);
    }

    #[test]
    fn test_repeated_resolve_never_recompiles() {
        let (mut backend, mut cache) = ready();
        let a = sig(0x08_F8AF);
        let b = sig(0x08_F8AE);

        let first = cache.resolve(&a, &mut backend).unwrap();
        cache.resolve(&b, &mut backend).unwrap();
        for _ in 0..10 {
            assert_eq!(cache.resolve(&a, &mut backend).unwrap(), first);
        }
        assert_eq!(backend.compile_count(), 2);

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        // First repeat comes from the map, the rest from the hot entry
        assert_eq!(stats.map_hits, 1);
        assert_eq!(stats.hot_hits, 9);
        assert_eq!(stats.lookups(), 12);
    }

    #[test]
    fn test_hot_path_equivalence() {
        let keys = [sig(1), sig(2), sig(2), sig(3), sig(1), sig(1), sig(2)];

        let (mut hot_backend, mut hot_cache) = ready();
        let (mut cold_backend, mut cold_cache) = ready();
        cold_cache.set_hot_path_enabled(false);

        let hot: Vec<ProgramId> = keys.iter().map(|k| hot_cache.resolve(k, &mut hot_backend).unwrap()).collect();
        let cold: Vec<ProgramId> = keys.iter().map(|k| cold_cache.resolve(k, &mut cold_backend).unwrap()).collect();

        assert_eq!(hot, cold);
        assert_eq!(cold_cache.stats().hot_hits, 0);
        assert!(hot_cache.stats().hot_hits > 0);
        assert_eq!(hot_backend.compile_count(), cold_backend.compile_count());
    }

    #[test]
    fn test_compile_failure_is_retried() {
        let (mut backend, mut cache) = ready();
        let key = sig(0x08_F8AF);
        backend.set_compile_failure(Some("color_env=08f8af"));

        assert!(matches!(cache.resolve(&key, &mut backend), Err(VideoError::ProgramCompilation(_))));
        assert!(!cache.contains(&key));
        assert_eq!(cache.stats().failures, 1);

        backend.set_compile_failure(None);
        assert!(cache.resolve(&key, &mut backend).is_ok());
        assert_eq!(backend.compile_count(), 2);
    }

    #[test]
    fn test_insert_precompiled() {
        let (mut backend, mut cache) = ready();
        let key = sig(5);
        assert!(!cache.insert_precompiled(key, &[], &mut backend));
        assert!(!cache.contains(&key));

        let bytecode = backend
            .compile_program(crate::backend::ShaderStage::PIXEL, &key.generate_source())
            .unwrap();
        assert!(cache.insert_precompiled(key, &bytecode, &mut backend));
        let first = cache.resolve(&key, &mut backend).unwrap();

        // Replacing a key retires the old program and never serves it again
        assert!(cache.insert_precompiled(key, &bytecode, &mut backend));
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.release_retired(), 1);
        assert_ne!(cache.resolve(&key, &mut backend).unwrap(), first);
    }

    #[test]
    fn test_clear_retires_everything() {
        let (mut backend, mut cache) = ready();
        cache.resolve(&sig(1), &mut backend).unwrap();
        cache.resolve(&sig(2), &mut backend).unwrap();
        cache
            .get_utility_program(PixelUtility::PassThrough, false, &mut backend)
            .unwrap();
        assert_eq!(backend.live_program_count(), 3);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hot_entry(), None);
        assert_eq!(backend.release_retired(), 3);
        assert_eq!(backend.live_program_count(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut backend, mut cache) = ready();
        cache.resolve(&sig(1), &mut backend).unwrap();
        cache.shutdown();
        cache.shutdown();
        assert!(!cache.is_ready());
        assert!(matches!(cache.resolve(&sig(1), &mut backend), Err(VideoError::NotInitialized)));
        assert!(cache.get_utility_program(PixelUtility::Clear, false, &mut backend).is_err());
    }

    #[test]
    fn test_multisample_invalidation() {
        let (mut backend, mut cache) = ready();
        cache.invalidate_multisample_variants(4);
        cache.get_utility_program(PixelUtility::ColorCopy, true, &mut backend).unwrap();
        cache.get_utility_program(PixelUtility::Clear, false, &mut backend).unwrap();
        assert_eq!(cache.utility_count(), 2);

        assert_eq!(cache.invalidate_multisample_variants(2), 1);
        assert_eq!(cache.utility_count(), 1);
    }

    #[test]
    fn test_vertex_cache() {
        let mut backend = NullBackend::new();
        backend.init().unwrap();
        let mut cache = ProgramCache::<VertexSignature>::new(&CacheOptions::default());
        cache.init(&mut backend);

        let key = VertexSignature::zeroed();
        let a = cache.resolve(&key, &mut backend).unwrap();
        assert_eq!(cache.resolve(&key, &mut backend).unwrap(), a);
        assert_eq!(backend.compile_count(), 1);
    }
}
