//! Persisted program store
//!
//! One file per program stage holding compiled bytecode keyed by signature
//! bytes. Bytecode only makes sense for the driver that produced it, so the
//! file carries the backend's driver fingerprint and is thrown away whole
//! when anything about it does not check out. A CRC32 over the entry block
//! catches bit flips that leave the layout intact.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic u32 | version u32 | signature size u32 | fingerprint len u32 | fingerprint bytes
//! crc32 u32 (of everything after it)
//! count u32 | count * (signature bytes | bytecode len u32 | bytecode bytes)
//! ```

use crate::signature::ProgramKey;
use fv_core::StoreError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Store magic number
const STORE_MAGIC: u32 = 0x4350_5646; // "FVPC"
const STORE_VERSION: u32 = 2;

/// A loaded or to-be-saved (signature, bytecode) pair
pub type StoreEntry<K> = (K, Vec<u8>);

/// Little-endian cursor over a store file
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], StoreError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(StoreError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Program store for one stage
#[derive(Debug, Clone)]
pub struct ProgramStore {
    path: PathBuf,
}

impl ProgramStore {
    /// Store for key type `K` inside `dir`
    pub fn for_key<K: ProgramKey>(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("{}.cache", K::STORE_TAG)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read every entry written under `fingerprint`.
    ///
    /// Entries with an empty payload are returned as-is; rejecting them is
    /// up to the cache.
    pub fn load<K: ProgramKey>(&self, fingerprint: &str) -> Result<Vec<StoreEntry<K>>, StoreError> {
        let data = fs::read(&self.path)?;
        Self::parse(&data, fingerprint)
    }

    fn parse<K: ProgramKey>(data: &[u8], fingerprint: &str) -> Result<Vec<StoreEntry<K>>, StoreError> {
        let mut reader = Reader::new(data);

        let magic = reader.u32()?;
        if magic != STORE_MAGIC {
            return Err(StoreError::BadMagic(magic));
        }
        let version = reader.u32()?;
        if version != STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: version,
            });
        }
        let sig_size = reader.u32()? as usize;
        if sig_size != std::mem::size_of::<K>() {
            return Err(StoreError::SignatureSize {
                expected: std::mem::size_of::<K>(),
                found: sig_size,
            });
        }

        let fp_len = reader.u32()? as usize;
        let found = String::from_utf8_lossy(reader.bytes(fp_len)?).into_owned();
        if found != fingerprint {
            return Err(StoreError::FingerprintMismatch {
                expected: fingerprint.to_string(),
                found,
            });
        }

        let stored = reader.u32()?;
        let computed = crc32fast::hash(reader.rest());
        if stored != computed {
            return Err(StoreError::ChecksumMismatch { stored, computed });
        }

        let count = reader.u32()? as usize;
        // Every entry takes at least its signature and length word
        let max_entries = reader.remaining() / (sig_size + 4);
        let mut entries = Vec::with_capacity(count.min(max_entries));
        for _ in 0..count {
            let key: K = bytemuck::pod_read_unaligned(reader.bytes(sig_size)?);
            let len = reader.u32()? as usize;
            let bytecode = reader.bytes(len)?.to_vec();
            entries.push((key, bytecode));
        }

        if reader.remaining() != 0 {
            return Err(StoreError::TrailingData(reader.remaining()));
        }

        Ok(entries)
    }

    /// Replace the store with `entries`, written to a temporary file first
    pub fn save<'a, K, I>(&self, fingerprint: &str, entries: I) -> Result<usize, StoreError>
    where
        K: ProgramKey,
        I: IntoIterator<Item = (&'a K, &'a [u8])>,
    {
        let mut body = vec![0u8; 4];
        let mut count: u32 = 0;
        for (key, bytecode) in entries {
            if bytecode.is_empty() {
                continue;
            }
            body.extend_from_slice(bytemuck::bytes_of(key));
            body.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
            body.extend_from_slice(bytecode);
            count += 1;
        }
        body[..4].copy_from_slice(&count.to_le_bytes());

        let mut data = Vec::with_capacity(body.len() + 24 + fingerprint.len());
        data.extend_from_slice(&STORE_MAGIC.to_le_bytes());
        data.extend_from_slice(&STORE_VERSION.to_le_bytes());
        data.extend_from_slice(&(std::mem::size_of::<K>() as u32).to_le_bytes());
        data.extend_from_slice(&(fingerprint.len() as u32).to_le_bytes());
        data.extend_from_slice(fingerprint.as_bytes());
        data.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        data.extend_from_slice(&body);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("cache.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(count as usize)
    }

    /// Delete the store file
    pub fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove program store {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::VertexSignature;
    use bytemuck::Zeroable;
    use std::env;

    fn key(n: u32) -> VertexSignature {
        let mut sig = VertexSignature::zeroed();
        sig.components = n;
        sig
    }

    /// Recompute the checksum after editing a saved file by hand
    fn restamp(data: &mut [u8], fingerprint: &str) {
        let at = 16 + fingerprint.len();
        let crc = crc32fast::hash(&data[at + 4..]);
        data[at..at + 4].copy_from_slice(&crc.to_le_bytes());
    }

    fn temp_store(name: &str) -> (PathBuf, ProgramStore) {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        let store = ProgramStore::for_key::<VertexSignature>(&dir);
        (dir, store)
    }

    #[test]
    fn test_store_roundtrip() {
        let (dir, store) = temp_store("fv_store_roundtrip");
        let (a, b) = (key(1), key(2));
        let entries = vec![(&a, &b"first"[..]), (&b, &b"second"[..])];

        assert_eq!(store.save("null sm5", entries).unwrap(), 2);
        let loaded = store.load::<VertexSignature>("null sm5").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], (a, b"first".to_vec()));
        assert_eq!(loaded[1], (b, b"second".to_vec()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fingerprint_mismatch() {
        let (dir, store) = temp_store("fv_store_fingerprint");
        let a = key(1);
        store.save("driver A", vec![(&a, &b"code"[..])]).unwrap();

        let err = store.load::<VertexSignature>("driver B").unwrap_err();
        assert!(matches!(err, StoreError::FingerprintMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_data() {
        let bad_magic = [0u8; 32];
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&bad_magic, "x"),
            Err(StoreError::BadMagic(0))
        ));

        let (dir, store) = temp_store("fv_store_corrupt");
        let a = key(1);
        store.save("x", vec![(&a, &b"code"[..])]).unwrap();
        let mut data = fs::read(store.path()).unwrap();

        let mut truncated = data.clone();
        truncated.truncate(data.len() - 2);
        restamp(&mut truncated, "x");
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&truncated, "x"),
            Err(StoreError::Truncated(_))
        ));

        data.push(0xAA);
        restamp(&mut data, "x");
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&data, "x"),
            Err(StoreError::TrailingData(1))
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bit_flip_is_rejected() {
        let (dir, store) = temp_store("fv_store_bitflip");
        let (a, b) = (key(1), key(2));
        store
            .save("x", vec![(&a, &b"first"[..]), (&b, &b"second"[..])])
            .unwrap();
        let clean = fs::read(store.path()).unwrap();

        // Same length, one bit off in the last bytecode
        let mut flipped = clean.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&flipped, "x"),
            Err(StoreError::ChecksumMismatch { .. })
        ));

        // And one in a signature
        let mut flipped = clean.clone();
        let first_key = 16 + 1 + 4 + 4;
        flipped[first_key] ^= 0x80;
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&flipped, "x"),
            Err(StoreError::ChecksumMismatch { .. })
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_huge_count_does_not_overallocate() {
        let (dir, store) = temp_store("fv_store_count");
        store.save::<VertexSignature, _>("x", Vec::new()).unwrap();
        let mut data = fs::read(store.path()).unwrap();
        let len = data.len();
        data[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        restamp(&mut data, "x");
        assert!(matches!(
            ProgramStore::parse::<VertexSignature>(&data, "x"),
            Err(StoreError::Truncated(_))
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let (_dir, store) = temp_store("fv_store_missing");
        assert!(!store.exists());
        assert!(matches!(store.load::<VertexSignature>("x"), Err(StoreError::Io(_))));
    }
}
