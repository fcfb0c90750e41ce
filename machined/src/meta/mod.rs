//! META partition key/value store.
//!
//! The partition holds a [`ModernAdv`] at offset 0 (two 256 KiB copies) and,
//! when it is large enough, a [`LegacyAdv`] at its tail. Reads fall back to
//! the legacy table for tags missing from the modern one.
//!
//! Mutations are in-memory until [`Meta::flush`]. Every load and mutation
//! reconciles the `MetaKey` resources with the modern table; the legacy
//! table belongs to the bootloader and is not mirrored.

use crate::adv::{Adv, LegacyAdv, ModernAdv, legacy, modern};
use crate::blockdev::{BlockDevice, lock};
use crate::resources::{META_VOLUME_ID, MetaKey, State, VolumePhase};
use crate::util::blocking;
use machined_shared::{MachinedError, MachinedResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Finalizer placed on the META volume while a store is open.
pub const FINALIZER: &str = "meta";

#[derive(Debug)]
struct Tables {
    modern: ModernAdv,
    legacy: Option<LegacyAdv>,
}

#[derive(Debug)]
struct Inner {
    state: Arc<State>,
    path: PathBuf,
    parent: Option<PathBuf>,
    tables: Mutex<Tables>,
    flush_lock: Mutex<()>,
}

/// Handle to the META store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Meta {
    inner: Arc<Inner>,
}

impl Meta {
    /// Open the META partition discovered through the volume resources.
    ///
    /// Waits for the META volume to settle; a missing volume is reported as
    /// [`MachinedError::NoMetaPartition`].
    pub async fn open(state: Arc<State>) -> MachinedResult<Self> {
        let volume = state
            .wait_for_volume_phase(
                META_VOLUME_ID,
                &[VolumePhase::Ready, VolumePhase::Missing, VolumePhase::Closed],
            )
            .await?;

        // Registered before the phase check: a missing volume may still turn
        // up later and must not be torn down under us.
        state.volumes.add_finalizer(META_VOLUME_ID, FINALIZER)?;

        if volume.phase != VolumePhase::Ready {
            return Err(MachinedError::NoMetaPartition);
        }

        let parent = (!volume.parent_location.is_empty()).then(|| PathBuf::from(&volume.parent_location));
        Self::load(state, PathBuf::from(volume.location), parent).await
    }

    /// Open a META image at a known path, bypassing volume discovery.
    pub async fn with_fixed_path(state: Arc<State>, path: impl Into<PathBuf>) -> MachinedResult<Self> {
        Self::load(state, path.into(), None).await
    }

    async fn load(state: Arc<State>, path: PathBuf, parent: Option<PathBuf>) -> MachinedResult<Self> {
        let tables = {
            let path = path.clone();
            let parent = parent.clone();
            blocking(move || read_tables(&path, parent.as_deref())).await?
        };

        let meta = Self {
            inner: Arc::new(Inner {
                state,
                path,
                parent,
                tables: Mutex::new(tables),
                flush_lock: Mutex::new(()),
            }),
        };
        meta.sync_resources();
        info!(path = %meta.inner.path.display(), tags = ?meta.list_tags(), "META loaded");
        Ok(meta)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn read_tag(&self, tag: u8) -> Option<String> {
        self.read_tag_bytes(tag)
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn read_tag_bytes(&self, tag: u8) -> Option<Vec<u8>> {
        let tables = self.inner.tables.lock();
        tables
            .modern
            .read_tag_bytes(tag)
            .or_else(|| tables.legacy.as_ref().and_then(|l| l.read_tag_bytes(tag)))
    }

    pub fn set_tag(&self, tag: u8, value: &str) -> MachinedResult<()> {
        self.set_tag_bytes(tag, value.as_bytes())
    }

    /// Set a tag in memory. Visible to readers immediately, persisted on flush.
    pub fn set_tag_bytes(&self, tag: u8, value: &[u8]) -> MachinedResult<()> {
        self.inner.tables.lock().modern.set_tag_bytes(tag, value)?;
        self.inner
            .state
            .meta_keys
            .put(MetaKey::new(tag, String::from_utf8_lossy(value)));
        Ok(())
    }

    /// Delete a tag from both tables. Returns `false` if it was absent.
    pub fn delete_tag(&self, tag: u8) -> MachinedResult<bool> {
        let deleted = {
            let mut tables = self.inner.tables.lock();
            let modern = tables.modern.delete_tag(tag);
            let legacy = tables
                .legacy
                .as_mut()
                .map(|l| l.delete_tag(tag))
                .unwrap_or(false);
            modern || legacy
        };

        if deleted {
            let id = MetaKey::id_for(tag);
            if self.inner.state.meta_keys.get(&id).is_some() {
                self.inner.state.meta_keys.destroy(&id)?;
            }
        }
        Ok(deleted)
    }

    /// Tags present in either table, ascending.
    pub fn list_tags(&self) -> Vec<u8> {
        let tables = self.inner.tables.lock();
        let mut tags: BTreeSet<u8> = tables.modern.list_tags().into_iter().collect();
        if let Some(legacy) = &tables.legacy {
            tags.extend(legacy.list_tags());
        }
        tags.into_iter().collect()
    }

    /// Persist both tables under an exclusive lock on the parent device.
    pub async fn flush(&self) -> MachinedResult<()> {
        let meta = self.clone();
        blocking(move || meta.flush_blocking()).await
    }

    fn flush_blocking(&self) -> MachinedResult<()> {
        let _serialized = self.inner.flush_lock.lock();
        let _guard = match &self.inner.parent {
            Some(parent) => Some(lock(parent, true)?),
            None => None,
        };

        let (modern_bytes, legacy_bytes) = {
            let tables = self.inner.tables.lock();
            (tables.modern.bytes(), tables.legacy.as_ref().map(|l| l.bytes()))
        };

        let mut device = BlockDevice::open(&self.inner.path).map_err(|e| {
            if Path::new(&self.inner.path).exists() {
                e
            } else {
                MachinedError::NoMetaPartition
            }
        })?;
        let file = device.file_mut();

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&modern_bytes)?;

        if let Some(legacy_bytes) = legacy_bytes {
            file.seek(SeekFrom::End(-(legacy_bytes.len() as i64)))?;
            file.write_all(&legacy_bytes)?;
        }

        file.sync_all()?;
        debug!(path = %self.inner.path.display(), "META flushed");
        Ok(())
    }

    /// Re-read the partition under a shared lock and reconcile resources.
    ///
    /// Tags set in memory but not flushed yet are carried over onto the
    /// freshly read modern table.
    pub async fn reload(&self) -> MachinedResult<()> {
        let path = self.inner.path.clone();
        let parent = self.inner.parent.clone();
        let mut loaded = blocking(move || read_tables(&path, parent.as_deref())).await?;

        {
            let mut tables = self.inner.tables.lock();
            for tag in tables.modern.list_tags() {
                if let Some(value) = tables.modern.read_tag_bytes(tag) {
                    loaded.modern.set_tag_bytes(tag, &value)?;
                }
            }
            *tables = loaded;
        }

        self.sync_resources();
        Ok(())
    }

    /// Create, update and destroy `MetaKey` resources to match the modern
    /// table.
    fn sync_resources(&self) {
        let present: Vec<(u8, String)> = {
            let tables = self.inner.tables.lock();
            tables
                .modern
                .list_tags()
                .into_iter()
                .filter_map(|tag| tables.modern.read_tag(tag).map(|v| (tag, v)))
                .collect()
        };

        let keys = &self.inner.state.meta_keys;
        for (tag, value) in &present {
            let key = MetaKey::new(*tag, value.clone());
            if keys.get(&key.id).as_ref() != Some(&key) {
                keys.put(key);
            }
        }

        let wanted: BTreeSet<String> = present.iter().map(|(t, _)| MetaKey::id_for(*t)).collect();
        for id in keys.ids() {
            if !wanted.contains(&id)
                && let Err(e) = keys.destroy(&id)
            {
                warn!(id, error = %e, "Failed to destroy orphaned META key");
            }
        }
    }
}

fn read_tables(path: &Path, parent: Option<&Path>) -> MachinedResult<Tables> {
    let _guard = match parent {
        Some(parent) => Some(lock(parent, false)?),
        None => None,
    };

    let device = BlockDevice::open_read_only(path)?;
    let size = device.size()?;
    let mut file = device.into_file();

    let mut buf = vec![0u8; 2 * modern::SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    let modern = ModernAdv::parse(&buf)?;

    let legacy = if size >= (2 * modern::SIZE + 2 * legacy::SIZE) as u64 {
        match LegacyAdv::load(&mut file) {
            Ok(adv) => Some(adv),
            Err(e) => {
                debug!(error = %e, "No legacy ADV on META");
                None
            }
        }
    } else {
        None
    };

    Ok(Tables { modern, legacy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::tags;
    use crate::resources::VolumeStatus;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn image_with(adv: &ModernAdv, size: usize) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        let mut data = adv.bytes();
        data.resize(size, 0);
        std::fs::write(tmp.path(), data).unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_set_flush_reopen() {
        let tmp = image_with(&ModernAdv::new(), 2 * modern::SIZE);
        let state = Arc::new(State::new());

        let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();
        meta.set_tag(tags::UPGRADE, "B").unwrap();
        meta.set_tag(tags::USER_RESERVED_1, "hello").unwrap();
        assert_eq!(state.meta_keys.get("0x06").unwrap().value, "B");
        meta.flush().await.unwrap();

        let reopened = Meta::with_fixed_path(Arc::new(State::new()), tmp.path())
            .await
            .unwrap();
        assert_eq!(reopened.read_tag(tags::UPGRADE).as_deref(), Some("B"));
        assert_eq!(reopened.list_tags(), vec![tags::UPGRADE, tags::USER_RESERVED_1]);
    }

    #[tokio::test]
    async fn test_delete_updates_mirror() {
        let mut adv = ModernAdv::new();
        adv.set_tag(tags::UPGRADE, "A").unwrap();
        let tmp = image_with(&adv, 2 * modern::SIZE);
        let state = Arc::new(State::new());

        let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();
        assert!(state.meta_keys.get("0x06").is_some());
        assert!(meta.delete_tag(tags::UPGRADE).unwrap());
        assert!(!meta.delete_tag(tags::UPGRADE).unwrap());
        assert!(state.meta_keys.get("0x06").is_none());
    }

    #[tokio::test]
    async fn test_reload_keeps_unflushed_tags() {
        let mut adv = ModernAdv::new();
        adv.set_tag(tags::USER_RESERVED_1, "on-disk").unwrap();
        let tmp = image_with(&adv, 2 * modern::SIZE);
        let state = Arc::new(State::new());
        let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();

        meta.set_tag(tags::USER_RESERVED_2, "unflushed").unwrap();
        meta.reload().await.unwrap();

        assert_eq!(meta.read_tag(tags::USER_RESERVED_2).as_deref(), Some("unflushed"));
        assert_eq!(meta.read_tag(tags::USER_RESERVED_1).as_deref(), Some("on-disk"));
        assert_eq!(state.meta_keys.get("0x0d").unwrap().value, "unflushed");
    }

    #[tokio::test]
    async fn test_reload_destroys_orphans() {
        let tmp = image_with(&ModernAdv::new(), 2 * modern::SIZE);
        let state = Arc::new(State::new());
        let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();

        // Neither on disk nor in memory.
        state.meta_keys.put(MetaKey::new(tags::USER_RESERVED_3, "stale"));

        meta.reload().await.unwrap();
        assert!(state.meta_keys.get("0x0e").is_none());
        assert!(state.meta_keys.ids().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_tail_fallback() {
        let size = 1024 * 1024;
        let tmp = image_with(&ModernAdv::new(), size);
        {
            let mut legacy = LegacyAdv::new();
            legacy.set_tag(tags::UPGRADE, "A").unwrap();
            let mut file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(tmp.path())
                .unwrap();
            legacy.store(&mut file).unwrap();
        }

        let state = Arc::new(State::new());
        let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();
        assert_eq!(meta.read_tag(tags::UPGRADE).as_deref(), Some("A"));
        // The bootloader's table is readable but not mirrored.
        assert!(state.meta_keys.get("0x06").is_none());
        assert!(state.meta_keys.ids().is_empty());
        assert!(meta.delete_tag(tags::UPGRADE).unwrap());
        meta.flush().await.unwrap();

        let reopened = Meta::with_fixed_path(Arc::new(State::new()), tmp.path())
            .await
            .unwrap();
        assert_eq!(reopened.read_tag(tags::UPGRADE), None);
    }

    #[tokio::test]
    async fn test_open_waits_for_volume_and_adds_finalizer() {
        let tmp = image_with(&ModernAdv::new(), 2 * modern::SIZE);
        let state = Arc::new(State::new());
        state
            .volumes
            .create(VolumeStatus {
                id: META_VOLUME_ID.to_string(),
                phase: VolumePhase::Waiting,
                location: tmp.path().to_string_lossy().into_owned(),
                parent_location: String::new(),
            })
            .unwrap();

        let opener = tokio::spawn(Meta::open(state.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut ready = state.volumes.get(META_VOLUME_ID).unwrap();
        ready.phase = VolumePhase::Ready;
        state.volumes.update(ready).unwrap();

        opener.await.unwrap().unwrap();
        assert_eq!(state.volumes.finalizers(META_VOLUME_ID), vec![FINALIZER]);
    }

    #[tokio::test]
    async fn test_open_missing_volume() {
        let state = Arc::new(State::new());
        state
            .volumes
            .create(VolumeStatus {
                id: META_VOLUME_ID.to_string(),
                phase: VolumePhase::Missing,
                location: String::new(),
                parent_location: String::new(),
            })
            .unwrap();

        let err = Meta::open(state.clone()).await.unwrap_err();
        assert!(matches!(err, MachinedError::NoMetaPartition));
        assert_eq!(state.volumes.finalizers(META_VOLUME_ID), vec![FINALIZER]);
    }
}
