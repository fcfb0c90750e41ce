//! META store round-trips against image files.

use machined::adv::{Adv, ModernAdv, modern, tags};
use machined::meta::Meta;
use machined::resources::{META_VOLUME_ID, State, VolumePhase, VolumeStatus};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn image(adv: &ModernAdv) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    let mut data = adv.bytes();
    data.resize(2 * modern::SIZE, 0);
    std::fs::write(tmp.path(), data).unwrap();
    tmp
}

#[tokio::test]
async fn test_corrupted_first_copy_is_repaired_on_flush() {
    let mut adv = ModernAdv::new();
    adv.set_tag(tags::UPGRADE, "B").unwrap();
    let tmp = image(&adv);

    // Flip a byte inside the first copy's data area.
    let mut data = std::fs::read(tmp.path()).unwrap();
    data[16] ^= 0xff;
    std::fs::write(tmp.path(), &data).unwrap();

    let state = Arc::new(State::new());
    let meta = Meta::with_fixed_path(state.clone(), tmp.path()).await.unwrap();
    assert_eq!(meta.read_tag(tags::UPGRADE).as_deref(), Some("B"));
    assert_eq!(state.meta_keys.get("0x06").unwrap().value, "B");

    meta.set_tag(tags::USER_RESERVED_2, "note").unwrap();
    meta.flush().await.unwrap();

    let data = std::fs::read(tmp.path()).unwrap();
    assert_eq!(data[..modern::SIZE], data[modern::SIZE..2 * modern::SIZE]);

    let reopened = ModernAdv::parse(&data).unwrap();
    assert_eq!(reopened.read_tag(tags::UPGRADE).as_deref(), Some("B"));
    assert_eq!(reopened.read_tag(tags::USER_RESERVED_2).as_deref(), Some("note"));
}

#[tokio::test]
async fn test_open_through_volume_discovery() {
    let tmp = image(&ModernAdv::new());
    let state = Arc::new(State::new());

    let opener = tokio::spawn(Meta::open(state.clone()));
    state.volumes.put(VolumeStatus {
        id: META_VOLUME_ID.to_string(),
        phase: VolumePhase::Ready,
        location: tmp.path().to_string_lossy().into_owned(),
        parent_location: String::new(),
    });

    let meta = opener.await.unwrap().unwrap();
    meta.set_tag(tags::UPGRADE, "A").unwrap();
    assert!(meta.delete_tag(tags::UPGRADE).unwrap());
    assert!(state.meta_keys.get("0x06").is_none());
}

#[tokio::test]
async fn test_missing_volume_reports_no_meta_partition() {
    let state = Arc::new(State::new());
    state.volumes.put(VolumeStatus {
        id: META_VOLUME_ID.to_string(),
        phase: VolumePhase::Missing,
        location: String::new(),
        parent_location: String::new(),
    });

    let err = Meta::open(state).await.unwrap_err();
    assert!(matches!(err, machined::MachinedError::NoMetaPartition));
}
