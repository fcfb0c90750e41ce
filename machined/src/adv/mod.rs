//! Auxiliary Data Vector: a small tag/value table persisted next to the
//! bootloader and on the META partition.
//!
//! Two on-disk dialects exist:
//!
//! - [`legacy::LegacyAdv`]: the syslinux ADV, 512 bytes stored twice at the
//!   tail of `ldlinux.sys`. Tags and lengths are single bytes.
//! - [`modern::ModernAdv`]: 256 KiB stored twice, sha256 checksummed, with
//!   32-bit tags and sizes.
//!
//! Both keep two redundant copies; a load accepts the first copy that
//! validates.

pub mod legacy;
pub mod modern;

use machined_shared::MachinedResult;

pub use legacy::LegacyAdv;
pub use modern::ModernAdv;

/// Well-known tags.
pub mod tags {
    /// Terminates the tag list.
    pub const END: u8 = 0;
    /// Label booted once after an upgrade; cleared on a successful boot.
    pub const UPGRADE: u8 = 0x06;
    pub const STAGED_UPGRADE_IMAGE_REF: u8 = 0x07;
    pub const STAGED_UPGRADE_INSTALL_OPTIONS: u8 = 0x08;
    pub const STATE_ENCRYPTION_CONFIG: u8 = 0x09;
    pub const METAL_NETWORK_PLATFORM_CONFIG: u8 = 0x0a;
    pub const DOWNLOAD_URL_CODE: u8 = 0x0b;
    pub const USER_RESERVED_1: u8 = 0x0c;
    pub const USER_RESERVED_2: u8 = 0x0d;
    pub const USER_RESERVED_3: u8 = 0x0e;
}

/// Tag store operations shared by both dialects.
pub trait Adv: Send + Sync {
    /// Value of `tag` as a string, if present.
    fn read_tag(&self, tag: u8) -> Option<String> {
        self.read_tag_bytes(tag)
            .map(|value| String::from_utf8_lossy(&value).into_owned())
    }

    /// Raw value of `tag`, if present.
    fn read_tag_bytes(&self, tag: u8) -> Option<Vec<u8>>;

    /// Set `tag` to a string value.
    fn set_tag(&mut self, tag: u8, value: &str) -> MachinedResult<()> {
        self.set_tag_bytes(tag, value.as_bytes())
    }

    /// Set `tag`, replacing any previous value.
    ///
    /// Fails without modifying the store when the value does not fit.
    fn set_tag_bytes(&mut self, tag: u8, value: &[u8]) -> MachinedResult<()>;

    /// Remove `tag`. Returns `false` when it was not present.
    fn delete_tag(&mut self, tag: u8) -> bool;

    /// Tags currently present, in storage order.
    fn list_tags(&self) -> Vec<u8>;

    /// Serialized form: both redundant copies, back to back.
    fn bytes(&self) -> Vec<u8>;
}
