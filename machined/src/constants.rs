//! Paths, labels and limits shared across machined.
//!
//! Centralized location for every well-known location on the node.

/// Filesystem layout of the running system
pub mod paths {
    /// Mount point of the boot partition
    pub const BOOT_MOUNT_POINT: &str = "/boot";

    /// Mount point of the ephemeral partition
    pub const EPHEMERAL_MOUNT_POINT: &str = "/var";

    /// Mount point of the state partition
    pub const STATE_MOUNT_POINT: &str = "/system/state";

    /// Root of the writable system runtime tree
    pub const SYSTEM_RUN_PATH: &str = "/system/run";

    /// Writable `/etc` replacement files are staged here and bind mounted
    pub const SYSTEM_ETC_PATH: &str = "/system/etc";

    pub const SYSTEM_VAR_PATH: &str = "/system/var";

    /// Root for overlay upper and work directories
    pub const SYSTEM_OVERLAYS_PATH: &str = "/var/system/overlays";

    /// Persisted machine configuration
    pub const CONFIG_PATH: &str = "/system/state/config.json";

    /// Kernel log device
    pub const KMSG: &str = "/dev/kmsg";

    /// Kernel command line
    pub const PROC_CMDLINE: &str = "/proc/cmdline";

    /// Current mount table
    pub const PROC_MOUNTS: &str = "/proc/mounts";

    /// IMA policy sink
    pub const IMA_POLICY: &str = "/sys/kernel/security/ima/policy";

    /// Kubelet pod volumes
    pub const KUBELET_PODS: &str = "/var/lib/kubelet/pods";

    /// Sysctl tree
    pub const PROC_SYS: &str = "/proc/sys";

    /// Block devices as seen in sysfs
    pub const SYS_CLASS_BLOCK: &str = "/sys/class/block";

    /// Squashfs root image shipped in the initramfs
    pub const ROOTFS_IMAGE: &str = "/rootfs.sqsh";

    /// Where the initramfs assembles the real root before switching to it
    pub const NEW_ROOT: &str = "/root";
}

/// Partition labels
pub mod labels {
    pub const EFI: &str = "EFI";
    pub const BIOS: &str = "BIOS";
    pub const BOOT: &str = "BOOT";
    pub const META: &str = "META";
    pub const STATE: &str = "STATE";
    pub const EPHEMERAL: &str = "EPHEMERAL";
}

/// Partition sizes of a system disk
pub mod layout {
    const MIB: u64 = 1024 * 1024;

    pub const EFI_SIZE: u64 = 100 * MIB;
    pub const BIOS_SIZE: u64 = MIB;
    pub const BOOT_SIZE: u64 = 1000 * MIB;
    pub const META_SIZE: u64 = MIB;
    pub const STATE_SIZE: u64 = 100 * MIB;

    /// Smallest disk an install is attempted on
    pub const MIN_DISK_SIZE: u64 = 4 * 1024 * MIB;

    /// Region zeroed by a device reset (protective MBR plus primary GPT)
    pub const GPT_HEADER_REGION: u64 = 34 * 512;
}

/// GPT partition type GUIDs
pub mod gpt {
    pub const EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
    pub const LINUX_FILESYSTEM: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
}

/// Boot assets placed under `/boot/<label>/`
pub mod assets {
    pub const KERNEL: &str = "vmlinuz";
    pub const INITRAMFS: &str = "initramfs.xz";

    /// Protective MBR boot code written to LBA 0
    pub const GPTMBR: &str = "/usr/lib/syslinux/gptmbr.bin";

    /// Directory holding EFI syslinux binaries
    pub const SYSLINUX_EFI_DIR: &str = "/usr/lib/syslinux/efi64";
}

/// Kernel command line keys
pub mod cmdline {
    pub const PLATFORM: &str = "talos.platform";
    pub const CONFIG: &str = "talos.config";
    pub const HOSTNAME: &str = "talos.hostname";
    pub const SHUTDOWN: &str = "talos.shutdown";
    pub const IP: &str = "ip";
    pub const PANIC: &str = "panic";

    /// Environment override for the platform
    pub const PLATFORM_ENV: &str = "PLATFORM";

    /// Defaults appended to every generated boot entry
    pub const DEFAULT_ARGS: &[&str] = &[
        "page_poison=1",
        "slab_nomerge",
        "slub_debug=P",
        "pti=on",
        "consoleblank=0",
        "nvme_core.io_timeout=4294967295",
        "printk.devkmsg=on",
        "ima_template=ima-ng",
        "ima_appraise=fix",
        "ima_hash=sha512",
    ];
}

/// Timeouts and retry intervals
pub mod timeouts {
    use std::time::Duration;

    pub const MOUNT_RETRY: Duration = Duration::from_secs(5);
    pub const MOUNT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

    pub const LAZY_UNMOUNT: Duration = Duration::from_secs(90);
    pub const FORCE_UNMOUNT: Duration = Duration::from_secs(10);

    pub const PARTITION_REREAD: Duration = Duration::from_secs(5);
    pub const PARTITION_REREAD_INTERVAL: Duration = Duration::from_millis(50);

    pub const VERIFY_DISK_FREE: Duration = Duration::from_secs(3 * 60);
    pub const VERIFY_DISK_FREE_INTERVAL: Duration = Duration::from_millis(500);

    pub const IMAGE_PULL: Duration = Duration::from_secs(20 * 60);
    pub const IMAGE_PULL_BASE: Duration = Duration::from_secs(5);

    pub const SERVICE_BARRIER: Duration = Duration::from_secs(5 * 60);

    pub const LABEL_MASTER: Duration = Duration::from_secs(10 * 60);
    pub const LABEL_MASTER_INTERVAL: Duration = Duration::from_secs(3);

    /// Countdown before rebooting after a fatal error
    pub const REBOOT_DELAY: Duration = Duration::from_secs(10);
}

/// Operating system identity
pub mod version {
    pub const NAME: &str = "Talos";
    pub const TAG: &str = env!("CARGO_PKG_VERSION");
}

/// Process limits applied at boot
pub mod limits {
    pub const NOFILE: u64 = 1_048_576;
}
