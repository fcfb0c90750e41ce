//! Kernel Self Protection Project requirements.
//!
//! Boot refuses to continue when a required kernel parameter is missing,
//! then hardens the kernel through sysctls.

pub mod sysctl;

pub use sysctl::{Sysctl, SystemProperty};

use crate::cmdline::Cmdline;
use crate::runtime::Mode;
use machined_shared::{MachinedError, MachinedResult};

/// Parameters that must be present on the kernel command line.
pub const REQUIRED_KERNEL_PARAMETERS: &[&str] = &["slab_nomerge", "pti=on"];

const KSPP_SYSCTLS: &[(&str, &str)] = &[
    ("kernel.kptr_restrict", "1"),
    ("kernel.dmesg_restrict", "1"),
    ("kernel.perf_event_paranoid", "3"),
    ("kernel.kexec_load_disabled", "1"),
    ("kernel.yama.ptrace_scope", "1"),
    ("user.max_user_namespaces", "0"),
    ("kernel.unprivileged_bpf_disabled", "1"),
    ("net.core.bpf_jit_harden", "2"),
];

const REQUIRED_SYSCTLS: &[(&str, &str)] = &[
    ("net.ipv4.ip_forward", "1"),
    ("net.bridge.bridge-nf-call-iptables", "1"),
    ("net.bridge.bridge-nf-call-ip6tables", "1"),
    ("net.ipv6.conf.default.forwarding", "1"),
    ("kernel.pid_max", "262144"),
];

/// Bridge netfilter knobs are not namespaced and cannot be set in a container.
const HOST_ONLY: &[&str] = &[
    "net.bridge.bridge-nf-call-iptables",
    "net.bridge.bridge-nf-call-ip6tables",
];

fn properties(pairs: &[(&str, &str)]) -> Vec<SystemProperty> {
    pairs
        .iter()
        .map(|(k, v)| SystemProperty::new(*k, *v))
        .collect()
}

/// Fail with every missing parameter listed.
pub fn enforce_kernel_parameters(cmdline: &Cmdline) -> MachinedResult<()> {
    let missing: Vec<&str> = REQUIRED_KERNEL_PARAMETERS
        .iter()
        .copied()
        .filter(|p| !cmdline.contains(p))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MachinedError::Precondition(format!(
            "KSPP kernel parameters missing: {}",
            missing.join(", ")
        )))
    }
}

pub fn kspp_sysctls() -> Vec<SystemProperty> {
    properties(KSPP_SYSCTLS)
}

/// Sysctls the node needs to run workloads.
pub fn required_sysctls(mode: Mode) -> Vec<SystemProperty> {
    properties(REQUIRED_SYSCTLS)
        .into_iter()
        .filter(|p| !mode.is_container() || !HOST_ONLY.contains(&p.key.as_str()))
        .collect()
}

pub fn enforce_sysctls(sysctl: &Sysctl) -> MachinedResult<()> {
    sysctl.write_all(&kspp_sysctls())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_parameters_present() {
        let cmdline = Cmdline::parse("console=ttyS0 slab_nomerge pti=on");
        enforce_kernel_parameters(&cmdline).unwrap();
    }

    #[test]
    fn test_kernel_parameters_missing() {
        let cmdline = Cmdline::parse("pti=off");
        let err = enforce_kernel_parameters(&cmdline).unwrap_err().to_string();
        assert!(err.contains("slab_nomerge"));
        assert!(err.contains("pti=on"));
    }

    #[test]
    fn test_required_sysctls_for_container() {
        let host = required_sysctls(Mode::Metal);
        let container = required_sysctls(Mode::Container);
        assert_eq!(host.len(), 5);
        assert_eq!(container.len(), 3);
        assert!(
            container
                .iter()
                .all(|p| !p.key.starts_with("net.bridge"))
        );
    }

    #[test]
    fn test_enforce_sysctls_writes_all() {
        let root = tempfile::tempdir().unwrap();
        for p in kspp_sysctls() {
            let path = root.path().join(p.relative_path());
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        }
        let sysctl = Sysctl::new(root.path());
        enforce_sysctls(&sysctl).unwrap();
        assert_eq!(sysctl.read("kernel.kptr_restrict").unwrap(), "1");
        assert_eq!(sysctl.read("net.core.bpf_jit_harden").unwrap(), "2");
    }
}
