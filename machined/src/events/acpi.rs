//! ACPI power-button watcher over generic netlink.
//!
//! Resolves the `acpi_event` family through the netlink controller, joins
//! its `acpi_mc_group` multicast group and waits for an event whose device
//! class starts with `button/power`.

use super::{Event, EventBus};
use crate::util::blocking;
use machined_shared::{MachinedError, MachinedResult};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tracing::{debug, info};

pub const FAMILY_NAME: &str = "acpi_event";
pub const MULTICAST_GROUP: &str = "acpi_mc_group";
pub const POWER_BUTTON: &str = "button/power";

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLM_F_REQUEST: u16 = 0x1;
const NLMSG_ERROR: u16 = 0x2;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;
const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

const RECV_BUFFER: usize = 8192;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Append one netlink attribute, padded to 4 bytes.
fn put_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = (NLA_HDRLEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(buf.len()), 0);
}

/// Wrap a generic netlink body into a full message.
fn genl_message(kind: u16, flags: u16, seq: u32, cmd: u8, attrs: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + GENL_HDRLEN + attrs.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&[cmd, 1, 0, 0]);
    buf.extend_from_slice(attrs);
    buf
}

/// Controller request resolving `family` to its ID and groups.
pub fn get_family_request(family: &str, seq: u32) -> Vec<u8> {
    let mut name = family.as_bytes().to_vec();
    name.push(0);
    let mut attrs = Vec::new();
    put_attr(&mut attrs, CTRL_ATTR_FAMILY_NAME, &name);
    genl_message(GENL_ID_CTRL, NLM_F_REQUEST, seq, CTRL_CMD_GETFAMILY, &attrs)
}

/// A netlink message: type plus payload after the header.
struct NlMessage<'a> {
    kind: u16,
    payload: &'a [u8],
}

fn messages(mut buf: &[u8]) -> Vec<NlMessage<'_>> {
    let mut out = Vec::new();
    while buf.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            break;
        }
        let kind = u16::from_ne_bytes([buf[4], buf[5]]);
        out.push(NlMessage {
            kind,
            payload: &buf[NLMSG_HDRLEN..len],
        });
        buf = &buf[align(len).min(buf.len())..];
    }
    out
}

fn attributes(mut buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    while buf.len() >= NLA_HDRLEN {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        if len < NLA_HDRLEN || len > buf.len() {
            break;
        }
        let kind = u16::from_ne_bytes([buf[2], buf[3]]) & NLA_TYPE_MASK;
        out.push((kind, &buf[NLA_HDRLEN..len]));
        buf = &buf[align(len).min(buf.len())..];
    }
    out
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn check_error(message: &NlMessage<'_>) -> MachinedResult<()> {
    if message.kind != NLMSG_ERROR || message.payload.len() < 4 {
        return Ok(());
    }
    let p = message.payload;
    let code = i32::from_ne_bytes([p[0], p[1], p[2], p[3]]);
    if code == 0 {
        Ok(())
    } else {
        Err(MachinedError::Errno(Errno::from_raw(-code)))
    }
}

/// Family ID and multicast group ID parsed from a controller reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyInfo {
    pub family_id: u16,
    pub group_id: u32,
}

pub fn parse_family_reply(buf: &[u8], group: &str) -> MachinedResult<FamilyInfo> {
    let mut family_id = None;
    let mut group_id = None;

    for message in messages(buf) {
        check_error(&message)?;
        if message.kind != GENL_ID_CTRL || message.payload.len() < GENL_HDRLEN {
            continue;
        }

        for (kind, value) in attributes(&message.payload[GENL_HDRLEN..]) {
            match kind {
                CTRL_ATTR_FAMILY_ID if value.len() >= 2 => {
                    family_id = Some(u16::from_ne_bytes([value[0], value[1]]));
                }
                CTRL_ATTR_MCAST_GROUPS => {
                    for (_, nested) in attributes(value) {
                        let fields = attributes(nested);
                        let name = fields
                            .iter()
                            .find(|(k, _)| *k == CTRL_ATTR_MCAST_GRP_NAME)
                            .map(|(_, v)| c_string(v));
                        let id = fields
                            .iter()
                            .find(|(k, v)| *k == CTRL_ATTR_MCAST_GRP_ID && v.len() >= 4)
                            .map(|(_, v)| u32::from_ne_bytes([v[0], v[1], v[2], v[3]]));
                        if name.as_deref() == Some(group) {
                            group_id = id;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    match (family_id, group_id) {
        (Some(family_id), Some(group_id)) => Ok(FamilyInfo {
            family_id,
            group_id,
        }),
        (None, _) => Err(MachinedError::NotFound(format!(
            "generic netlink family {}",
            FAMILY_NAME
        ))),
        (Some(_), None) => Err(MachinedError::NotFound(format!(
            "multicast group {}",
            group
        ))),
    }
}

/// Whether any attribute of any message in `buf` reports a power-button press.
pub fn is_power_button(buf: &[u8]) -> bool {
    messages(buf).iter().any(|message| {
        message.payload.len() >= GENL_HDRLEN
            && attributes(&message.payload[GENL_HDRLEN..])
                .iter()
                .any(|(_, value)| c_string(value).starts_with(POWER_BUTTON))
    })
}

/// Generic netlink socket joined to the ACPI multicast group.
#[derive(Debug)]
pub struct AcpiListener {
    fd: OwnedFd,
}

impl AcpiListener {
    pub fn open() -> MachinedResult<Self> {
        // SAFETY: plain socket(2); the descriptor is owned immediately.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        Errno::result(raw)?;
        // SAFETY: `raw` is a fresh valid descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        Errno::result(rc)?;

        let listener = Self { fd };
        let info = listener.resolve_family()?;
        debug!(family_id = info.family_id, group_id = info.group_id, "Resolved ACPI netlink family");
        listener.join(info.group_id)?;
        Ok(listener)
    }

    fn send(&self, buf: &[u8]) -> MachinedResult<()> {
        // SAFETY: buf is valid for buf.len() bytes.
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        Errno::result(rc)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> MachinedResult<usize> {
        loop {
            // SAFETY: buf is valid for buf.len() writable bytes.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            match Errno::result(rc) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn resolve_family(&self) -> MachinedResult<FamilyInfo> {
        self.send(&get_family_request(FAMILY_NAME, 1))?;
        let mut buf = vec![0u8; RECV_BUFFER];
        let n = self.recv(&mut buf)?;
        parse_family_reply(&buf[..n], MULTICAST_GROUP)
    }

    fn join(&self, group: u32) -> MachinedResult<()> {
        // SAFETY: group outlives the call and the length matches u32.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                &group as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        Errno::result(rc)?;
        Ok(())
    }

    /// Block until the power button is pressed.
    pub fn wait_for_power_button(&self) -> MachinedResult<()> {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let n = self.recv(&mut buf)?;
            if is_power_button(&buf[..n]) {
                return Ok(());
            }
        }
    }
}

/// Publish [`Event::Shutdown`] once the power button is pressed.
pub async fn watch(bus: Arc<EventBus>) -> MachinedResult<()> {
    let listener = blocking(AcpiListener::open).await?;
    info!("Listening for ACPI power button events");
    blocking(move || listener.wait_for_power_button()).await?;

    info!("Shutdown via ACPI power button");
    bus.notify(Event::Shutdown);
    Ok(())
}
