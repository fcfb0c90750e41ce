//! Streaming `/dev/kmsg` reader.
//!
//! Records look like `<syslog>,<seq>,<clock-us>[,<flags>];<payload>` where
//! `syslog = facility * 8 + priority` and the clock counts microseconds
//! since boot.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use machined_shared::{MachinedError, MachinedResult};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::warn;

const READ_BUFFER: usize = 8192;

/// One parsed kernel log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub facility: u8,
    pub priority: u8,
    pub sequence: u64,
    /// Time since boot.
    pub clock: Duration,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

/// Wall-clock boot time, computed once from the system uptime.
pub fn boot_time() -> DateTime<Utc> {
    static BOOT: OnceLock<DateTime<Utc>> = OnceLock::new();
    *BOOT.get_or_init(|| {
        let uptime = sysinfo::System::uptime();
        Utc::now() - chrono::Duration::seconds(uptime as i64)
    })
}

/// Parse one raw record.
pub fn parse_record(record: &str, boot: DateTime<Utc>) -> MachinedResult<Message> {
    let record = record.lines().next().unwrap_or_default();
    let (header, payload) = record
        .split_once(';')
        .ok_or_else(|| MachinedError::InvalidArgument(format!("malformed kmsg record {:?}", record)))?;

    let mut fields = header.split(',');
    let mut next_number = |name: &str| -> MachinedResult<u64> {
        fields
            .next()
            .and_then(|f| f.trim().parse::<u64>().ok())
            .ok_or_else(|| MachinedError::InvalidArgument(format!("kmsg record without {}", name)))
    };

    let syslog = next_number("syslog prefix")?;
    let sequence = next_number("sequence")?;
    let clock_us = next_number("clock")?;

    let clock = Duration::from_micros(clock_us);
    Ok(Message {
        facility: (syslog >> 3) as u8,
        priority: (syslog & 7) as u8,
        sequence,
        clock,
        timestamp: boot + chrono::Duration::microseconds(clock_us as i64),
        payload: payload.to_string(),
    })
}

/// Options for [`Reader::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Keep waiting for new records instead of ending at the buffer tail.
    pub follow: bool,
    /// Skip records already in the ring buffer.
    pub tail: bool,
}

pub struct Reader {
    path: PathBuf,
    file: File,
    options: ReaderOptions,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> MachinedResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;

        if options.tail {
            file.seek(SeekFrom::End(0))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            options,
        })
    }

    /// Stream parsed records. Malformed records are skipped.
    ///
    /// Without `follow` the stream ends once the ring buffer is drained.
    /// A ring-buffer overrun (`EPIPE`) is logged and reading continues.
    pub fn scan(self) -> impl Stream<Item = MachinedResult<Message>> {
        let Reader { path, file, options } = self;
        let boot = boot_time();

        try_stream! {
            let mut buf = vec![0u8; READ_BUFFER];

            if options.follow {
                let fd = AsyncFd::new(file)?;
                loop {
                    let mut guard = fd.readable().await?;
                    let result = guard.try_io(|inner| {
                        let mut file: &File = inner.get_ref();
                        file.read(&mut buf)
                    });
                    let n = match result {
                        Err(_would_block) => continue,
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) if e.raw_os_error() == Some(libc::EPIPE) => {
                            warn!(path = %path.display(), "kmsg ring buffer overrun");
                            continue;
                        }
                        Ok(Err(e)) => Err(MachinedError::from(e))?,
                    };
                    if n == 0 {
                        break;
                    }
                    if let Some(message) = decode(&buf[..n], boot) {
                        yield message;
                    }
                }
            } else {
                let mut file = file;
                loop {
                    let n = match file.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                            warn!(path = %path.display(), "kmsg ring buffer overrun");
                            continue;
                        }
                        Err(e) => Err(MachinedError::from(e))?,
                    };
                    if n == 0 {
                        break;
                    }
                    if let Some(message) = decode(&buf[..n], boot) {
                        yield message;
                    }
                }
            }
        }
    }
}

fn decode(raw: &[u8], boot: DateTime<Utc>) -> Option<Message> {
    let text = String::from_utf8_lossy(raw);
    match parse_record(&text, boot) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "Skipping kmsg record");
            None
        }
    }
}
