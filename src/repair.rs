//! Inline repair (metadata-side file versioning) and Restore
//! (client-driven replay of cached bytes into a new file).

use log::{debug, info, warn};

use crate::cache::CacheEntry;
use crate::cgi::Cgi;
use crate::config::WrapperConfig;
use crate::error::{Errno, WrapperError};
use crate::open_flags::OpenFlags;
use crate::retry::RetryPolicy;
use crate::transport::LayoutTransport;

const RESTORE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Send the metadata-side versioning command that repairs a file
/// in place, ahead of a retried open.
pub fn repair(
    transport: &mut dyn LayoutTransport,
    master_url: &str,
    path: &str,
    opaque: &Cgi,
) -> Result<(), WrapperError> {
    let mut body = Cgi::new();
    body.set("mgm.cmd", "file");
    body.set("mgm.subcmd", "version");
    body.set("mgm.zzz", "ignore");
    body.set("eos.app", "fuse");
    body.set("mgm.purge.version", "-1");
    body.set("mgm.path", path);
    for (k, v) in opaque.iter() {
        body.set(k, v);
    }
    let request = format!("/proc/user/?{}", body.emit());
    debug!(target: "eoslayout::repair", "sending repair request for {path}");
    match transport.send_control(master_url, &request) {
        Ok(_) => Ok(()),
        Err(errno) => {
            warn!(target: "eoslayout::repair", "repair failed for {path}: {errno}");
            Err(WrapperError::RepairFailed)
        }
    }
}

/// Result of a successful Restore: the new internal file id the cached
/// bytes were replayed under.
pub struct RestoreOutcome {
    pub new_inode: u64,
}

/// Replay `entry`'s cached bytes into a freshly created file, per the
/// Restore protocol. Preconditions (cacheable, present, not partial) are
/// the caller's responsibility: this function assumes they already hold
/// and is given a ready-made snapshot of the entry.
///
/// On a single inner write failure within an attempt, this returns
/// immediately without retrying that attempt (only a failed open or a
/// failed close triggers the outer retry) — this mirrors the original's
/// documented behavior exactly rather than "fixing" it into a uniform
/// retry-everything loop.
pub fn restore(
    entry: &CacheEntry,
    config: &WrapperConfig,
    path: &str,
    mode: u32,
    extra_opaque: &Cgi,
    mut transport_factory: impl FnMut() -> Box<dyn LayoutTransport>,
) -> Result<RestoreOutcome, WrapperError> {
    if config.is_restore_disabled() {
        return Err(WrapperError::RestoreRefused);
    }
    if entry.partial {
        return Err(WrapperError::RestoreRefused);
    }

    let mut restore_opaque = Cgi::new();
    restore_opaque.set("eos.atomic", "1");
    restore_opaque.set("eos.app", "restore");
    for (k, v) in extra_opaque.iter() {
        if crate::cgi::AUTH_KEYS.contains(&k) || k == "eos.encodepath" {
            restore_opaque.set(k, v);
        }
    }
    let opaque_str = restore_opaque.emit();
    let size = entry.size;

    let policy = RetryPolicy::restore();
    policy.run_blocking(|attempt| {
        info!(target: "eoslayout::repair", "restore attempt {attempt} for {path}");
        let mut transport = transport_factory();
        let flags = OpenFlags(libc::O_WRONLY | libc::O_CREAT);
        transport
            .open(flags, mode, &opaque_str)
            .map_err(|_| transport.last_errno())?;

        let mut offset: u64 = 0;
        while offset < size {
            let remaining = (size - offset) as usize;
            let block_len = remaining.min(RESTORE_BLOCK_SIZE);
            let buffer = entry.buffer.lock();
            let Some(block) = buffer.peek_data(offset, block_len) else {
                // a peek failure aborts the restore outright; RESTORE_ABORT
                // is the sentinel `restore_retry` refuses to retry.
                return Err(Errno::RESTORE_ABORT);
            };
            let block = block.to_vec();
            drop(buffer);
            if transport.write(offset, &block).is_err() {
                // inner write failure: abort this attempt without retrying
                // its remaining blocks, but still try to close cleanly.
                let _ = transport.close();
                return Err(transport.last_errno());
            }
            offset += block.len() as u64;
        }

        transport.close().map_err(|_| transport.last_errno())?;

        let last_url = transport.last_tried_url();
        let new_inode = parse_mgm_id(&last_url).unwrap_or(0);
        Ok(RestoreOutcome { new_inode })
    })
    .map_err(|_| WrapperError::RestoreFailed)
}

fn parse_mgm_id(url: &str) -> Option<u64> {
    let query = url.split('?').nth(1)?;
    let cgi = Cgi::parse(query);
    let raw = cgi.get("mgm.id")?;
    u64::from_str_radix(raw, 16).ok()
}
