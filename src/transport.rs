//! The remote-file transport interface the wrapper drives, and an
//! in-memory mock used only by this crate's own tests.
//!
//! The real implementation (an XRootD-style client) is out of scope; it is
//! represented here purely as a capability-queried trait so the wrapper
//! never needs to downcast to a concrete layout type (Design Notes §9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Errno;
use crate::open_flags::OpenFlags;

/// Attributes the transport can report back from a `stat` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteStat {
    /// Committed size, in bytes.
    pub size: u64,
}

/// The operations the layout wrapper drives on a single open remote file.
/// One instance is created per `Handle::open` (or per Restore attempt) via
/// a `Fn() -> Box<dyn LayoutTransport>` factory the wrapper is constructed
/// with.
pub trait LayoutTransport: Send {
    /// Send a control request (the lazy-open redirect request, or the
    /// inline-repair request) to `master_url` and return the raw response
    /// body. A response is empty only on a transport-level failure.
    fn send_control(&mut self, master_url: &str, request: &str) -> Result<String, Errno>;

    /// Point subsequent `open`/`open_async` calls at a new URL (used after
    /// a redirect has been parsed, or before a Restore attempt).
    fn redirect(&mut self, url: &str);

    /// Synchronously open the file at the currently redirected URL.
    fn open(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno>;

    /// Whether this transport can perform the open in the background.
    fn supports_async_open(&self) -> bool;

    /// Start a background open; completion is observed via
    /// `wait_open_async`.
    fn open_async(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno>;

    /// Block until a previously started `open_async` completes.
    fn wait_open_async(&mut self) -> Result<(), Errno>;

    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Write `buf` at `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno>;

    /// Truncate the remote file to `offset` bytes.
    fn truncate(&mut self, offset: u64) -> Result<(), Errno>;

    /// Flush any buffered writes.
    fn sync(&mut self) -> Result<(), Errno>;

    /// Fetch current remote attributes.
    fn stat(&mut self) -> Result<RemoteStat, Errno>;

    /// Close the remote file, committing it server-side.
    fn close(&mut self) -> Result<(), Errno>;

    /// The errno of the last failed operation, for callers that need to
    /// inspect it after the fact (e.g. the async-open auth-loss check).
    fn last_errno(&self) -> Errno;

    /// The URL this transport most recently tried (post-redirect).
    fn last_tried_url(&self) -> String;
}

#[derive(Clone, Debug, Default)]
struct MockFileState {
    data: Vec<u8>,
    fid: u64,
    fail_close_once: bool,
    fail_open: bool,
}

/// Shared backing store for every `MockTransport` handle opened against the
/// same logical server in a test.
#[derive(Default)]
pub struct MockServer {
    files: Mutex<HashMap<String, MockFileState>>,
    next_fid: AtomicU64,
}

impl MockServer {
    /// A fresh, empty server.
    pub fn new() -> Arc<Self> {
        Arc::new(MockServer {
            files: Mutex::new(HashMap::new()),
            next_fid: AtomicU64::new(1),
        })
    }

    fn fid_for(&self, path: &str) -> u64 {
        let mut files = self.files.lock().unwrap();
        if let Some(state) = files.get(path) {
            return state.fid;
        }
        let fid = self.next_fid.fetch_add(1, Ordering::SeqCst);
        files.insert(
            path.to_string(),
            MockFileState {
                fid,
                ..Default::default()
            },
        );
        fid
    }

    /// Arrange for the *next* close of `path` to fail exactly once.
    pub fn fail_next_close(&self, path: &str) {
        let mut files = self.files.lock().unwrap();
        let state = files.entry(path.to_string()).or_insert_with(|| MockFileState {
            fid: self.next_fid.fetch_add(1, Ordering::SeqCst),
            ..Default::default()
        });
        state.fail_close_once = true;
    }

    /// Arrange for every `open` of `path` to fail.
    pub fn fail_open(&self, path: &str, fail: bool) {
        let mut files = self.files.lock().unwrap();
        let state = files.entry(path.to_string()).or_insert_with(|| MockFileState {
            fid: self.next_fid.fetch_add(1, Ordering::SeqCst),
            ..Default::default()
        });
        state.fail_open = fail;
    }

    /// The bytes currently committed for `path` (empty if never written).
    pub fn file_data(&self, path: &str) -> Vec<u8> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|s| s.data.clone())
            .unwrap_or_default()
    }

    /// The internal file id minted for `path`.
    pub fn inode_for(&self, path: &str) -> u64 {
        self.fid_for(path)
    }
}

/// Extracts the `<path>` portion of a `<path>?<cgi>`-shaped request body.
fn split_path(request: &str) -> &str {
    match memchr::memchr(b'?', request.as_bytes()) {
        Some(pos) => &request[..pos],
        None => request,
    }
}

/// An in-memory stand-in for the real remote transport, used only by this
/// crate's own unit and integration tests.
pub struct MockTransport {
    server: Arc<MockServer>,
    path: String,
    redirected_url: String,
    last_errno: Errno,
}

impl MockTransport {
    /// Create a transport bound to `path` against `server`.
    pub fn new(server: Arc<MockServer>, path: impl Into<String>) -> Self {
        MockTransport {
            server,
            path: path.into(),
            redirected_url: String::new(),
            last_errno: Errno(0),
        }
    }
}

impl LayoutTransport for MockTransport {
    fn send_control(&mut self, _master_url: &str, request: &str) -> Result<String, Errno> {
        let path = split_path(request);
        let fid = self.server.fid_for(path);
        Ok(format!("{path}?mgm.id={fid:x}"))
    }

    fn redirect(&mut self, url: &str) {
        self.redirected_url = url.to_string();
    }

    fn open(&mut self, _flags: OpenFlags, _mode: u32, opaque: &str) -> Result<(), Errno> {
        // A restore re-opens its target with CREAT under a distinct key,
        // the way the real protocol mints a new inode for the replayed
        // file rather than reusing the original one.
        if opaque.contains("eos.app=restore") && !self.path.ends_with("#restore") {
            self.path = format!("{}#restore", self.path);
        }
        let mut files = self.server.files.lock().unwrap();
        let state = files
            .entry(self.path.clone())
            .or_insert_with(|| MockFileState {
                fid: self.server.next_fid.fetch_add(1, Ordering::SeqCst),
                ..Default::default()
            });
        if state.fail_open {
            self.last_errno = Errno::EIO;
            return Err(Errno::EIO);
        }
        Ok(())
    }

    fn supports_async_open(&self) -> bool {
        false
    }

    fn open_async(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.open(flags, mode, opaque)
    }

    fn wait_open_async(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let files = self.server.files.lock().unwrap();
        let data = files
            .get(&self.path)
            .map(|s| s.data.as_slice())
            .unwrap_or(&[]);
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        let mut files = self.server.files.lock().unwrap();
        let state = files
            .entry(self.path.clone())
            .or_insert_with(|| MockFileState {
                fid: self.server.next_fid.fetch_add(1, Ordering::SeqCst),
                ..Default::default()
            });
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > state.data.len() {
            state.data.resize(end, 0);
        }
        state.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&mut self, offset: u64) -> Result<(), Errno> {
        let mut files = self.server.files.lock().unwrap();
        if let Some(state) = files.get_mut(&self.path) {
            state.data.resize(offset as usize, 0);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn stat(&mut self) -> Result<RemoteStat, Errno> {
        let files = self.server.files.lock().unwrap();
        let size = files.get(&self.path).map(|s| s.data.len()).unwrap_or(0) as u64;
        Ok(RemoteStat { size })
    }

    fn close(&mut self) -> Result<(), Errno> {
        let mut files = self.server.files.lock().unwrap();
        if let Some(state) = files.get_mut(&self.path) {
            if state.fail_close_once {
                state.fail_close_once = false;
                self.last_errno = Errno::EIO;
                return Err(Errno::EIO);
            }
        }
        Ok(())
    }

    fn last_errno(&self) -> Errno {
        self.last_errno
    }

    fn last_tried_url(&self) -> String {
        let fid = self.server.fid_for(&self.path);
        format!("{}?mgm.id={:x}", self.redirected_url, fid)
    }
}
