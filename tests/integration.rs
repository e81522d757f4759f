//! End-to-end scenarios for the two-phase open / write-cache / restore
//! protocol, driven entirely against `MockTransport`/`MockServer`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eoslayout::{
    Cgi, Errno, LayoutTransport, LayoutWrapper, MockServer, MockTransport, OpenFlags, OpenRequest,
    RemoteStat, WrapperConfig, WrapperError, REGISTRY,
};

fn wrapper_for(server: Arc<MockServer>, path: &str) -> LayoutWrapper {
    let path = path.to_string();
    LayoutWrapper::new("root://master", WrapperConfig::default(), move || {
        Box::new(MockTransport::new(server.clone(), path.clone())) as Box<dyn LayoutTransport>
    })
}

fn open_request(path: &'static str, flags: OpenFlags, owner_lifetime: Duration) -> OpenRequest<'static> {
    OpenRequest {
        path,
        flags,
        mode: 0o644,
        opaque: Cgi::new(),
        do_data_open: true,
        async_data_open: false,
        owner_lifetime,
        inline_repair: false,
    }
}

fn create_trunc_flags() -> OpenFlags {
    OpenFlags(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Installs the crate's `log` output under `RUST_LOG` for anyone running
/// this suite with logging enabled; a no-op once already installed.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

#[test]
fn s1_clean_close_leaves_a_restorable_non_partial_entry() {
    init_logging();
    let server = MockServer::new();
    let wrapper = wrapper_for(server.clone(), "/s1/file");
    let lifetime = Duration::from_secs(30);
    wrapper
        .open(open_request("/s1/file", create_trunc_flags(), lifetime))
        .unwrap();
    wrapper.write_cache(0, b"hello", 4096);
    wrapper.write(0, b"hello").unwrap();
    let inode = wrapper.inode();

    wrapper.close().unwrap();

    assert_eq!(server.file_data("/s1/file"), b"hello");
    let entry = REGISTRY
        .snapshot(inode)
        .expect("entry must survive past close");
    assert_eq!(entry.size, 5);
    assert!(!entry.partial);
    let now = now_secs();
    assert!(entry.lifetime >= now + 29 && entry.lifetime <= now + 31);
}

#[test]
fn s2_close_failure_is_masked_by_a_successful_restore_and_migrates_inode() {
    let server = MockServer::new();
    server.fail_next_close("/s2/file");
    let wrapper = wrapper_for(server.clone(), "/s2/file");
    wrapper
        .open(open_request(
            "/s2/file",
            create_trunc_flags(),
            Duration::from_secs(30),
        ))
        .unwrap();
    wrapper.write_cache(0, b"payload", 4096);
    wrapper.write(0, b"payload").unwrap();
    let inode = wrapper.inode();

    let result = wrapper.close();
    assert!(
        result.is_ok(),
        "a successful restore must override the close failure"
    );

    let new_inode = REGISTRY.migrate(inode);
    assert_ne!(new_inode, 0);
    assert_ne!(new_inode, inode);
    let entry = REGISTRY.snapshot(new_inode).unwrap();
    assert_eq!(entry.size, 7);
    assert_eq!(REGISTRY.migrate(inode), 0, "migrate must be idempotent");
}

#[test]
fn s3_partial_entry_refuses_restore_and_surfaces_the_original_error() {
    let server = MockServer::new();
    server.fail_next_close("/s3/file");
    let wrapper = wrapper_for(server.clone(), "/s3/file");
    wrapper
        .open(open_request(
            "/s3/file",
            create_trunc_flags(),
            Duration::from_secs(30),
        ))
        .unwrap();

    // This write exceeds the 4096-byte cache cap, marking the entry
    // partial and therefore ineligible for Restore.
    let oversized = vec![0u8; 8192];
    wrapper.write_cache(0, &oversized, 4096);
    wrapper.write(0, &oversized).unwrap();

    let result = wrapper.close();
    match result {
        Err(WrapperError::Transport(errno)) => assert_eq!(errno, Errno::EIO),
        other => panic!("expected the original transport error, got {other:?}"),
    }
}

/// A send_control that returns a malformed response (no `?` within the
/// first 1MiB, as if two redirects had been concatenated) on its first
/// call, then behaves normally.
struct RaceArtefactTransport {
    inner: MockTransport,
    calls: u32,
}

impl RaceArtefactTransport {
    fn new(server: Arc<MockServer>, path: &str) -> Self {
        RaceArtefactTransport {
            inner: MockTransport::new(server, path),
            calls: 0,
        }
    }
}

impl LayoutTransport for RaceArtefactTransport {
    fn send_control(&mut self, master_url: &str, request: &str) -> Result<String, Errno> {
        self.calls += 1;
        if self.calls == 1 {
            let mut body = "x".repeat(2 * 1024 * 1024);
            body.push('?');
            body.push_str("tail");
            Ok(body)
        } else {
            self.inner.send_control(master_url, request)
        }
    }

    fn redirect(&mut self, url: &str) {
        self.inner.redirect(url)
    }

    fn open(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.inner.open(flags, mode, opaque)
    }

    fn supports_async_open(&self) -> bool {
        self.inner.supports_async_open()
    }

    fn open_async(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.inner.open_async(flags, mode, opaque)
    }

    fn wait_open_async(&mut self) -> Result<(), Errno> {
        self.inner.wait_open_async()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.inner.write(offset, buf)
    }

    fn truncate(&mut self, offset: u64) -> Result<(), Errno> {
        self.inner.truncate(offset)
    }

    fn sync(&mut self) -> Result<(), Errno> {
        self.inner.sync()
    }

    fn stat(&mut self) -> Result<RemoteStat, Errno> {
        self.inner.stat()
    }

    fn close(&mut self) -> Result<(), Errno> {
        self.inner.close()
    }

    fn last_errno(&self) -> Errno {
        self.inner.last_errno()
    }

    fn last_tried_url(&self) -> String {
        self.inner.last_tried_url()
    }
}

#[test]
fn s4_race_artefact_response_is_rejected_without_corrupting_state_and_retry_succeeds() {
    let server = MockServer::new();
    let path = "/s4/file".to_string();
    let wrapper = LayoutWrapper::new("root://master", WrapperConfig::default(), {
        let server = server.clone();
        let path = path.clone();
        move || Box::new(RaceArtefactTransport::new(server.clone(), &path)) as Box<dyn LayoutTransport>
    });

    let flags = create_trunc_flags();
    let first = wrapper.open(open_request("/s4/file", flags, Duration::from_secs(30)));
    assert!(matches!(first, Err(WrapperError::MasterBadResponse)));

    // The failed attempt must not have advanced the handle past Fresh,
    // so the very same wrapper can retry the open.
    let second = wrapper.open(open_request("/s4/file", flags, Duration::from_secs(30)));
    assert!(second.is_ok(), "retry after a rejected race artefact must succeed");
    wrapper.write(0, b"ok").unwrap();
    wrapper.close().unwrap();
    assert_eq!(server.file_data("/s4/file"), b"ok");
}

/// An `open` that fails with a stale-redirect errno for the first
/// `fail_count` calls, then succeeds.
struct FlakyOpenTransport {
    inner: MockTransport,
    fail_count: u32,
    calls: u32,
}

impl FlakyOpenTransport {
    fn new(server: Arc<MockServer>, path: &str, fail_count: u32) -> Self {
        FlakyOpenTransport {
            inner: MockTransport::new(server, path),
            fail_count,
            calls: 0,
        }
    }
}

impl LayoutTransport for FlakyOpenTransport {
    fn send_control(&mut self, master_url: &str, request: &str) -> Result<String, Errno> {
        self.inner.send_control(master_url, request)
    }

    fn redirect(&mut self, url: &str) {
        self.inner.redirect(url)
    }

    fn open(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.calls += 1;
        if self.calls <= self.fail_count {
            return Err(Errno::STALE_REDIRECT);
        }
        self.inner.open(flags, mode, opaque)
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
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.inner.write(offset, buf)
    }

    fn truncate(&mut self, offset: u64) -> Result<(), Errno> {
        self.inner.truncate(offset)
    }

    fn sync(&mut self) -> Result<(), Errno> {
        self.inner.sync()
    }

    fn stat(&mut self) -> Result<RemoteStat, Errno> {
        self.inner.stat()
    }

    fn close(&mut self) -> Result<(), Errno> {
        self.inner.close()
    }

    fn last_errno(&self) -> Errno {
        if self.calls <= self.fail_count {
            Errno::STALE_REDIRECT
        } else {
            self.inner.last_errno()
        }
    }

    fn last_tried_url(&self) -> String {
        self.inner.last_tried_url()
    }
}

fn wrapper_with_flaky_open(
    server: Arc<MockServer>,
    path: &str,
    fail_count: u32,
    config: WrapperConfig,
) -> LayoutWrapper {
    let path = path.to_string();
    LayoutWrapper::new("root://master", config, move || {
        Box::new(FlakyOpenTransport::new(server.clone(), &path, fail_count))
            as Box<dyn LayoutTransport>
    })
}

#[test]
fn s5_stale_redirect_retries_succeed_once_under_the_retry_cap() {
    let server = MockServer::new();
    let wrapper = wrapper_with_flaky_open(server, "/s5/a", 12, WrapperConfig::default());
    let result = wrapper.open(open_request("/s5/a", create_trunc_flags(), Duration::from_secs(30)));
    assert!(result.is_ok(), "default cap of 100 comfortably covers 12 retries");
}

#[test]
fn s5_stale_redirect_retries_succeed_with_cap_twenty() {
    let server = MockServer::new();
    let config = WrapperConfig::default().open_max_retries(20);
    let wrapper = wrapper_with_flaky_open(server, "/s5/b", 12, config);
    let result = wrapper.open(open_request("/s5/b", create_trunc_flags(), Duration::from_secs(30)));
    assert!(result.is_ok(), "a cap of 20 still covers the 13th successful attempt");
}

#[test]
fn s5_stale_redirect_retries_exhaust_and_fail_with_cap_ten() {
    let server = MockServer::new();
    let config = WrapperConfig::default().open_max_retries(10);
    let wrapper = wrapper_with_flaky_open(server, "/s5/c", 12, config);
    let result = wrapper.open(open_request("/s5/c", create_trunc_flags(), Duration::from_secs(30)));
    assert!(
        matches!(result, Err(WrapperError::Transport(errno)) if errno == Errno::STALE_REDIRECT),
        "a cap of 10 is exhausted before the 13th attempt would succeed"
    );
}

#[test]
fn s6_cached_size_is_observable_before_close_with_lifetime_still_zero() {
    let server = MockServer::new();
    let wrapper = wrapper_for(server, "/s6/file");
    wrapper
        .open(open_request(
            "/s6/file",
            create_trunc_flags(),
            Duration::from_secs(30),
        ))
        .unwrap();
    wrapper.write_cache(0, b"12345", 4096);
    wrapper.write(0, b"12345").unwrap();
    let inode = wrapper.inode();

    assert_eq!(REGISTRY.lookup_size(inode), Some(5));
    let entry = REGISTRY.snapshot(inode).unwrap();
    assert_eq!(entry.lifetime, 0, "a still-open handle keeps lifetime at 0");

    wrapper.close().unwrap();
}

/// A transport that supports async open and completes it immediately
/// (as if the background open had already finished by the time anything
/// joins it).
struct AsyncOkTransport {
    inner: MockTransport,
}

impl AsyncOkTransport {
    fn new(server: Arc<MockServer>, path: &str) -> Self {
        AsyncOkTransport {
            inner: MockTransport::new(server, path),
        }
    }
}

impl LayoutTransport for AsyncOkTransport {
    fn send_control(&mut self, master_url: &str, request: &str) -> Result<String, Errno> {
        self.inner.send_control(master_url, request)
    }

    fn redirect(&mut self, url: &str) {
        self.inner.redirect(url)
    }

    fn open(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.inner.open(flags, mode, opaque)
    }

    fn supports_async_open(&self) -> bool {
        true
    }

    fn open_async(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.inner.open(flags, mode, opaque)
    }

    fn wait_open_async(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.inner.write(offset, buf)
    }

    fn truncate(&mut self, offset: u64) -> Result<(), Errno> {
        self.inner.truncate(offset)
    }

    fn sync(&mut self) -> Result<(), Errno> {
        self.inner.sync()
    }

    fn stat(&mut self) -> Result<RemoteStat, Errno> {
        self.inner.stat()
    }

    fn close(&mut self) -> Result<(), Errno> {
        self.inner.close()
    }

    fn last_errno(&self) -> Errno {
        self.inner.last_errno()
    }

    fn last_tried_url(&self) -> String {
        self.inner.last_tried_url()
    }
}

fn async_open_request(path: &'static str) -> OpenRequest<'static> {
    OpenRequest {
        path,
        flags: create_trunc_flags(),
        mode: 0o644,
        opaque: Cgi::new(),
        do_data_open: true,
        async_data_open: true,
        owner_lifetime: Duration::from_secs(30),
        inline_repair: false,
    }
}

#[test]
fn async_open_promotes_to_data_open_on_first_write() {
    let server = MockServer::new();
    let wrapper = LayoutWrapper::new("root://master", WrapperConfig::default(), {
        let server = server.clone();
        move || Box::new(AsyncOkTransport::new(server.clone(), "/async/write")) as Box<dyn LayoutTransport>
    });
    wrapper.open(async_open_request("/async/write")).unwrap();
    wrapper.write(0, b"ok").unwrap();
    wrapper.close().unwrap();
    assert_eq!(server.file_data("/async/write"), b"ok");
}

#[test]
fn close_joins_a_still_pending_async_open_without_an_intervening_read_or_write() {
    let server = MockServer::new();
    let wrapper = LayoutWrapper::new("root://master", WrapperConfig::default(), {
        let server = server.clone();
        move || Box::new(AsyncOkTransport::new(server.clone(), "/async/close-only")) as Box<dyn LayoutTransport>
    });
    wrapper.open(async_open_request("/async/close-only")).unwrap();
    assert!(
        wrapper.close().is_ok(),
        "close must join the outstanding async open rather than leaking it"
    );
}

/// A transport whose async open is later found (on join) to have lost
/// authentication on redirect; `last_tried_url`/the redirected URL carries
/// a non-`*` username, so the wrapper should fall through to a
/// synchronous open rather than failing outright.
struct AsyncAuthLossTransport {
    inner: MockTransport,
    last_errno: Errno,
    joined_once: bool,
}

impl AsyncAuthLossTransport {
    fn new(server: Arc<MockServer>, path: &str) -> Self {
        AsyncAuthLossTransport {
            inner: MockTransport::new(server, path),
            last_errno: Errno(0),
            joined_once: false,
        }
    }
}

impl LayoutTransport for AsyncAuthLossTransport {
    fn send_control(&mut self, master_url: &str, request: &str) -> Result<String, Errno> {
        let body = self.inner.send_control(master_url, request)?;
        let pos = body.find('?').expect("mock always emits mgm.id");
        let (path, cgi) = body.split_at(pos);
        Ok(format!("root://someuser@dataserver{path}?{}", &cgi[1..]))
    }

    fn redirect(&mut self, url: &str) {
        self.inner.redirect(url)
    }

    fn open(&mut self, flags: OpenFlags, mode: u32, opaque: &str) -> Result<(), Errno> {
        self.inner.open(flags, mode, opaque)
    }

    fn supports_async_open(&self) -> bool {
        true
    }

    fn open_async(&mut self, _flags: OpenFlags, _mode: u32, _opaque: &str) -> Result<(), Errno> {
        // The background open is accepted; its outcome (auth loss) is only
        // discovered when something joins it.
        Ok(())
    }

    fn wait_open_async(&mut self) -> Result<(), Errno> {
        if self.joined_once {
            return Ok(());
        }
        self.joined_once = true;
        self.last_errno = Errno::EPERM;
        Err(Errno::EPERM)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.inner.write(offset, buf)
    }

    fn truncate(&mut self, offset: u64) -> Result<(), Errno> {
        self.inner.truncate(offset)
    }

    fn sync(&mut self) -> Result<(), Errno> {
        self.inner.sync()
    }

    fn stat(&mut self) -> Result<RemoteStat, Errno> {
        self.inner.stat()
    }

    fn close(&mut self) -> Result<(), Errno> {
        self.inner.close()
    }

    fn last_errno(&self) -> Errno {
        self.last_errno
    }

    fn last_tried_url(&self) -> String {
        self.inner.last_tried_url()
    }
}

#[test]
fn async_open_credentials_lost_on_redirect_falls_through_to_sync_open() {
    let server = MockServer::new();
    let wrapper = LayoutWrapper::new("root://master", WrapperConfig::default(), {
        let server = server.clone();
        move || {
            Box::new(AsyncAuthLossTransport::new(server.clone(), "/async/credloss"))
                as Box<dyn LayoutTransport>
        }
    });
    wrapper.open(async_open_request("/async/credloss")).unwrap();
    // The first write joins the pending async open, finds EPERM against a
    // non-'*' redirect username, and falls through to a synchronous open
    // that succeeds.
    wrapper.write(0, b"ok").unwrap();
    wrapper.close().unwrap();
    assert_eq!(server.file_data("/async/credloss"), b"ok");
}
