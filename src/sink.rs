//! Cross-process shared-memory frame sink: a `flock(2)`-mediated
//! producer/consumer protocol over a fixed-layout mmap'd header plus
//! payload, with torn-read-tolerant `last_client_ts` sampling so a reader
//! racing the writer sees either the old or the new value, never a mix.
//! The `#[repr(C)]` header struct keeps a stable field-for-field layout so
//! other processes mapping the same file agree on offsets.

use crate::error::{Result, SinkError, UstreamerError};
use crate::frame::{CodecFormat, Frame};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const MEMSINK_MAGIC: u32 = 0x4d53_4b31; // "MSK1"
const MEMSINK_VERSION: u32 = 1;

fn format_tag(format: CodecFormat) -> u32 {
    match format {
        CodecFormat::RawYuyv => 0,
        CodecFormat::Jpeg => 1,
        CodecFormat::H264 => 2,
        CodecFormat::H265 => 3,
    }
}

fn format_from_tag(tag: u32) -> Option<CodecFormat> {
    match tag {
        0 => Some(CodecFormat::RawYuyv),
        1 => Some(CodecFormat::Jpeg),
        2 => Some(CodecFormat::H264),
        3 => Some(CodecFormat::H265),
        _ => None,
    }
}

/// Bit-exact wire header. Field order and widths must not
/// change without bumping `MEMSINK_VERSION`.
#[repr(C)]
struct SharedHeader {
    magic: u32,
    version: u32,
    id: u64,
    used: u64,
    width: u32,
    height: u32,
    format: u32,
    stride: u32,
    online: u8,
    key: u8,
    _pad0: [u8; 2],
    gop: u32,
    grab_ts: f64,
    encode_begin_ts: f64,
    encode_end_ts: f64,
    last_client_ts: f64,
    key_requested: u8,
    _pad1: [u8; 7],
}

const HEADER_SIZE: usize = std::mem::size_of::<SharedHeader>();

/// Parses a trailing `@<N>{K|M}` size suffix off a sink object name into a
/// byte count, e.g. `jpeg@8M` -> 8 * 1024 * 1024.
fn payload_size_from_object_suffix(object: &str) -> Result<usize> {
    let at = object
        .rfind('@')
        .ok_or_else(|| UstreamerError::Sink(SinkError::InvalidObject(object.to_string())))?;
    let suffix = &object[at + 1..];
    if suffix.is_empty() {
        return Err(UstreamerError::Sink(SinkError::InvalidObject(object.to_string())));
    }
    let (num_part, mult) = match suffix.chars().last().unwrap() {
        'K' | 'k' => (&suffix[..suffix.len() - 1], 1024usize),
        'M' | 'm' => (&suffix[..suffix.len() - 1], 1024 * 1024),
        _ => (suffix, 1),
    };
    let n: usize = num_part
        .parse()
        .map_err(|_| UstreamerError::Sink(SinkError::InvalidObject(object.to_string())))?;
    let size = n * mult;
    if size == 0 {
        return Err(UstreamerError::Sink(SinkError::InvalidObject(object.to_string())));
    }
    Ok(size)
}

/// Seconds since an arbitrary fixed point in this process's lifetime.
/// `client_ttl`/`key_requested` comparisons only need monotonicity within a
/// process, never wall-clock alignment across the producer/consumer pair.
fn now_monotonic() -> f64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

fn flock_exclusive_nonblocking(fd: i32) -> std::io::Result<bool> {
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(true)
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

fn flock_unlock(fd: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Polls `flock(LOCK_EX | LOCK_NB)` at ~1ms intervals until it succeeds or
/// `timeout` elapses — a portable timed-lock substitute for platforms
/// without `flock` timeout support.
fn flock_timedwait(fd: i32, timeout: Duration) -> std::io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if flock_exclusive_nonblocking(fd)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Shared-memory frame sink, usable as either the producer ("server") or a
/// consumer ("client") side of the protocol.
pub struct MemorySink {
    name: String,
    server: bool,
    rm: bool,
    path: std::path::PathBuf,
    client_ttl: f64,
    timeout: Duration,
    data_size: usize,
    file: File,
    mmap: MmapMut,
    has_clients: AtomicBool,
    unsafe_last_client_ts: AtomicU64,
    last_read_id: AtomicU64,
}

impl MemorySink {
    /// Opens (creating if `server`) a named shared-memory region sized
    /// `header + payload_size_from_object_suffix(object)`.
    pub fn open<P: AsRef<Path>>(
        name: &str,
        path: P,
        object: &str,
        server: bool,
        mode: u32,
        rm: bool,
        client_ttl_secs: f64,
        timeout_secs: f64,
    ) -> Result<Self> {
        let data_size = payload_size_from_object_suffix(object)?;
        let total_size = HEADER_SIZE + data_size;
        let path = path.as_ref().to_path_buf();

        debug!(sink = name, object, data_size, "opening memory sink");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(server)
            .open(&path)
            .map_err(|e| UstreamerError::Sink(SinkError::OpenFailed(e.to_string())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(mode));
        }

        if server {
            file.set_len(total_size as u64)
                .map_err(|e| UstreamerError::Sink(SinkError::TruncateFailed(e.to_string())))?;
        }

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| UstreamerError::Sink(SinkError::MapFailed(e.to_string())))?
        };
        if mmap.len() < total_size {
            return Err(UstreamerError::Sink(SinkError::MapFailed(format!(
                "mapped region too small: {} < {}",
                mmap.len(),
                total_size
            ))));
        }

        Ok(Self {
            name: name.to_string(),
            server,
            rm,
            path,
            client_ttl: client_ttl_secs,
            timeout: Duration::from_secs_f64(timeout_secs.max(0.0)),
            data_size,
            file,
            mmap,
            has_clients: AtomicBool::new(false),
            unsafe_last_client_ts: AtomicU64::new(0),
            last_read_id: AtomicU64::new(0),
        })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn header_ptr(&self) -> *const SharedHeader {
        self.mmap.as_ptr() as *const SharedHeader
    }

    fn header_mut_ptr(&mut self) -> *mut SharedHeader {
        self.mmap.as_mut_ptr() as *mut SharedHeader
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { self.mmap.as_ptr().add(HEADER_SIZE) }
    }

    fn data_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.mmap.as_mut_ptr().add(HEADER_SIZE) }
    }

    /// Torn-read-tolerant sample of the raw header bit pattern.
    fn read_header_bits(&self) -> (u32, u32, f64) {
        let hdr = unsafe { &*self.header_ptr() };
        (
            unsafe { std::ptr::read_volatile(&hdr.magic) },
            unsafe { std::ptr::read_volatile(&hdr.version) },
            unsafe { std::ptr::read_volatile(&hdr.last_client_ts) },
        )
    }

    pub fn has_clients(&self) -> bool {
        self.has_clients.load(Ordering::Relaxed)
    }

    /// Unlocked peek at the consumer-set keyframe request flag, used by the
    /// orchestrator to decide `force_key` each iteration. Racy by design: worst case
    /// a request is noticed one iteration late.
    pub fn key_requested(&self) -> bool {
        let hdr = unsafe { &*self.header_ptr() };
        unsafe { std::ptr::read_volatile(&hdr.key_requested) != 0 }
    }

    /// Producer-side publish gate.
    pub fn server_check(&self, frame: Option<&Frame>) -> bool {
        assert!(self.server, "server_check called on a client sink");

        let (magic, version, last_client_ts) = self.read_header_bits();
        if magic != MEMSINK_MAGIC || version != MEMSINK_VERSION {
            return true;
        }

        let prev = f64::from_bits(self.unsafe_last_client_ts.load(Ordering::Relaxed));
        if last_client_ts != prev {
            self.unsafe_last_client_ts
                .store(last_client_ts.to_bits(), Ordering::Relaxed);
            self.has_clients.store(true, Ordering::Relaxed);
            return true;
        }

        match flock_exclusive_nonblocking(self.fd()) {
            Ok(true) => {
                let hdr = unsafe { &*self.header_ptr() };
                let now = now_monotonic();
                let has_clients = hdr.last_client_ts + self.client_ttl > now;
                self.has_clients.store(has_clients, Ordering::Relaxed);
                if let Err(e) = flock_unlock(self.fd()) {
                    error!(sink = %self.name, error = %e, "failed to unlock memory sink");
                    return false;
                }
                if has_clients {
                    return true;
                }
                if let Some(frame) = frame {
                    let geometry_changed = hdr.width != frame.width
                        || hdr.height != frame.height
                        || format_from_tag(hdr.format) != Some(frame.format);
                    if geometry_changed {
                        return true;
                    }
                }
                false
            }
            Ok(false) => {
                // Another party holds the lock: a consumer is reading.
                self.has_clients.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!(sink = %self.name, error = %e, "failed to lock memory sink");
                false
            }
        }
    }

    /// Producer-side publish. Returns `Ok(true)`
    /// if the frame was written, `Ok(false)` if the lock was busy and the
    /// producer should simply keep running rather than treat it as an error.
    pub fn server_put(&mut self, frame: &Frame) -> Result<bool> {
        assert!(self.server, "server_put called on a client sink");

        if frame.used() > self.data_size {
            error!(
                sink = %self.name,
                used = frame.used(),
                capacity = self.data_size,
                "frame too big for sink"
            );
            return Ok(false);
        }

        let now = now_monotonic();
        if !flock_timedwait(self.fd(), Duration::from_secs(1))
            .map_err(|e| UstreamerError::Sink(SinkError::LockFailed(e.to_string())))?
        {
            trace!(sink = %self.name, "sink busy, frame skipped");
            return Ok(false);
        }

        let client_ttl = self.client_ttl;
        let fd = self.fd();
        let data_size = self.data_size;
        let name = self.name.clone();

        let key_requested_before = unsafe { (*self.header_ptr()).key_requested != 0 };
        let clear_key_requested = key_requested_before && frame.key;

        unsafe {
            std::ptr::copy_nonoverlapping(frame.data.as_ptr(), self.data_mut_ptr(), frame.used());
        }
        let hdr = unsafe { &mut *self.header_mut_ptr() };
        hdr.id = hdr.id.wrapping_add(1).max(1);
        hdr.used = frame.used() as u64;
        hdr.width = frame.width;
        hdr.height = frame.height;
        hdr.format = format_tag(frame.format);
        hdr.stride = frame.stride;
        hdr.online = frame.online as u8;
        hdr.key = frame.key as u8;
        hdr.gop = frame.gop;
        hdr.grab_ts = frame.grab_ts;
        hdr.encode_begin_ts = frame.encode_begin_ts;
        hdr.encode_end_ts = frame.encode_end_ts;
        if clear_key_requested {
            hdr.key_requested = 0;
        }
        hdr.magic = MEMSINK_MAGIC;
        hdr.version = MEMSINK_VERSION;

        let has_clients = hdr.last_client_ts + client_ttl > now;
        self.has_clients.store(has_clients, Ordering::Relaxed);
        let _ = data_size;

        flock_unlock(fd).map_err(|e| UstreamerError::Sink(SinkError::LockFailed(e.to_string())))?;
        debug!(sink = %name, "exposed new frame");
        Ok(true)
    }

    /// Consumer-side read. The second element of the returned pair is
    /// `out_key_requested`: whether a keyframe this (or an earlier) call
    /// requested is still outstanding, letting a cooperating consumer tell
    /// whether the producer has serviced its request yet.
    pub fn client_get(&mut self, require_key: bool) -> Result<Option<(Frame, bool)>> {
        assert!(!self.server, "client_get called on a server sink");

        let timeout = self.timeout;
        if !flock_timedwait(self.fd(), timeout)
            .map_err(|e| UstreamerError::Sink(SinkError::LockFailed(e.to_string())))?
        {
            return Err(UstreamerError::Sink(SinkError::NoData));
        }

        let result = (|| -> Result<Option<(Frame, bool)>> {
            let hdr = unsafe { &mut *self.header_mut_ptr() };
            if hdr.magic != MEMSINK_MAGIC {
                return Ok(None);
            }
            if hdr.version != MEMSINK_VERSION {
                return Err(UstreamerError::Sink(SinkError::ProtocolMismatch {
                    sink: hdr.version,
                    expected: MEMSINK_VERSION,
                }));
            }

            hdr.last_client_ts = now_monotonic();

            let last_read = self.last_read_id.load(Ordering::Relaxed);
            if hdr.id == last_read {
                return Ok(None);
            }
            self.last_read_id.store(hdr.id, Ordering::Relaxed);

            let format = format_from_tag(hdr.format).ok_or_else(|| {
                UstreamerError::Sink(SinkError::InvalidObject("unknown format tag".into()))
            })?;
            let used = hdr.used as usize;
            let mut data = vec![0u8; used];
            unsafe {
                std::ptr::copy_nonoverlapping(self.data_ptr(), data.as_mut_ptr(), used);
            }

            let mut frame = Frame::compressed(hdr.width, hdr.height, format, data, hdr.key != 0, hdr.gop);
            frame.stride = hdr.stride;
            frame.online = hdr.online != 0;
            frame.grab_ts = hdr.grab_ts;
            frame.encode_begin_ts = hdr.encode_begin_ts;
            frame.encode_end_ts = hdr.encode_end_ts;

            let out_key_requested = hdr.key_requested != 0;
            if require_key {
                hdr.key_requested = 1;
            }
            Ok(Some((frame, out_key_requested)))
        })();

        flock_unlock(self.fd()).map_err(|e| UstreamerError::Sink(SinkError::LockFailed(e.to_string())))?;
        result
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        if self.server && self.rm {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(sink = %self.name, error = %e, "failed to remove sink backing file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CodecFormat;

    fn server_sink(path: &Path) -> MemorySink {
        MemorySink::open("test", path, "test@64K", true, 0o660, true, 5.0, 1.0).unwrap()
    }

    fn client_sink(path: &Path) -> MemorySink {
        MemorySink::open("test", path, "test@64K", false, 0o660, false, 5.0, 1.0).unwrap()
    }

    #[test]
    fn object_suffix_parses_binary_multipliers() {
        assert_eq!(payload_size_from_object_suffix("jpeg@8M").unwrap(), 8 * 1024 * 1024);
        assert_eq!(payload_size_from_object_suffix("jpeg@512K").unwrap(), 512 * 1024);
        assert!(payload_size_from_object_suffix("jpeg@0M").is_err());
        assert!(payload_size_from_object_suffix("jpeg").is_err());
    }

    #[test]
    fn uninitialized_header_always_triggers_publish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let sink = server_sink(&path);
        assert!(sink.server_check(None));
    }

    #[test]
    fn put_then_get_round_trips_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let mut server = server_sink(&path);
        let mut client = client_sink(&path);

        let frame = Frame::compressed(64, 48, CodecFormat::Jpeg, vec![1, 2, 3, 4], true, 30);
        assert!(server.server_put(&frame).unwrap());

        let (got, out_key_requested) = client.client_get(false).unwrap().expect("frame present");
        assert_eq!(got.data, vec![1, 2, 3, 4]);
        assert_eq!(got.width, 64);
        assert_eq!(got.height, 48);
        assert!(!out_key_requested);

        // Re-reading without a new publish yields NoData-equivalent None.
        assert!(client.client_get(false).unwrap().is_none());
    }

    #[test]
    fn frame_too_big_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let mut server = server_sink(&path);
        let huge = Frame::compressed(64, 48, CodecFormat::Jpeg, vec![0u8; 1024 * 1024], true, 1);
        assert_eq!(server.server_put(&huge).unwrap(), false);
    }

    #[test]
    fn key_requested_round_trips_and_clears_on_keyframe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.bin");
        let mut server = server_sink(&path);
        let mut client = client_sink(&path);

        let f1 = Frame::compressed(64, 48, CodecFormat::H264, vec![9], false, 5);
        server.server_put(&f1).unwrap();
        let (_, out_key_requested) = client.client_get(true).unwrap().expect("frame present");
        assert!(!out_key_requested, "no request was outstanding before this call");

        let f2 = Frame::compressed(64, 48, CodecFormat::H264, vec![9, 9], true, 0);
        server.server_put(&f2).unwrap();
        let hdr = unsafe { &*server.header_ptr() };
        assert_eq!(hdr.key_requested, 0);
    }
}
