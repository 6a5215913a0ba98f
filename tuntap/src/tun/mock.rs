//! In memory tun backend used in tests.
//!
//! Every opened "interface" is one end of a [`UnixDatagram`] pair. The other end plays the part
//! of the kernel: tests inject frames on it and inspect the frames written by the device. Since
//! datagram boundaries are preserved, this behaves like a real tun handle, including non
//! blocking reads and readiness notifications.

use std::io::{self, IoSlice};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TunError;
use crate::frame::Framing;
use crate::handle::{Closer, OwnedHandle};
use crate::sys;
use crate::tun::{Backend, Opened};

/// Closes descriptors and counts how often it did so.
#[derive(Default)]
pub struct CountingCloser {
    closes: AtomicUsize,
}

impl Closer for CountingCloser {
    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        sys::close(fd)
    }
}

pub struct MockBackend {
    framing: Framing,
    closer: Arc<CountingCloser>,
    kernel: Mutex<Option<UnixDatagram>>,
    next_unit: AtomicU32,
    fail_open: AtomicBool,
    write_limit: Mutex<Option<usize>>,
    last_write_len: AtomicUsize,
}

impl MockBackend {
    pub fn new(framing: Framing) -> Arc<Self> {
        Arc::new(Self {
            framing,
            closer: Arc::new(CountingCloser::default()),
            kernel: Mutex::new(None),
            next_unit: AtomicU32::new(0),
            fail_open: AtomicBool::new(false),
            write_limit: Mutex::new(None),
            last_write_len: AtomicUsize::new(0),
        })
    }

    /// Amount of device handles closed so far.
    pub fn closes(&self) -> usize {
        self.closer.closes.load(Ordering::SeqCst)
    }

    /// Make the next opens fail as if no unit is free.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Pretend the kernel accepts at most `limit` bytes per write.
    pub fn limit_writes(&self, limit: usize) {
        *self.write_limit.lock().unwrap() = Some(limit);
    }

    /// Amount of bytes submitted in the last write call, including framing.
    pub fn last_write_len(&self) -> usize {
        self.last_write_len.load(Ordering::SeqCst)
    }

    /// Send a frame from the kernel side of the last opened interface.
    pub fn inject(&self, frame: &[u8]) {
        let kernel = self.kernel.lock().unwrap();
        kernel
            .as_ref()
            .expect("interface is opened")
            .send(frame)
            .unwrap();
    }

    /// Receive the next frame written by the device, if any.
    pub fn written(&self) -> Option<Vec<u8>> {
        let kernel = self.kernel.lock().unwrap();
        let kernel = kernel.as_ref()?;
        kernel.set_nonblocking(true).unwrap();
        let mut buf = vec![0; 65536];
        match kernel.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(_) => None,
        }
    }
}

impl Backend for MockBackend {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn open(&self, requested_name: &str) -> Result<Opened, TunError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TunError::NoFreeUnit);
        }

        let (device, kernel) = UnixDatagram::pair()
            .map_err(|e| TunError::setup("Failed to create socket pair", e))?;
        *self.kernel.lock().unwrap() = Some(kernel);

        let name = if requested_name.is_empty() {
            format!("mock{}", self.next_unit.fetch_add(1, Ordering::SeqCst))
        } else {
            requested_name.to_string()
        };

        Ok(Opened {
            handle: OwnedHandle::with_closer(device.into_raw_fd(), self.closer.clone()),
            name,
        })
    }

    fn write(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.last_write_len.store(
            bufs.iter().map(|buf| buf.len()).sum(),
            Ordering::SeqCst,
        );
        let written = sys::writev(fd, bufs)?;
        Ok(match *self.write_limit.lock().unwrap() {
            Some(limit) => written.min(limit),
            None => written,
        })
    }
}
