//! The tun device.
//!
//! A [`TunDevice`] owns the handle to a kernel tun interface. All state transitions (open,
//! close, read, write, starting and stopping polling) of a single device are serialized by a
//! lock. Operations on different devices don't interact, except through the shared
//! [`ShutdownCoordinator`].

use std::fmt;
use std::io::{self, IoSlice};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::TunError;
use crate::handle::{OwnedHandle, NO_HANDLE};
use crate::metrics::{Metrics, NoMetrics};
use crate::poll::{self, EventLoop, PollConfig, PollRegistration, Ready};
use crate::shutdown::{Closable, DeviceId, ShutdownCoordinator};
use crate::tun::{Backend, Opened};

/// Default maximum packet size for [`TunDevice::read`].
pub const DEFAULT_READ_SIZE: usize = 4096;
/// Largest packet [`TunDevice::read`] returns, regardless of the requested size.
pub const MAX_PACKET_SIZE: usize = 65535;

/// A kernel tun interface.
///
/// The device is created closed. After a successful [`open`](Self::open) packets can be read and
/// written, or delivered asynchronously by [`start_polling`](Self::start_polling). Once closed,
/// either explicitly or by dropping it, a device can't be opened again.
pub struct TunDevice<M = NoMetrics>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<M>>,
}

struct Inner<M>
where
    M: Metrics,
{
    id: DeviceId,
    backend: Arc<dyn Backend>,
    coordinator: Arc<ShutdownCoordinator>,
    metrics: M,
    /// Set while the device holds a valid handle. Only modified with the state lock held.
    is_open: AtomicBool,
    state: Mutex<State<M>>,
}

struct State<M>
where
    M: Metrics,
{
    /// Requested name before open, name assigned by the kernel afterwards.
    name: String,
    handle: OwnedHandle,
    /// The device was explicitly closed after being open.
    closed: bool,
    poll_config: PollConfig,
    poller: Option<PollRegistration<M>>,
    /// Changed every time a registration is stopped. Reads from a stale registration are
    /// refused.
    poll_generation: u64,
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl TunDevice<NoMetrics> {
    /// Create a new, closed, device for the current platform.
    ///
    /// If `name` is empty, the kernel chooses the interface name on open. On macos, only names
    /// of the form `utun{n}` select a specific interface.
    pub fn new(name: impl Into<String>, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self::with_backend(name, coordinator, crate::tun::platform(), NoMetrics)
    }
}

impl<M> TunDevice<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    /// Create a new, closed, device using the given [`Backend`] and [`Metrics`].
    pub fn with_backend(
        name: impl Into<String>,
        coordinator: Arc<ShutdownCoordinator>,
        backend: Arc<dyn Backend>,
        metrics: M,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: coordinator.next_id(),
                backend,
                coordinator,
                metrics,
                is_open: AtomicBool::new(false),
                state: Mutex::new(State {
                    name: name.into(),
                    handle: OwnedHandle::none(),
                    closed: false,
                    poll_config: PollConfig::default(),
                    poller: None,
                    poll_generation: 0,
                }),
            }),
        }
    }

    /// Open the device. This allocates the kernel interface and puts its handle in non blocking
    /// mode. Opening an open device does nothing.
    ///
    /// On error the device is left closed, and opening can be retried.
    pub fn open(&self) -> Result<(), TunError> {
        let mut state = self.inner.state();

        if self.inner.is_open() {
            return Ok(());
        }
        if state.closed {
            return Err(TunError::Closed);
        }
        if self.inner.coordinator.is_shutdown_requested() {
            return Err(TunError::ShutdownInProgress);
        }

        // The handle is closed when we return early, so no half open device is left behind.
        let Opened { handle, name } = self.inner.backend.open(&state.name)?;
        self.inner.backend.set_nonblocking(handle.get())?;

        state.handle = handle;
        state.name = name;
        self.inner.is_open.store(true, Ordering::SeqCst);
        self.inner.coordinator.register(
            self.inner.id,
            Arc::downgrade(&self.inner) as Weak<dyn Closable>,
        );
        self.inner.metrics.device_opened();

        info!(name = %state.name, fd = state.handle.get(), "Opened tun device");

        Ok(())
    }

    /// Close the device. Polling is stopped before the handle is released. Closing a device
    /// which is not open does nothing.
    pub fn close(&self) {
        self.inner.close_device();
    }

    /// Read a single packet of at most `max_len` bytes, capped at [`MAX_PACKET_SIZE`].
    ///
    /// An empty packet is returned if no data is available, if the frame read from the device
    /// does not hold a payload, or if a shutdown is in progress.
    pub fn read(&self, max_len: usize) -> Result<Bytes, TunError> {
        let state = self.inner.state();
        if !self.inner.is_open() || !state.handle.is_valid() {
            return Err(TunError::NotOpen);
        }
        if self.inner.coordinator.is_shutdown_requested() {
            return Ok(Bytes::new());
        }

        let framing = self.inner.backend.framing();
        let mut buf = BytesMut::zeroed(max_len.min(MAX_PACKET_SIZE) + framing.overhead());
        let n = match self.inner.backend.read(state.handle.get(), &mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Bytes::new()),
            Err(e) => return Err(TunError::Read(e)),
        };
        buf.truncate(n);

        let packet = framing.payload(buf.freeze()).unwrap_or_default();
        if !packet.is_empty() {
            self.inner.metrics.packet_read(packet.len());
        }

        Ok(packet)
    }

    /// Read a single packet of at most [`DEFAULT_READ_SIZE`] bytes.
    #[inline]
    pub fn read_default(&self) -> Result<Bytes, TunError> {
        self.read(DEFAULT_READ_SIZE)
    }

    /// Write a single packet. Returns the amount of packet bytes accepted by the kernel,
    /// excluding any framing. Short writes are not retried.
    pub fn write(&self, packet: &[u8]) -> Result<usize, TunError> {
        let state = self.inner.state();
        if !self.inner.is_open() || !state.handle.is_valid() {
            return Err(TunError::NotOpen);
        }
        if self.inner.coordinator.is_shutdown_requested() {
            return Err(TunError::ShutdownInProgress);
        }

        let framing = self.inner.backend.framing();
        let written = self
            .inner
            .backend
            .write(
                state.handle.get(),
                &[IoSlice::new(framing.header()), IoSlice::new(packet)],
            )
            .map_err(TunError::Write)?;

        let written = framing.payload_written(written);
        self.inner.metrics.packet_written(written);

        Ok(written)
    }

    /// The name of the interface. Before the device is opened, this is the requested name.
    pub fn name(&self) -> String {
        self.inner.state().name.clone()
    }

    /// The raw handle of the interface, or `-1` if the device is not open.
    pub fn handle(&self) -> RawFd {
        let state = self.inner.state();
        if self.inner.is_open() {
            state.handle.get()
        } else {
            NO_HANDLE
        }
    }

    /// Whether the device is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether inbound packets are currently being delivered.
    pub fn is_polling(&self) -> bool {
        self.inner.state().poller.is_some()
    }

    /// Set the [`PollConfig`] used by subsequent calls to [`start_polling`](Self::start_polling)
    /// and [`start_polling_stream`](Self::start_polling_stream).
    pub fn set_poll_config(&self, config: PollConfig) {
        self.inner.state().poll_config = config;
    }

    /// Deliver every inbound packet to `callback`, until polling is stopped or the device is
    /// closed. Any previous registration is stopped first.
    ///
    /// The callback is called on a dedicated thread, not on the event loop. While the callback
    /// runs, no more packets are read from the device than fit in the delivery channel.
    pub fn start_polling<F>(&self, event_loop: &EventLoop, callback: F) -> Result<(), TunError>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let mut state = self.inner.state();
        let receiver = self.register(&mut state, event_loop)?;

        if let Err(e) = poll::spawn_delivery(&state.name, receiver, callback) {
            state.poller = None;
            return Err(TunError::Poll(e));
        }

        Ok(())
    }

    /// Like [`start_polling`](Self::start_polling), but inbound packets are returned as a
    /// [`Stream`]. The stream ends when polling is stopped or the device is closed.
    pub fn start_polling_stream(
        &self,
        event_loop: &EventLoop,
    ) -> Result<impl Stream<Item = Bytes>, TunError> {
        let mut state = self.inner.state();
        let receiver = self.register(&mut state, event_loop)?;

        Ok(poll::into_stream(receiver))
    }

    /// Stop delivering inbound packets. Does nothing if the device is not polling.
    pub fn stop_polling(&self) {
        let mut state = self.inner.state();
        if state.stop_polling() {
            debug!(name = %state.name, "Stopped polling tun device");
        }
    }

    /// Register the device handle with `event_loop`, replacing any existing registration.
    fn register(
        &self,
        state: &mut State<M>,
        event_loop: &EventLoop,
    ) -> Result<mpsc::Receiver<Bytes>, TunError> {
        if !self.inner.is_open() || !state.handle.is_valid() {
            return Err(TunError::NotOpen);
        }

        // Fully tear down the old registration before the new one is created.
        state.stop_polling();

        let device = Arc::downgrade(&self.inner);
        let generation = state.poll_generation;
        let (registration, receiver) = PollRegistration::start(
            event_loop,
            state.handle.get(),
            move |buf: &mut [u8]| match device.upgrade() {
                Some(device) => device.read_ready(buf, generation),
                None => Ok(Ready::Closed),
            },
            self.inner.backend.framing(),
            state.poll_config,
            self.inner.metrics.clone(),
        )
        .map_err(TunError::Poll)?;
        state.poller = Some(registration);

        debug!(name = %state.name, "Started polling tun device");

        Ok(receiver)
    }
}

impl<M> Inner<M>
where
    M: Metrics,
{
    /// Lock the device state. The state is kept consistent by every operation, so a poisoned
    /// lock is still usable.
    fn state(&self) -> MutexGuard<'_, State<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn close_device(&self) {
        let mut state = self.state();
        self.close_locked(&mut state);
    }

    /// Close the device while the state lock is held by the caller.
    fn close_locked(&self, state: &mut State<M>) {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return;
        }

        state.stop_polling();
        state.handle.reset(None);
        state.closed = true;
        self.coordinator.unregister(self.id);
        self.metrics.device_closed();

        info!(name = %state.name, "Closed tun device");
    }

    /// Read a frame after the event loop signaled the handle is readable. `generation` is the
    /// poll generation of the registration doing the read.
    fn read_ready(&self, buf: &mut [u8], generation: u64) -> io::Result<Ready> {
        let state = self.state();
        if !self.is_open() || !state.handle.is_valid() || state.poll_generation != generation {
            return Ok(Ready::Closed);
        }

        self.backend.read(state.handle.get(), buf).map(Ready::Frame)
    }
}

impl<M> State<M>
where
    M: Metrics,
{
    /// Drop the active registration, if any. Returns whether a registration was active.
    fn stop_polling(&mut self) -> bool {
        self.poll_generation = self.poll_generation.wrapping_add(1);
        self.poller.take().is_some()
    }
}

impl<M> Closable for Inner<M>
where
    M: Metrics + Send + Sync,
{
    fn name(&self) -> String {
        self.state().name.clone()
    }

    fn close(&self) {
        self.close_device();
    }
}

impl<M> Drop for TunDevice<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.close_device();
    }
}

impl<M> fmt::Debug for TunDevice<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("TunDevice")
            .field("name", &state.name)
            .field("handle", &state.handle)
            .field("is_open", &self.inner.is_open())
            .field("polling", &state.poller.is_some())
            .finish()
    }
}
