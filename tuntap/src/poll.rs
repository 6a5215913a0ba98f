//! Readiness based delivery of inbound packets.
//!
//! An [`EventLoop`] is a single threaded tokio runtime which watches device handles for
//! readability. Every [`PollRegistration`] owns one such watch, plus the sending side of a
//! bounded channel. When the handle becomes readable, a single frame is read, unframed, and
//! sent on the channel. The receiving side is either drained by a dedicated delivery thread
//! which calls a user supplied callback, or handed to the user as a [`Stream`].
//!
//! The channel is bounded, by default to a single packet. If the consumer doesn't keep up,
//! sending suspends the registration's task until there is room again, so no packets are
//! read from the device in the meantime. Packets are never dropped on a full channel.

use std::io;
use std::os::fd::RawFd;
use std::thread;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::frame::Framing;
use crate::handle::OwnedHandle;
use crate::metrics::Metrics;
use crate::sys;
use crate::task::AbortOnDrop;

/// Default size of the buffer used for a single read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Default amount of packets which can be waiting for the consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Tunables used when a device starts polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Size of the buffer used to read a frame, including any framing header.
    pub read_buffer_size: usize,
    /// Amount of packets which can be queued for the consumer before reading is suspended.
    /// Must be at least 1.
    pub channel_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A single threaded loop watching device handles for readiness.
pub struct EventLoop {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start a new event loop on a dedicated thread.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_io().build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("tun-event-loop".to_string())
            .spawn(move || {
                // Either an explicit stop, or the loop handle is dropped.
                let _ = runtime.block_on(stopped);
                debug!("Tun event loop stopped");
            })?;

        Ok(Self {
            handle,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Use an existing runtime as event loop. Stopping the runtime is left to the caller.
    ///
    /// The runtime must have the IO driver enabled.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            stop: None,
            thread: None,
        }
    }

    /// Handle to the runtime driving this loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Tun event loop thread panicked");
            }
        }
    }
}

/// Outcome of a read triggered by a readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ready {
    /// A frame of the given size was read.
    Frame(usize),
    /// The device is closed, the registration should end.
    Closed,
}

/// An active watch of a device handle on an [`EventLoop`].
///
/// Dropping the registration stops the watch: the poll task is aborted, which deregisters the
/// handle from the loop, and the sending side of the delivery channel is released.
pub(crate) struct PollRegistration<M>
where
    M: Metrics,
{
    _task: AbortOnDrop,
    _sender: mpsc::Sender<Bytes>,
    metrics: M,
}

impl<M> PollRegistration<M>
where
    M: Metrics + Clone + Send + Sync + 'static,
{
    /// Watch `fd` for readability on `event_loop`. Every time the handle is readable, `read`
    /// is called to read a frame.
    ///
    /// The handle is duplicated, so the loop owns its own descriptor which stays valid until
    /// the loop has deregistered it.
    pub fn start<R>(
        event_loop: &EventLoop,
        fd: RawFd,
        read: R,
        framing: Framing,
        config: PollConfig,
        metrics: M,
    ) -> io::Result<(Self, mpsc::Receiver<Bytes>)>
    where
        R: FnMut(&mut [u8]) -> io::Result<Ready> + Send + 'static,
    {
        if config.channel_capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delivery channel capacity must be at least 1",
            ));
        }

        let watched = OwnedHandle::new(sys::dup(fd)?);
        let async_fd = {
            let _guard = event_loop.handle().enter();
            AsyncFd::with_interest(watched, Interest::READABLE)?
        };

        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let task = event_loop.handle().spawn(poll_frames(
            async_fd,
            read,
            framing,
            config.read_buffer_size,
            sender.downgrade(),
            metrics.clone(),
        ));

        metrics.poll_started();
        metrics.delivery_channel_opened();

        Ok((
            Self {
                _task: task.into(),
                _sender: sender,
                metrics,
            },
            receiver,
        ))
    }
}

impl<M> Drop for PollRegistration<M>
where
    M: Metrics,
{
    fn drop(&mut self) {
        self.metrics.poll_stopped();
        self.metrics.delivery_channel_closed();
    }
}

/// Read frames from the device every time it becomes readable, and send them to the consumer.
async fn poll_frames<R, M>(
    async_fd: AsyncFd<OwnedHandle>,
    mut read: R,
    framing: Framing,
    read_buffer_size: usize,
    sender: mpsc::WeakSender<Bytes>,
    metrics: M,
) where
    R: FnMut(&mut [u8]) -> io::Result<Ready>,
    M: Metrics,
{
    loop {
        let mut guard = match async_fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Tun poll error: {e}");
                return;
            }
        };

        let mut buf = BytesMut::zeroed(read_buffer_size);
        let n = match guard.try_io(|_| read(&mut buf)) {
            // Spurious wakeup, readiness is cleared.
            Err(_would_block) => continue,
            Ok(Ok(Ready::Closed)) => {
                debug!("Device closed, stop polling");
                return;
            }
            // Readiness is left set, more frames might be queued. It is cleared by the next
            // read which would block.
            Ok(Ok(Ready::Frame(0))) => {
                debug!("Tun read returned no data");
                continue;
            }
            Ok(Ok(Ready::Frame(n))) => n,
            Ok(Err(e)) => {
                metrics.read_error();
                error!("Tun read error: {e}");
                continue;
            }
        };
        drop(guard);

        buf.truncate(n);
        let Some(packet) = framing.payload(buf.freeze()) else {
            trace!(n, "Ignoring frame without payload");
            continue;
        };

        let Some(sender) = sender.upgrade() else {
            // Registration is gone.
            return;
        };
        let len = packet.len();
        if sender.send(packet).await.is_err() {
            warn!("Could not deliver packet, consumer is gone");
            return;
        }
        metrics.packet_delivered(len);
    }
}

/// Drain `receiver` on a new thread, calling `callback` for every packet. The thread exits
/// once the sending side of the channel is released.
pub(crate) fn spawn_delivery<F>(
    name: &str,
    mut receiver: mpsc::Receiver<Bytes>,
    mut callback: F,
) -> io::Result<()>
where
    F: FnMut(Bytes) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tun-deliver-{name}"))
        .spawn(move || {
            while let Some(packet) = receiver.blocking_recv() {
                callback(packet);
            }
            debug!("Delivery channel closed");
        })?;
    Ok(())
}

/// Turn the receiving side of a delivery channel into a [`Stream`].
pub(crate) fn into_stream(receiver: mpsc::Receiver<Bytes>) -> impl Stream<Item = Bytes> {
    tokio_stream::wrappers::ReceiverStream::new(receiver)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::frame::Framing;
    use crate::metrics::NoMetrics;
    use crate::sys;

    use super::{EventLoop, PollConfig, PollRegistration, Ready};

    fn socket_reader(socket: Arc<UnixDatagram>) -> impl FnMut(&mut [u8]) -> io::Result<Ready> {
        move |buf| sys::read(socket.as_raw_fd(), buf).map(Ready::Frame)
    }

    #[test]
    fn delivers_unframed_packets() {
        let event_loop = EventLoop::new().unwrap();
        let (device, kernel) = UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let device = Arc::new(device);

        let (_registration, mut receiver) = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            socket_reader(device.clone()),
            Framing::AddressFamily,
            PollConfig::default(),
            NoMetrics,
        )
        .unwrap();

        // Frames without payload are not delivered.
        kernel.send(&[0, 0, 0, 30]).unwrap();
        kernel.send(&[0, 0, 0, 30, 0x60, 1, 2, 3]).unwrap();

        let packet = receiver.blocking_recv().unwrap();
        assert_eq!(&packet[..], &[0x60, 1, 2, 3]);
    }

    /// Forward delivered packets to a channel which supports receiving with a timeout.
    fn forward(mut receiver: mpsc::Receiver<Bytes>) -> std_mpsc::Receiver<Bytes> {
        let (tx, rx) = std_mpsc::channel();
        std::thread::spawn(move || {
            while let Some(packet) = receiver.blocking_recv() {
                if tx.send(packet).is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[test]
    fn empty_frame_does_not_stall_queued_packets() {
        let event_loop = EventLoop::new().unwrap();
        let (device, kernel) = UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let device = Arc::new(device);

        // Queue both frames before the handle is registered, so a single readiness event
        // covers them.
        kernel.send(&[]).unwrap();
        kernel.send(&[0x45, 1, 2, 3]).unwrap();

        let (_registration, receiver) = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            socket_reader(device.clone()),
            Framing::Raw,
            PollConfig::default(),
            NoMetrics,
        )
        .unwrap();

        let packets = forward(receiver);
        let packet = packets.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&packet[..], &[0x45, 1, 2, 3]);
    }

    #[test]
    fn read_error_does_not_stall_queued_packets() {
        let event_loop = EventLoop::new().unwrap();
        let (device, kernel) = UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let device = Arc::new(device);

        kernel.send(&[0x45, 4, 5, 6]).unwrap();
        kernel.send(&[0x45, 7, 8, 9]).unwrap();

        let mut read = socket_reader(device.clone());
        let mut failed = false;
        let (_registration, receiver) = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            move |buf: &mut [u8]| {
                if !failed {
                    failed = true;
                    return Err(io::Error::from_raw_os_error(libc::EIO));
                }
                read(buf)
            },
            Framing::Raw,
            PollConfig::default(),
            NoMetrics,
        )
        .unwrap();

        let packets = forward(receiver);
        let first = packets.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = packets.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&first[..], &[0x45, 4, 5, 6]);
        assert_eq!(&second[..], &[0x45, 7, 8, 9]);
    }

    #[test]
    fn full_channel_suspends_reading() {
        let event_loop = EventLoop::new().unwrap();
        let (device, kernel) = UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let device = Arc::new(device);
        let reads = Arc::new(AtomicUsize::new(0));

        let mut read = socket_reader(device.clone());
        let counter = reads.clone();
        let (_registration, mut receiver) = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            move |buf: &mut [u8]| {
                let res = read(buf);
                if res.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                res
            },
            Framing::Raw,
            PollConfig::default(),
            NoMetrics,
        )
        .unwrap();

        for i in 0..4u8 {
            kernel.send(&[i]).unwrap();
        }
        std::thread::sleep(Duration::from_millis(200));

        // One packet in the channel, one waiting to be sent.
        assert_eq!(reads.load(Ordering::SeqCst), 2);

        for i in 0..4u8 {
            assert_eq!(&receiver.blocking_recv().unwrap()[..], &[i]);
        }
    }

    #[test]
    fn dropping_registration_closes_channel() {
        let event_loop = EventLoop::new().unwrap();
        let (device, _kernel) = UnixDatagram::pair().unwrap();
        device.set_nonblocking(true).unwrap();
        let device = Arc::new(device);

        let (registration, mut receiver) = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            socket_reader(device.clone()),
            Framing::Raw,
            PollConfig::default(),
            NoMetrics,
        )
        .unwrap();

        drop(registration);
        assert!(receiver.blocking_recv().is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let event_loop = EventLoop::new().unwrap();
        let (device, _kernel) = UnixDatagram::pair().unwrap();
        let device = Arc::new(device);

        let res = PollRegistration::start(
            &event_loop,
            device.as_raw_fd(),
            socket_reader(device.clone()),
            Framing::Raw,
            PollConfig {
                channel_capacity: 0,
                ..PollConfig::default()
            },
            NoMetrics,
        );
        assert!(res.is_err());
    }
}
