//! This module is used for collection of runtime metrics of tun devices. The main item of
//! interest is the [`Metrics`] trait. Users can provide their own implementation of this, or use
//! [`NoMetrics`] to disable gathering metrics.

/// The collection of all metrics exported by a [`TunDevice`](crate::device::TunDevice). It is
/// up to the user to provide an implementation which implements the methods for metrics they are
/// interested in. All methods have a default implementation, so if the user is not interested in
/// any metrics, a NOOP handler can be implemented as follows:
///
/// ```rust
/// use tuntap::metrics::Metrics;
///
/// #[derive(Clone)]
/// struct Silent;
/// impl Metrics for Silent {}
/// ```
pub trait Metrics {
    /// A device was opened.
    #[inline]
    fn device_opened(&self) {}

    /// A device was closed.
    #[inline]
    fn device_closed(&self) {}

    /// A device handle was registered with the [`EventLoop`](crate::poll::EventLoop).
    #[inline]
    fn poll_started(&self) {}

    /// A poll registration was removed, either explicitly or because the device was closed.
    #[inline]
    fn poll_stopped(&self) {}

    /// A new delivery channel was created for a poll registration.
    #[inline]
    fn delivery_channel_opened(&self) {}

    /// The sending side of a delivery channel was released.
    #[inline]
    fn delivery_channel_closed(&self) {}

    /// A packet of the given size was read through [`TunDevice::read`](crate::device::TunDevice::read).
    #[inline]
    fn packet_read(&self, _len: usize) {}

    /// A packet of the given size was written to the device.
    #[inline]
    fn packet_written(&self, _len: usize) {}

    /// A packet of the given size was handed to the delivery channel of a poll registration.
    #[inline]
    fn packet_delivered(&self, _len: usize) {}

    /// Reading from the device after a readiness notification failed.
    #[inline]
    fn read_error(&self) {}
}

/// A [`Metrics`] implementation which does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {}
