//! Cross platform management of tun interfaces.
//!
//! A [`TunDevice`] allocates a layer 3 tun interface through the platform [`Backend`]: the
//! `/dev/net/tun` clone device on linux, or a utun kernel control socket on macos. Packets can
//! be read and written synchronously, or delivered as they arrive by registering the device with
//! an [`EventLoop`].
//!
//! Every device is tracked by a [`ShutdownCoordinator`], which can be asked to refuse new work
//! and close all open devices when the process exits.

pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod metrics;
pub mod poll;
pub mod shutdown;
mod sys;
pub mod task;
pub mod tun;

pub use device::{TunDevice, DEFAULT_READ_SIZE};
pub use error::TunError;
pub use frame::Framing;
pub use poll::{EventLoop, PollConfig};
pub use shutdown::ShutdownCoordinator;
pub use tun::Backend;
