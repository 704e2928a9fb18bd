//! weft-iface: async networking and convenience entry points on top of
//! `weft-rt`.
//!
//! # Quick Start
//!
//! ```ignore
//! use weft_iface::{block_on, spawn, TcpListener, TcpStream};
//!
//! block_on(async {
//!     let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap())?;
//!     let addr = listener.local_addr()?;
//!     spawn(async move {
//!         let (stream, _) = listener.accept().await?;
//!         stream.write_all(b"hello").await
//!     })?;
//!
//!     let stream = TcpStream::connect(addr).await?;
//!     let mut buf = [0u8; 5];
//!     stream.read(&mut buf).await
//! })?;
//! ```

#![cfg(unix)]

mod sys;
pub mod tcp;

pub use tcp::{TcpListener, TcpStream};
pub use weft_rt::{
    sleep, sleep_until, spawn, spawn_local, yield_now, AsyncFd, Builder, Runtime, RuntimeError,
    TaskError, TaskHandle,
};

use std::future::Future;
use std::io;

/// Runs `future` on a private runtime, waits for it and for every task it
/// spawned, then shuts the runtime down.
///
/// The runtime does not claim the process-wide slot, so `block_on` can run
/// next to an installed runtime.
pub fn block_on<F>(future: F) -> io::Result<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let rt = Builder::new().install_global(false).build()?;
    let outcome = rt.spawn(future)?.join();
    rt.shutdown()?;
    outcome.map_err(io::Error::other)
}
