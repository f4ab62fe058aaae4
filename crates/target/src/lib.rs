//! USB interface/endpoint topology with asynchronous transfer dispatch
//!
//! A [`Target`] models one bound USB device as a fixed list of [`Interface`]s,
//! each owning the [`Pipe`]s of its active alternate setting. Transfers are
//! routed by endpoint address to the pipe that currently owns it and handed
//! to a [`UsbBackend`], which completes them asynchronously.
//!
//! Lookups hold the owning interface's lock shared for the whole submission,
//! so an alternate-setting switch (which holds it exclusively) can never drop
//! a pipe that a submission is still using.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use common::test_utils::{bulk_in, bulk_out, next_request_id};
//! use usb_target::mock::{MockBackend, MockInterface};
//! use usb_target::{Request, Target, oneshot_completion};
//!
//! let device = Arc::new(MockBackend::new(vec![MockInterface::new(
//!     0,
//!     vec![vec![bulk_in(1, 512), bulk_out(2, 512)]],
//! )]));
//! let target = Target::create(device).unwrap();
//!
//! let (completion, done) = oneshot_completion();
//! target
//!     .read_pipe_async(0x81, Request::with_len(next_request_id(), 64), completion)
//!     .unwrap();
//! assert!(done.blocking_wait().unwrap().is_success());
//! ```

pub mod backend;
pub mod interface;
pub mod lock;
pub mod mock;
pub mod pipe;
pub mod rusb_backend;
pub mod target;
pub mod transfer;

pub use backend::{Transfer, TransferKind, UsbBackend};
pub use interface::{Interface, PipeSet};
pub use lock::{LockPolicy, PolicyGuard, PolicyLock};
pub use pipe::Pipe;
pub use rusb_backend::{RusbBackend, RusbSettings, map_rusb_error};
pub use target::{InterfaceTopology, Target};
pub use transfer::{
    Completion, CompletionReceiver, Rejected, Request, TransferCompletion, completion,
    oneshot_completion,
};
