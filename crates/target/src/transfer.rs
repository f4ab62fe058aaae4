//! Requests, completions and synchronous rejections
//!
//! A [`Request`] is moved into the transfer subsystem on submission and comes
//! back to the caller exactly once, inside the [`TransferCompletion`] handed to
//! the caller's [`Completion`]. When a submission is refused before anything is
//! queued, the request is returned in the [`Rejected`] error instead and the
//! completion is dropped without being called.

use protocol::{IsoPacketDescriptor, RequestId, UsbError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Caller-supplied completion routine
///
/// Invoked once, from the transfer subsystem's own thread.
pub type Completion = Box<dyn FnOnce(TransferCompletion) + Send + 'static>;

/// Box a closure as a [`Completion`]
pub fn completion<F>(f: F) -> Completion
where
    F: FnOnce(TransferCompletion) + Send + 'static,
{
    Box::new(f)
}

/// A unit of transfer work: caller ID plus the data buffer
///
/// For OUT transfers the buffer holds the payload; for IN transfers its length
/// is the maximum number of bytes to receive.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub buffer: Vec<u8>,
}

impl Request {
    pub fn new(id: RequestId, buffer: Vec<u8>) -> Self {
        Self { id, buffer }
    }

    /// IN request with a zeroed buffer of `len` bytes
    pub fn with_len(id: RequestId, len: usize) -> Self {
        Self {
            id,
            buffer: vec![0u8; len],
        }
    }
}

/// Result of a finished transfer, delivered to the completion routine
#[derive(Debug)]
pub struct TransferCompletion {
    /// The request, handed back to the caller
    pub request: Request,
    /// Endpoint the transfer was submitted to
    pub endpoint: u8,
    /// Success, or why the transfer failed or was cancelled
    pub status: Result<(), UsbError>,
    /// Bytes actually moved across the bus
    pub bytes_transferred: usize,
    /// Per-packet results, empty unless the transfer was isochronous
    pub iso_packets: Vec<IsoPacketDescriptor>,
}

impl TransferCompletion {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.status, Err(UsbError::Cancelled))
    }

    /// Received bytes of an IN transfer
    pub fn data(&self) -> &[u8] {
        let len = self.bytes_transferred.min(self.request.buffer.len());
        &self.request.buffer[..len]
    }
}

/// A submission refused synchronously; no completion will fire
#[derive(Debug, Error)]
#[error("transfer to endpoint {endpoint:#04x} rejected: {error}")]
pub struct Rejected {
    pub endpoint: u8,
    pub error: UsbError,
    pub request: Request,
}

impl From<Rejected> for UsbError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Completion that forwards into a oneshot channel
///
/// Lets async callers `.await` a transfer instead of supplying a callback.
pub fn oneshot_completion() -> (Completion, CompletionReceiver) {
    let (tx, rx) = oneshot::channel();
    let completion = completion(move |done| {
        // Receiver dropped means nobody is waiting any more
        let _ = tx.send(done);
    });
    (completion, CompletionReceiver { rx })
}

/// Receiving half of [`oneshot_completion`]
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: oneshot::Receiver<TransferCompletion>,
}

impl CompletionReceiver {
    /// Wait for the transfer to finish
    pub async fn wait(self) -> common::Result<TransferCompletion> {
        self.rx
            .await
            .map_err(|e| common::Error::Channel(format!("completion dropped: {}", e)))
    }

    /// Blocking wait; must not be called from inside an async runtime
    pub fn blocking_wait(self) -> common::Result<TransferCompletion> {
        self.rx
            .blocking_recv()
            .map_err(|e| common::Error::Channel(format!("completion dropped: {}", e)))
    }

    /// Non-blocking check, returns the receiver back if still pending
    pub fn try_take(mut self) -> Result<TransferCompletion, Self> {
        match self.rx.try_recv() {
            Ok(done) => Ok(done),
            Err(_) => Err(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done(bytes: usize, status: Result<(), UsbError>) -> TransferCompletion {
        TransferCompletion {
            request: Request::new(RequestId(1), vec![1, 2, 3, 4]),
            endpoint: 0x81,
            status,
            bytes_transferred: bytes,
            iso_packets: Vec::new(),
        }
    }

    #[test]
    fn test_data_is_truncated_to_bytes_transferred() {
        assert_eq!(done(2, Ok(())).data(), &[1, 2]);
        assert_eq!(done(10, Ok(())).data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_status() {
        let c = done(0, Err(UsbError::Cancelled));
        assert!(c.is_cancelled());
        assert!(!c.is_success());
    }

    #[test]
    fn test_rejected_display() {
        let rejected = Rejected {
            endpoint: 0x05,
            error: UsbError::NotFound,
            request: Request::with_len(RequestId(9), 8),
        };
        assert_eq!(
            rejected.to_string(),
            "transfer to endpoint 0x05 rejected: not found"
        );
        assert_eq!(UsbError::from(rejected), UsbError::NotFound);
    }

    #[tokio::test]
    async fn test_oneshot_completion_delivers() {
        let (completion, rx) = oneshot_completion();
        std::thread::spawn(move || completion(done(3, Ok(()))));

        let result = rx.wait().await.unwrap();
        assert_eq!(result.bytes_transferred, 3);
    }

    #[tokio::test]
    async fn test_oneshot_completion_dropped() {
        let (completion, rx) = oneshot_completion();
        drop(completion);
        assert!(matches!(rx.wait().await, Err(common::Error::Channel(_))));
    }

    #[test]
    fn test_try_take_pending() {
        let (completion, rx) = oneshot_completion();
        let rx = rx.try_take().unwrap_err();
        completion(done(1, Ok(())));
        assert!(rx.try_take().is_ok());
    }
}
