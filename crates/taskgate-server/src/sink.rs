//! One-shot streaming response sink.
//!
//! A watch response stays open while the session waits, carrying
//! keep-alive whitespace, and then exactly one terminal JSON payload.
//! The sink enforces the single-shot guarantee: once finished (or once
//! the client side is gone) every further write is a no-op.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Writer side of an open HTTP response body.
pub struct ResponseSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ResponseSink {
    /// Create a sink and the receiver the response body streams from.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }

    /// Resolves when the client side of the response is gone.
    ///
    /// Never resolves after [`finish`](Self::finish); the caller stops
    /// waiting on disconnect once the terminal payload is out.
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => futures::future::pending().await,
        }
    }

    /// Write one keep-alive whitespace byte.
    ///
    /// Returns `false` if the client is gone (or the sink already
    /// finished); the caller should tear down. A full body buffer only
    /// means a slow reader, so that tick is skipped and the sink stays
    /// usable.
    pub fn write_keepalive(&self) -> bool {
        match &self.tx {
            Some(tx) => match tx.try_send(Bytes::from_static(b"\n")) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Deliver the terminal payload and close the body.
    ///
    /// Idempotent: only the first call writes anything. Returns `true`
    /// if the payload was handed to the live response.
    pub async fn finish(&mut self, body: String) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(Bytes::from(body)).await.is_ok(),
            None => false,
        }
    }

    /// Whether a terminal payload has already been delivered.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }
}
