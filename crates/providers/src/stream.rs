// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded output stream for streaming execution.
//!
//! Producers push `{bytes, exit}` events into a bounded channel; the
//! consumer reads until `Exited` or cancels, which tears the producer down
//! through the shared token.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel capacity; producers block (apply backpressure) past this.
const STREAM_CAPACITY: usize = 64;

/// One event on an execution stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Terminal event; no further events follow.
    Exited(i32),
}

/// Consumer half of a streaming execution.
pub struct ExecStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl ExecStream {
    /// Next event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Ask the producer to stop; the underlying process is killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the producer; cancelling it stops the stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Create the producer/consumer pair for one streaming execution.
pub fn exec_stream_channel() -> (mpsc::Sender<StreamEvent>, CancellationToken, ExecStream) {
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
    let cancel = CancellationToken::new();
    let stream = ExecStream { rx, cancel: cancel.clone() };
    (tx, cancel, stream)
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
