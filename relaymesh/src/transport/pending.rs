// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-peer handshakes run off the accept path
//!
//! Listeners hand every raw connection to [`PendingHandshakes::spawn`] and keep
//! accepting; `accept` then yields whichever handshakes have finished, so a
//! peer that stalls its handshake only delays itself.

use std::{future::Future, net::SocketAddr};

use tokio::sync::{mpsc, Mutex};
use tracing_futures::Instrument;

use super::{BoxedConnection, TransportError};

const COMPLETED_BACKLOG: usize = 64;

type Outcome = Result<BoxedConnection, TransportError>;

pub(crate) struct PendingHandshakes {
  completed_sender: mpsc::Sender<Outcome>,
  completed: Mutex<mpsc::Receiver<Outcome>>,
}

impl PendingHandshakes {
  pub fn new() -> Self {
    let (completed_sender, completed) = mpsc::channel(COMPLETED_BACKLOG);
    Self {
      completed_sender,
      completed: Mutex::new(completed),
    }
  }

  /// Runs `handshake` on its own task and queues its outcome for [`Self::next`]
  pub fn spawn<F>(&self, peer: SocketAddr, handshake: F)
  where
    F: Future<Output = Outcome> + Send + 'static,
  {
    let completed = self.completed_sender.clone();
    tokio::task::spawn(
      async move {
        let outcome = handshake.await;
        if let Err(mpsc::error::SendError(Ok(connection))) = completed.send(outcome).await {
          // The listener went away while this peer was authenticating
          connection.close();
        }
      }
      .instrument(tracing::debug_span!("handshake", %peer)),
    );
  }

  /// Waits for the next finished handshake, successful or not
  pub async fn next(&self) -> Outcome {
    let mut completed = self.completed.lock().await;
    completed
      .recv()
      .await
      .unwrap_or(Err(TransportError::ListenerClosed))
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::PendingHandshakes;
  use crate::transport::{AuthError, BoxedConnection, TransportError};

  #[tokio::test]
  async fn stalled_handshake_does_not_hold_back_finished_ones() {
    let pending = PendingHandshakes::new();
    let peer = "127.0.0.1:1".parse().unwrap();
    pending.spawn(peer, async {
      futures::future::pending::<()>().await;
      Err::<BoxedConnection, _>(TransportError::ConnectionClosed)
    });
    pending.spawn(peer, async {
      Err::<BoxedConnection, _>(TransportError::Authentication(AuthError::Rejected))
    });
    let next = tokio::time::timeout(Duration::from_secs(1), pending.next())
      .await
      .expect("A finished handshake must not wait behind a stalled one");
    assert!(matches!(
      next,
      Err(TransportError::Authentication(AuthError::Rejected))
    ));
  }
}
