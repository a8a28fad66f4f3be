//! Latest-value-wins progress streams with a terminal outcome.
//!
//! Slow subscribers may skip intermediate values, but always observe the most recent
//! progress and the terminal event.

use crate::{error::DownloadError, model::DownloadProgress};
use futures_util::Stream;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
  pub progress: DownloadProgress,
  pub outcome: Option<Result<(), DownloadError>>,
}

pub(crate) struct ProgressSender {
  tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressSender {
  pub(crate) fn new(initial: DownloadProgress) -> Self {
    let (tx, _) = watch::channel(ProgressSnapshot {
      progress: initial,
      outcome: None,
    });
    Self { tx }
  }

  pub(crate) fn send(&self, progress: DownloadProgress) {
    self.tx.send_if_modified(|s| {
      if s.outcome.is_some() {
        return false;
      }
      s.progress = progress;
      true
    });
  }

  /// Publishes the terminal outcome. Only the first call has an effect.
  pub(crate) fn finish(&self, progress: Option<DownloadProgress>, outcome: Result<(), DownloadError>) -> bool {
    self.tx.send_if_modified(|s| {
      if s.outcome.is_some() {
        return false;
      }
      if let Some(p) = progress {
        s.progress = p;
      }
      s.outcome = Some(outcome);
      true
    })
  }

  pub(crate) fn current(&self) -> DownloadProgress {
    self.tx.borrow().progress
  }

  pub(crate) fn subscribe(&self) -> ProgressReceiver {
    ProgressReceiver {
      rx: self.tx.subscribe(),
      state: ReceiverState::Fresh,
    }
  }
}

#[derive(Debug, Clone)]
enum ReceiverState {
  Fresh,
  Open,
  Terminal(Result<(), DownloadError>),
  Done,
}

#[derive(Debug, Clone)]
pub struct ProgressReceiver {
  rx: watch::Receiver<ProgressSnapshot>,
  state: ReceiverState,
}

impl ProgressReceiver {
  pub fn current(&self) -> DownloadProgress {
    self.rx.borrow().progress
  }

  pub fn outcome(&self) -> Option<Result<(), DownloadError>> {
    self.rx.borrow().outcome.clone()
  }

  /// Next progress value. After the terminal snapshot: `Err` on failure, then `None`.
  pub async fn next(&mut self) -> Option<Result<DownloadProgress, DownloadError>> {
    match std::mem::replace(&mut self.state, ReceiverState::Done) {
      ReceiverState::Done => return None,
      ReceiverState::Terminal(outcome) => return outcome.err().map(Err),
      ReceiverState::Fresh => {
        let snap = self.rx.borrow_and_update().clone();
        return Some(Ok(self.observe(snap)));
      }
      ReceiverState::Open => self.state = ReceiverState::Open,
    }
    if self.rx.changed().await.is_err() {
      self.state = ReceiverState::Done;
      return None;
    }
    let snap = self.rx.borrow_and_update().clone();
    Some(Ok(self.observe(snap)))
  }

  fn observe(&mut self, snap: ProgressSnapshot) -> DownloadProgress {
    self.state = match snap.outcome {
      Some(outcome) => ReceiverState::Terminal(outcome),
      None => ReceiverState::Open,
    };
    snap.progress
  }

  /// Waits for the terminal outcome. A stream dropped before finishing counts as cancelled.
  pub async fn completion(&self) -> Result<(), DownloadError> {
    let mut rx = self.rx.clone();
    let outcome = rx
      .wait_for(|s| s.outcome.is_some())
      .await
      .map(|s| s.outcome.clone());
    match outcome {
      Ok(Some(result)) => result,
      _ => Err(DownloadError::Cancelled),
    }
  }

  pub fn into_stream(self) -> impl Stream<Item = Result<DownloadProgress, DownloadError>> + Send {
    futures_util::stream::unfold(self, |mut rx| async move {
      let item = rx.next().await?;
      Some((item, rx))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures_util::StreamExt;

  #[tokio::test]
  async fn late_subscriber_sees_final_value_and_success() {
    let tx = ProgressSender::new(DownloadProgress::default());
    tx.send(DownloadProgress::new(10.0, 5.0));
    tx.finish(Some(DownloadProgress::finished()), Ok(()));

    let items: Vec<_> = tx.subscribe().into_stream().collect().await;
    assert_eq!(items, vec![Ok(DownloadProgress::finished())]);
  }

  #[tokio::test]
  async fn failure_is_delivered_after_last_progress() {
    let tx = ProgressSender::new(DownloadProgress::default());
    let mut rx = tx.subscribe();
    assert_eq!(rx.next().await, Some(Ok(DownloadProgress::default())));

    tx.send(DownloadProgress::new(4.0, 1.0));
    assert_eq!(rx.next().await, Some(Ok(DownloadProgress::new(4.0, 1.0))));

    assert!(tx.finish(None, Err(DownloadError::NoDiskSpace)));
    assert!(!tx.finish(None, Ok(())));
    tx.send(DownloadProgress::new(4.0, 4.0));

    assert_eq!(rx.next().await, Some(Ok(DownloadProgress::new(4.0, 1.0))));
    assert_eq!(rx.next().await, Some(Err(DownloadError::NoDiskSpace)));
    assert_eq!(rx.next().await, None);
    assert_eq!(rx.completion().await, Err(DownloadError::NoDiskSpace));
  }

  #[tokio::test]
  async fn dropped_sender_ends_stream() {
    let tx = ProgressSender::new(DownloadProgress::default());
    let mut rx = tx.subscribe();
    rx.next().await;
    drop(tx);
    assert_eq!(rx.next().await, None);
    assert_eq!(rx.completion().await, Err(DownloadError::Cancelled));
  }
}
