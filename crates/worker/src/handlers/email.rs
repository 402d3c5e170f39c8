//! Email send jobs: drain the outbox through the notifier.
//!
//! A failed delivery keeps the undelivered tail in the outbox and
//! returns the transient error, so the retry attempt picks up where
//! this one stopped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vantage_core::error::CoreError;

use crate::dispatch::{HandlerOutcome, JobContext, JobHandler};
use crate::notify::{Notice, Notifier};

#[derive(Default)]
struct Outbox {
    pending: VecDeque<Notice>,
}

pub struct EmailSendHandler {
    outbox: Mutex<Outbox>,
    notifier: Arc<dyn Notifier>,
}

impl EmailSendHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            outbox: Mutex::new(Outbox::default()),
            notifier,
        }
    }

    /// Stage an email for the next send job.
    pub fn queue(&self, notice: Notice) {
        self.outbox
            .lock()
            .expect("outbox lock poisoned")
            .pending
            .push_back(notice);
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().expect("outbox lock poisoned").pending.len()
    }
}

#[async_trait]
impl JobHandler for EmailSendHandler {
    async fn run(&self, ctx: &JobContext) -> Result<HandlerOutcome, CoreError> {
        let mut sent: u64 = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let Some(notice) = self
                .outbox
                .lock()
                .expect("outbox lock poisoned")
                .pending
                .pop_front()
            else {
                break;
            };

            if let Err(e) = self.notifier.send(notice.clone()).await {
                // Put it back for the retry attempt.
                self.outbox
                    .lock()
                    .expect("outbox lock poisoned")
                    .pending
                    .push_front(notice);
                return Err(e);
            }
            sent += 1;
        }

        Ok(HandlerOutcome {
            rows_processed: sent,
            warnings: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio_util::sync::CancellationToken;
    use vantage_core::job::{Job, JobKind, PRIORITY_NORMAL};
    use vantage_events::ProgressHub;

    use crate::notify::RecordingNotifier;

    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            job: Job::new(JobKind::EmailSend, uuid::Uuid::now_v7(), PRIORITY_NORMAL),
            execution_id: uuid::Uuid::now_v7(),
            cancel: CancellationToken::new(),
            hub: Arc::new(ProgressHub::default()),
            started: Instant::now(),
        }
    }

    fn notice(subject: &str) -> Notice {
        Notice {
            entity_id: uuid::Uuid::now_v7(),
            subject: subject.into(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn drains_the_whole_outbox() {
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = EmailSendHandler::new(Arc::clone(&notifier) as Arc<dyn Notifier>);
        handler.queue(notice("one"));
        handler.queue(notice("two"));

        let outcome = handler.run(&ctx()).await.unwrap();
        assert_eq!(outcome.rows_processed, 2);
        assert_eq!(handler.pending(), 0);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn failed_send_keeps_the_tail_for_retry() {
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = EmailSendHandler::new(Arc::clone(&notifier) as Arc<dyn Notifier>);
        handler.queue(notice("one"));
        handler.queue(notice("two"));
        notifier.fail_next_sends(1); // "one" fails on the first attempt

        let err = handler.run(&ctx()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(handler.pending(), 2, "failed notice goes back to the front");

        // The retry attempt resumes in order.
        let outcome = handler.run(&ctx()).await.unwrap();
        assert_eq!(outcome.rows_processed, 2);
        assert_eq!(notifier.sent()[0].subject, "one");
    }

    #[tokio::test]
    async fn empty_outbox_completes_with_zero_sent() {
        let handler = EmailSendHandler::new(Arc::new(RecordingNotifier::new()));
        let outcome = handler.run(&ctx()).await.unwrap();
        assert_eq!(outcome.rows_processed, 0);
    }
}
