use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use tokio::sync::{mpsc, oneshot};
use anyhow::{Context, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Messages sent to the loop thread
enum LoopMessage<S> {
    Run(Job<S>),
    Shutdown,
}

/// Handle to a dedicated thread that owns `S` and runs posted callbacks
/// against it one at a time, in the order they were posted.
pub struct EventLoop<S> {
    tx: mpsc::UnboundedSender<LoopMessage<S>>,
    thread: ThreadId,
}

impl<S> Clone for EventLoop<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread: self.thread,
        }
    }
}

impl<S: Send + 'static> EventLoop<S> {
    /// Spawn the loop thread, moving `state` onto it
    pub fn spawn(name: &str, mut state: S) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LoopMessage<S>>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        LoopMessage::Run(job) => {
                            // A panicking job loses its reply, not the loop
                            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
                                tracing::error!("Event loop job panicked: {}", panic_message(payload.as_ref()));
                            }
                        }
                        LoopMessage::Shutdown => {
                            tracing::debug!("Event loop shutting down");
                            break;
                        }
                    }
                }
            })
            .with_context(|| format!("Failed to spawn event loop thread {}", name))?;

        Ok(Self {
            tx,
            thread: handle.thread().id(),
        })
    }

    /// Queue `job` without waiting for it to run
    pub fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.tx
            .send(LoopMessage::Run(Box::new(job)))
            .map_err(|_| anyhow::anyhow!("event loop is gone"))
    }

    /// Queue `job` and wait for its result.
    ///
    /// Must not be called from the loop thread itself.
    pub async fn post_and_wait<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R> {
        if self.is_loop_thread() {
            anyhow::bail!("post_and_wait called from the event loop thread");
        }

        let (reply, rx) = oneshot::channel();
        self.post(move |state| {
            let _ = reply.send(job(state));
        })?;
        rx.await.context("event loop dropped the job")
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Stop the loop after the jobs already queued
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopMessage::Shutdown);
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
