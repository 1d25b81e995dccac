//! Fire-and-forget maintenance work.
//!
//! Index and history updates run after the primary write has committed, in
//! their own transactions. Tasks run one at a time in spawn order, so a
//! later task always observes what an earlier one wrote. Failures are
//! logged and counted; they never reach the caller of the primary write.
//!
//! On WASM the queue is pumped with `spawn_local` as soon as work arrives.
//! Elsewhere there is no ambient executor and `settle()` drains it.

use crate::error::Result;
use futures_channel::oneshot;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

type Task = Pin<Box<dyn Future<Output = Result<()>>>>;

struct Queued {
    label: String,
    task: Task,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Queued>,
    running: bool,
    failures: usize,
    idle: Vec<oneshot::Sender<()>>,
}

/// Sequential background task queue. Clones share the queue.
#[derive(Clone, Default)]
pub struct BackgroundQueue {
    state: Rc<RefCell<QueueState>>,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `task`; `label` names it in failure logs.
    pub fn spawn(
        &self,
        label: impl Into<String>,
        task: impl Future<Output = Result<()>> + 'static,
    ) {
        self.state.borrow_mut().pending.push_back(Queued {
            label: label.into(),
            task: Box::pin(task),
        });

        #[cfg(target_arch = "wasm32")]
        self.pump();
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Tasks that have failed so far.
    pub fn failures(&self) -> usize {
        self.state.borrow().failures
    }

    /// Resolves once every queued task, including tasks queued meanwhile,
    /// has finished.
    pub async fn settle(&self) {
        let waiting = {
            let mut state = self.state.borrow_mut();
            if state.running {
                let (tx, rx) = oneshot::channel();
                state.idle.push(tx);
                Some(rx)
            } else if state.pending.is_empty() {
                return;
            } else {
                state.running = true;
                None
            }
        };

        match waiting {
            Some(rx) => {
                let _ = rx.await;
            }
            None => self.drain().await,
        }
    }

    #[cfg(target_arch = "wasm32")]
    fn pump(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.running {
                return;
            }
            state.running = true;
        }
        let queue = self.clone();
        wasm_bindgen_futures::spawn_local(async move {
            queue.drain().await;
        });
    }

    async fn drain(&self) {
        loop {
            let next = self.state.borrow_mut().pending.pop_front();
            let Some(Queued { label, task }) = next else {
                break;
            };
            if let Err(e) = task.await {
                log::warn!("Background task {} failed: {}", label, e);
                self.state.borrow_mut().failures += 1;
            }
        }

        let idle = {
            let mut state = self.state.borrow_mut();
            state.running = false;
            std::mem::take(&mut state.idle)
        };
        for waiter in idle {
            let _ = waiter.send(());
        }
    }
}
