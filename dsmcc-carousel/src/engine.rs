//! Async front of the receiver.
//!
//! [`Engine`] is a cheap handle: every call turns into an [`Action`] sent
//! to one worker task, which owns the [`Context`] and is the only code that
//! touches carousel state. The worker sleeps until either an action arrives
//! or the earliest timeout is due.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::callbacks::{CarouselListener, DvbStack, SubscriptionId};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::orchestrator::{Action, Context};

enum Command {
    Apply(Action),
    Close(oneshot::Sender<()>),
}

pub struct Engine {
    tx: mpsc::UnboundedSender<Command>,
    next_subscription: AtomicU64,
    worker: JoinHandle<()>,
}

impl Engine {
    /// Create the cache directory, restore saved state and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: EngineConfig, dvb: Arc<dyn DvbStack>) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.cache_dir)?;
        info!(
            "Opening carousel engine at {:?} (keep_cache={})",
            config.cache_dir, config.keep_cache
        );
        let mut ctx = Context::new(config, dvb);
        ctx.load();

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(ctx, rx));
        Ok(Self {
            tx,
            next_subscription: AtomicU64::new(1),
            worker,
        })
    }

    fn send(&self, action: Action) -> Result<(), EngineError> {
        self.tx
            .send(Command::Apply(action))
            .map_err(|_| EngineError::Closed)
    }

    /// Start receiving the carousel on `pid` into `download_path`.
    pub fn queue_carousel(
        &self,
        pid: u16,
        transaction_id: u32,
        download_path: impl Into<PathBuf>,
        listener: Arc<dyn CarouselListener>,
    ) -> Result<SubscriptionId, EngineError> {
        let subscription = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.send(Action::QueueCarousel {
            subscription,
            pid,
            transaction_id,
            download_path: download_path.into(),
            listener,
        })?;
        Ok(subscription)
    }

    pub fn dequeue_carousel(&self, subscription: SubscriptionId) -> Result<(), EngineError> {
        self.send(Action::DequeueCarousel(subscription))
    }

    /// Hand over one complete section received on `pid`.
    pub fn add_section(&self, pid: u16, data: impl Into<Bytes>) -> Result<(), EngineError> {
        self.send(Action::AddSection {
            pid,
            data: data.into(),
        })
    }

    pub fn cache_clear(&self) -> Result<(), EngineError> {
        self.send(Action::CacheClear)
    }

    pub fn cache_clear_carousel(&self, carousel_id: u32) -> Result<(), EngineError> {
        self.send(Action::CacheClearCarousel(carousel_id))
    }

    /// Process everything already queued, stop all downloads and wait for
    /// the worker to finish.
    pub async fn close(self) -> Result<(), EngineError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Close(done_tx))
            .map_err(|_| EngineError::Closed)?;
        let acknowledged = done_rx.await.is_ok();
        self.worker
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        if !acknowledged {
            warn!("Carousel engine worker stopped without finishing the close");
            return Err(EngineError::Closed);
        }
        info!("Carousel engine closed");
        Ok(())
    }
}

async fn run(mut ctx: Context, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut pending: VecDeque<Action> = VecDeque::new();
    let mut closing: Option<oneshot::Sender<()>> = None;

    loop {
        if pending.is_empty() && closing.is_none() {
            let deadline = ctx.next_deadline();
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => accept(command, &mut pending, &mut closing),
                    None => {
                        debug!("All engine handles dropped");
                        break;
                    }
                },
                _ = sleep => {}
            }
        }
        // Take whatever else is already waiting.
        while closing.is_none() {
            match rx.try_recv() {
                Ok(command) => accept(command, &mut pending, &mut closing),
                Err(_) => break,
            }
        }

        // Apply in order, yielding to due timeouts. Leftovers stay at the
        // head of the queue for the next pass.
        while let Some(action) = pending.pop_front() {
            ctx.apply(action, now());
            if ctx.next_deadline().map_or(false, |at| at <= now()) {
                break;
            }
        }
        ctx.expire(now());

        if ctx.is_dirty() {
            if let Err(e) = ctx.persist() {
                error!("Failed to save state: {}", e);
            }
        }

        if pending.is_empty() {
            if let Some(done) = closing.take() {
                ctx.shutdown();
                let _ = done.send(());
                return;
            }
        }
    }
    ctx.shutdown();
}

/// Current time on the runtime clock, so paused test time applies.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn accept(
    command: Command,
    pending: &mut VecDeque<Action>,
    closing: &mut Option<oneshot::Sender<()>>,
) {
    match command {
        Command::Apply(action) => pending.push_back(action),
        Command::Close(done) => *closing = Some(done),
    }
}
