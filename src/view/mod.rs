//! Headless views: one task per mounted view, owning its channel handle,
//! reconciler and notices.
//!
//! A view task runs fetch, then connect, then the event loop. Commands reach
//! it over a bounded mpsc queue and every step republishes a snapshot on a
//! watch channel.

pub mod navigator;
pub mod notice;
pub mod race;
pub mod reunion;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::cache::{get_json, put_json, CacheKey, CacheStore};
use crate::config::COMMAND_CAPACITY;
use crate::error::{AppError, Result};
use crate::ws::ChannelEvent;

pub use navigator::Navigator;
pub use notice::{NoticeBoard, NoticeKind, NoticeView};
pub use race::{RaceCommand, RaceSnapshot, RaceView};
pub use reunion::{ReunionCommand, ReunionSnapshot, ReunionView};

// ---------------------------------------------------------------------------
// Initial load
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Loading,
    Fresh,
    FromCache,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome<T> {
    Fresh(T),
    FromCache(T),
    Unavailable,
}

impl<T> SnapshotOutcome<T> {
    pub fn load_state(&self) -> LoadState {
        match self {
            SnapshotOutcome::Fresh(_) => LoadState::Fresh,
            SnapshotOutcome::FromCache(_) => LoadState::FromCache,
            SnapshotOutcome::Unavailable => LoadState::Failed,
        }
    }
}

/// Writes a fresh result through to the cache, or falls back to the cached
/// entry when the fetch failed.
pub async fn fresh_or_cached<T, C>(fetched: Result<T>, cache: &C, key: &CacheKey) -> SnapshotOutcome<T>
where
    T: Serialize + serde::de::DeserializeOwned + Send + Sync,
    C: CacheStore + ?Sized,
{
    match fetched {
        Ok(value) => {
            put_json(cache, key, &value).await;
            SnapshotOutcome::Fresh(value)
        }
        Err(e) => {
            warn!(key = %key, "fetch failed, trying cache: {e}");
            match get_json(cache, key).await {
                Some(value) => SnapshotOutcome::FromCache(value),
                None => SnapshotOutcome::Unavailable,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// View task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Unmount,
}

pub trait LiveView: Send + 'static {
    type Loaded: Send + 'static;
    type Command: Send + 'static;
    type Snapshot: Clone + Send + Sync + 'static;

    /// Initial fetch. Owns everything it touches so the task can drop it
    /// mid-flight when the view is unmounted.
    fn load(&self) -> BoxFuture<'static, Self::Loaded>;

    fn apply_loaded(&mut self, loaded: Self::Loaded, now: Instant);

    /// Registers sinks and connects. Called once, after the load settles.
    fn open_channels(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent>;

    fn handle_event(
        &mut self,
        event: ChannelEvent,
        now: Instant,
    ) -> impl std::future::Future<Output = ()> + Send;

    fn handle_command(&mut self, command: Self::Command, now: Instant) -> Control;

    /// Runs whatever became due at `now`: coalesced applies, notice expiry.
    fn on_tick(&mut self, now: Instant);

    fn next_deadline(&self) -> Option<Instant>;

    /// Disconnects every channel and drops pending work.
    fn unmount(&mut self);

    fn snapshot(&self) -> Self::Snapshot;
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Runs `view` until it is unmounted or every handle is dropped.
pub async fn drive<V: LiveView>(
    mut view: V,
    mut commands: mpsc::Receiver<V::Command>,
    published: watch::Sender<V::Snapshot>,
) {
    let load = view.load();
    tokio::pin!(load);

    // Commands are still served while the fetch is in flight; an unmount
    // here drops the fetch before it can touch the view.
    let loaded = loop {
        tokio::select! {
            loaded = &mut load => break loaded,
            command = commands.recv() => {
                let control = match command {
                    Some(command) => view.handle_command(command, Instant::now()),
                    None => Control::Unmount,
                };
                if control == Control::Unmount {
                    debug!("unmounted during initial load, discarding fetch");
                    view.unmount();
                    published.send_replace(view.snapshot());
                    return;
                }
                published.send_replace(view.snapshot());
            }
        }
    };

    view.apply_loaded(loaded, Instant::now());
    let mut events = view.open_channels();
    published.send_replace(view.snapshot());

    let mut events_open = true;
    loop {
        let deadline = view.next_deadline();
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => view.handle_event(event, Instant::now()).await,
                None => events_open = false,
            },
            command = commands.recv() => {
                let control = match command {
                    Some(command) => view.handle_command(command, Instant::now()),
                    None => Control::Unmount,
                };
                if control == Control::Unmount {
                    view.unmount();
                    published.send_replace(view.snapshot());
                    return;
                }
            }
            _ = sleep_until_deadline(deadline) => view.on_tick(Instant::now()),
        }
        published.send_replace(view.snapshot());
    }
}

/// Caller side of a running view.
pub struct ViewHandle<C, S> {
    commands: mpsc::Sender<C>,
    snapshot: watch::Receiver<S>,
}

impl<C, S> Clone for ViewHandle<C, S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<C: Send, S: Clone> ViewHandle<C, S> {
    pub fn snapshot(&self) -> S {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<S> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn send(&self, command: C) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::ViewClosed)
    }

    /// Sends `command` and returns the first snapshot published after it.
    pub async fn request(&self, command: C) -> Result<S> {
        let mut rx = self.snapshot.clone();
        rx.borrow_and_update();
        self.send(command).await?;
        rx.changed().await.map_err(|_| AppError::ViewClosed)?;
        let snapshot = rx.borrow().clone();
        Ok(snapshot)
    }
}

pub fn spawn<V: LiveView>(view: V) -> (ViewHandle<V::Command, V::Snapshot>, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (published, snapshot) = watch::channel(view.snapshot());
    let task = tokio::spawn(drive(view, commands_rx, published));
    (
        ViewHandle {
            commands: commands_tx,
            snapshot,
        },
        task,
    )
}

// ---------------------------------------------------------------------------
// Test doubles shared by the view tests
// ---------------------------------------------------------------------------
