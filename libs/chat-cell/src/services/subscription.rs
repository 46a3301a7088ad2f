use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, warn};

use crate::services::store::ChatStore;
use crate::{ChangeEvent, ChatError, ConversationId, Message};

/// Owns the link to the chat store and its lifecycle.
///
/// Passed around by `Arc`; subscriptions end with `ChatError::Subscription`
/// as soon as the manager disconnects.
pub struct ConnectionManager {
    store: Arc<dyn ChatStore>,
    state: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Starts disconnected.
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        let (state, _) = watch::channel(false);
        Self { store, state }
    }

    pub fn connect(&self) {
        if !self.state.send_replace(true) {
            info!("Chat connection established");
        }
    }

    pub fn disconnect(&self) {
        if self.state.send_replace(false) {
            info!("Chat connection closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    fn watch_state(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

type UpdateCallback = Box<dyn Fn(Vec<Message>) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(ChatError) + Send + Sync>;

struct Listener {
    cancelled: AtomicBool,
    /// Held while a callback runs.
    delivering: Mutex<()>,
    /// Thread currently running a callback, if any.
    callback_thread: Mutex<Option<ThreadId>>,
    wake: Notify,
    on_update: UpdateCallback,
    on_error: ErrorCallback,
}

impl Listener {
    fn deliver(&self, messages: Vec<Message>) -> bool {
        let _delivering = self.delivering.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return false;
        }
        let _callback = CallbackScope::enter(self);
        (self.on_update)(messages);
        true
    }

    fn fail(&self, error: ChatError) {
        let _delivering = self.delivering.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _callback = CallbackScope::enter(self);
        (self.on_error)(error);
    }

    fn callback_thread(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        self.callback_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when called from inside one of this listener's callbacks.
    fn in_callback(&self) -> bool {
        *self.callback_thread() == Some(thread::current().id())
    }

    /// Returns `false` if the listener was already stopped.
    fn stop(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.wake.notify_one();
        true
    }

    /// Blocks until an in-flight callback returns. A no-op from inside a
    /// callback, which would otherwise wait on itself.
    fn wait_idle(&self) {
        if self.in_callback() {
            return;
        }
        drop(self.delivering.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct CallbackScope<'a>(&'a Listener);

impl<'a> CallbackScope<'a> {
    fn enter(listener: &'a Listener) -> Self {
        *listener.callback_thread() = Some(thread::current().id());
        Self(listener)
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        *self.0.callback_thread() = None;
    }
}

/// Handle to a live conversation listener. Dropping it stops the listener.
#[must_use = "dropping a Subscription cancels it immediately"]
pub struct Subscription {
    conversation_id: ConversationId,
    listener: Arc<Listener>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Detaches the listener. Once this returns no callback of this
    /// subscription is running or will run, except the one this is called
    /// from, if any. Idempotent.
    pub fn cancel(&self) {
        if self.listener.stop() {
            debug!("Subscription to {} cancelled", self.conversation_id);
        }
        self.listener.wait_idle();
    }

    pub fn is_cancelled(&self) -> bool {
        self.listener.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // No waiting here: the last handle may be dropped from inside a callback
        if self.listener.stop() {
            debug!("Subscription to {} dropped", self.conversation_id);
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Live per-conversation listeners over the store's change feed.
pub struct SubscriptionManager {
    connection: Arc<ConnectionManager>,
    active: Arc<AtomicUsize>,
}

impl SubscriptionManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of listener tasks still running.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(
        &self,
        conversation_id: ConversationId,
        on_update: F,
    ) -> Result<Subscription, ChatError>
    where
        F: Fn(Vec<Message>) + Send + Sync + 'static,
    {
        let id = conversation_id.clone();
        self.subscribe_with_errors(conversation_id, on_update, move |e| {
            warn!("Subscription to {} ended: {}", id, e);
        })
    }

    /// Delivers the full ordered message list of the conversation now and
    /// after every change, until cancelled or the connection drops.
    ///
    /// Returns immediately; the first snapshot arrives asynchronously.
    /// Snapshots may repeat.
    pub fn subscribe_with_errors<F, E>(
        &self,
        conversation_id: ConversationId,
        on_update: F,
        on_error: E,
    ) -> Result<Subscription, ChatError>
    where
        F: Fn(Vec<Message>) + Send + Sync + 'static,
        E: Fn(ChatError) + Send + Sync + 'static,
    {
        if !self.connection.is_connected() {
            return Err(ChatError::Subscription(
                "chat connection is not established".to_string(),
            ));
        }

        let listener = Arc::new(Listener {
            cancelled: AtomicBool::new(false),
            delivering: Mutex::new(()),
            callback_thread: Mutex::new(None),
            wake: Notify::new(),
            on_update: Box::new(on_update),
            on_error: Box::new(on_error),
        });

        // Feed first, snapshot second: a change landing in between is re-read, not lost
        let changes = self.connection.store().changes();
        let connection_state = self.connection.watch_state();

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        tokio::spawn(run_listener(
            self.connection.store().clone(),
            conversation_id.clone(),
            listener.clone(),
            changes,
            connection_state,
            guard,
        ));

        debug!("Subscribed to {}", conversation_id);
        Ok(Subscription {
            conversation_id,
            listener,
        })
    }
}

async fn run_listener(
    store: Arc<dyn ChatStore>,
    conversation_id: ConversationId,
    listener: Arc<Listener>,
    mut changes: broadcast::Receiver<ChangeEvent>,
    mut connection_state: watch::Receiver<bool>,
    _guard: ActiveGuard,
) {
    if !deliver_snapshot(&*store, &conversation_id, &listener).await {
        return;
    }

    loop {
        tokio::select! {
            _ = listener.wake.notified() => break,
            changed = connection_state.changed() => {
                if changed.is_err() || !*connection_state.borrow() {
                    listener.fail(ChatError::Subscription("chat connection closed".to_string()));
                    break;
                }
            }
            event = changes.recv() => match event {
                Ok(ChangeEvent::Conversation(changed)) if changed == conversation_id => {
                    if !deliver_snapshot(&*store, &conversation_id, &listener).await {
                        break;
                    }
                }
                Ok(ChangeEvent::Conversation(_)) => {}
                Ok(ChangeEvent::Resync) => {
                    debug!("Change feed resumed, resyncing {}", conversation_id);
                    if !deliver_snapshot(&*store, &conversation_id, &listener).await {
                        break;
                    }
                }
                Ok(ChangeEvent::Interrupted(reason)) => {
                    listener.fail(ChatError::Subscription(format!("change feed interrupted: {}", reason)));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Listener on {} lagged by {} events, resyncing", conversation_id, skipped);
                    if !deliver_snapshot(&*store, &conversation_id, &listener).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    listener.fail(ChatError::Subscription("change feed closed".to_string()));
                    break;
                }
            }
        }
    }

    debug!("Listener on {} stopped", conversation_id);
}

/// Returns `false` when the listener should stop.
async fn deliver_snapshot(
    store: &dyn ChatStore,
    conversation_id: &ConversationId,
    listener: &Listener,
) -> bool {
    if listener.is_cancelled() {
        return false;
    }

    match store.messages(conversation_id).await {
        Ok(messages) => listener.deliver(messages),
        Err(e) => {
            listener.fail(ChatError::Subscription(format!(
                "reading {} failed: {}",
                conversation_id.path().messages(),
                e
            )));
            false
        }
    }
}
