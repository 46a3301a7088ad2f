use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::services::chat::ChatServices;
use crate::services::subscription::Subscription;
use crate::{ChatError, ConversationId, Message, SenderRole};

/// Why a conversation view gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatFailure {
    /// Either participant's chat identity could not be resolved.
    CannotStartChat(String),
    /// The live listener could not be (re-)established.
    ConnectionLost(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    Idle,
    Loading,
    Live,
    Sending,
    Closed,
    Failed(ChatFailure),
}

pub type MessagesCallback = Arc<dyn Fn(&[Message]) + Send + Sync>;

#[derive(Debug, Clone)]
struct Participants {
    conversation_id: ConversationId,
    self_chat_id: String,
    other_chat_id: String,
    self_name: String,
    self_role: SenderRole,
}

struct ControllerInner {
    state: ControllerState,
    participants: Option<Participants>,
    messages: Vec<Message>,
    input: String,
    last_error: Option<ChatError>,
    subscription: Option<Subscription>,
    listeners: Vec<MessagesCallback>,
    resubscribed: bool,
    delivered: bool,
}

/// Drives one open conversation view.
///
/// The subscription is the only writer of the message list: sends never
/// insert locally, they show up with the next snapshot.
#[derive(Clone)]
pub struct ConversationController {
    services: Arc<ChatServices>,
    inner: Arc<Mutex<ControllerInner>>,
}

struct WeakController {
    services: Arc<ChatServices>,
    inner: Weak<Mutex<ControllerInner>>,
}

impl WeakController {
    fn upgrade(&self) -> Option<ConversationController> {
        Some(ConversationController {
            services: self.services.clone(),
            inner: self.inner.upgrade()?,
        })
    }
}

impl ConversationController {
    pub fn new(services: Arc<ChatServices>) -> Self {
        Self {
            services,
            inner: Arc::new(Mutex::new(ControllerInner {
                state: ControllerState::Idle,
                participants: None,
                messages: Vec::new(),
                input: String::new(),
                last_error: None,
                subscription: None,
                listeners: Vec::new(),
                resubscribed: false,
                delivered: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> WeakController {
        WeakController {
            services: self.services.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.lock().state.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn input(&self) -> String {
        self.lock().input.clone()
    }

    pub fn set_input(&self, text: &str) {
        self.lock().input = text.to_string();
    }

    pub fn last_error(&self) -> Option<ChatError> {
        self.lock().last_error.clone()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.lock()
            .participants
            .as_ref()
            .map(|p| p.conversation_id.clone())
    }

    /// Resolves both participants and starts listening. Returns once the
    /// subscription exists; the state turns `Live` with the first snapshot.
    pub async fn open_conversation(
        &self,
        self_id: &str,
        other_id: &str,
        self_name: &str,
        self_role: SenderRole,
    ) -> Result<(), ChatError> {
        {
            let mut inner = self.lock();
            if inner.state != ControllerState::Idle {
                return Err(ChatError::InvalidState(format!(
                    "conversation already opened ({:?})",
                    inner.state
                )));
            }
            inner.state = ControllerState::Loading;
        }

        let (self_chat_id, other_chat_id) =
            match self.services.identity.resolve_pair(self_id, other_id).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Cannot start chat between {} and {}: {}", self_id, other_id, e);
                    self.fail_while_loading(ChatFailure::CannotStartChat(e.to_string()));
                    return Err(e);
                }
            };
        let conversation_id = ConversationId::for_pair(&self_chat_id, &other_chat_id);

        let mut inner = self.lock();
        if inner.state != ControllerState::Loading {
            debug!("Conversation {} closed before it was live", conversation_id);
            return Ok(());
        }

        inner.participants = Some(Participants {
            conversation_id: conversation_id.clone(),
            self_chat_id,
            other_chat_id,
            self_name: self_name.to_string(),
            self_role,
        });

        match self.start_subscription(conversation_id.clone()) {
            Ok(subscription) => {
                inner.subscription = Some(subscription);
                info!("Opened conversation {}", conversation_id);
                Ok(())
            }
            Err(e) => {
                inner.state = ControllerState::Failed(ChatFailure::ConnectionLost(e.to_string()));
                Err(e)
            }
        }
    }

    /// Registers a UI callback for every snapshot; called at once with the
    /// current list if one was delivered already.
    pub fn on_messages_changed<F>(&self, callback: F)
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        let callback: MessagesCallback = Arc::new(callback);
        let current = {
            let mut inner = self.lock();
            inner.listeners.push(callback.clone());
            inner.delivered.then(|| inner.messages.clone())
        };
        if let Some(messages) = current {
            callback(&messages);
        }
    }

    /// Sends the current input. The input is cleared before the write and
    /// restored if it fails.
    pub async fn send_text(&self) -> Result<String, ChatError> {
        let (text, participants) = {
            let mut inner = self.lock();
            if inner.state != ControllerState::Live {
                return Err(ChatError::InvalidState(format!(
                    "cannot send while {:?}",
                    inner.state
                )));
            }
            let Some(participants) = inner.participants.clone() else {
                return Err(ChatError::InvalidState("no participants".to_string()));
            };
            if inner.input.trim().is_empty() {
                return Err(ChatError::Validation("nothing to send".to_string()));
            }
            inner.state = ControllerState::Sending;
            (std::mem::take(&mut inner.input), participants)
        };

        let adapter = &self.services.adapter;
        let p = &participants;
        let content = text.as_str();
        let result = self
            .services
            .retry
            .run("send_message", move || {
                adapter.send_message(
                    &p.conversation_id,
                    &p.self_chat_id,
                    &p.other_chat_id,
                    content,
                    &p.self_name,
                    p.self_role,
                )
            })
            .await;

        let mut inner = self.lock();
        if inner.state == ControllerState::Sending {
            inner.state = ControllerState::Live;
        }

        match result {
            Ok(message_id) => {
                inner.last_error = None;
                Ok(message_id)
            }
            Err(e) => {
                warn!("Send in {} failed: {}", participants.conversation_id, e);
                let typed_meanwhile = std::mem::take(&mut inner.input);
                inner.input = text + &typed_meanwhile;
                inner.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    pub async fn send_text_with(&self, text: &str) -> Result<String, ChatError> {
        self.set_input(text);
        self.send_text().await
    }

    /// Stops listening. Only the first call has an effect; returns whether it was this one.
    /// Safe to call from inside a messages callback.
    pub fn close_conversation(&self) -> bool {
        let subscription = {
            let mut inner = self.lock();
            if inner.state == ControllerState::Closed {
                return false;
            }
            inner.state = ControllerState::Closed;
            inner.listeners.clear();
            inner.subscription.take()
        };

        if let Some(subscription) = subscription {
            subscription.cancel();
            info!("Closed conversation {}", subscription.conversation_id());
        }
        true
    }

    fn fail_while_loading(&self, failure: ChatFailure) {
        let mut inner = self.lock();
        if inner.state == ControllerState::Loading {
            inner.state = ControllerState::Failed(failure);
        }
    }

    fn start_subscription(&self, conversation_id: ConversationId) -> Result<Subscription, ChatError> {
        let on_update = {
            let weak = self.downgrade();
            move |messages: Vec<Message>| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_update(messages);
                }
            }
        };
        let on_error = {
            let weak = self.downgrade();
            move |error: ChatError| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_subscription_error(error);
                }
            }
        };

        self.services
            .subscriptions
            .subscribe_with_errors(conversation_id, on_update, on_error)
    }

    fn handle_update(&self, messages: Vec<Message>) {
        let (listeners, snapshot, mark_read) = {
            let mut inner = self.lock();
            if !matches!(
                inner.state,
                ControllerState::Loading | ControllerState::Live | ControllerState::Sending
            ) {
                return;
            }
            let Some(participants) = inner.participants.clone() else {
                return;
            };

            if inner.state == ControllerState::Loading {
                inner.state = ControllerState::Live;
                debug!("Conversation {} is live", participants.conversation_id);
            }

            let first_delivery = !inner.delivered;
            inner.delivered = true;
            let has_unread = messages
                .iter()
                .any(|m| m.is_unread_for(&participants.self_chat_id));

            inner.messages = messages.clone();
            (
                inner.listeners.clone(),
                messages,
                (first_delivery || has_unread).then_some(participants),
            )
        };

        for listener in &listeners {
            listener(&snapshot);
        }

        if let Some(participants) = mark_read {
            self.spawn_mark_read(participants);
        }
    }

    fn spawn_mark_read(&self, participants: Participants) {
        let services = self.services.clone();
        tokio::spawn(async move {
            if let Err(e) = services
                .adapter
                .mark_read(
                    &participants.conversation_id,
                    &participants.self_chat_id,
                    &participants.other_chat_id,
                )
                .await
            {
                warn!(
                    "Failed to mark {} read for {}: {}",
                    participants.conversation_id, participants.self_chat_id, e
                );
            }
        });
    }

    fn handle_subscription_error(&self, error: ChatError) {
        let stale = {
            let mut inner = self.lock();
            if matches!(inner.state, ControllerState::Closed | ControllerState::Failed(_)) {
                return;
            }
            let Some(conversation_id) = inner
                .participants
                .as_ref()
                .map(|p| p.conversation_id.clone())
            else {
                return;
            };
            let stale = inner.subscription.take();

            if inner.resubscribed {
                warn!("Connection to {} lost again: {}", conversation_id, error);
                inner.state = ControllerState::Failed(ChatFailure::ConnectionLost(error.to_string()));
                return;
            }

            inner.resubscribed = true;
            warn!("Listener on {} failed ({}), re-subscribing", conversation_id, error);
            match self.start_subscription(conversation_id) {
                Ok(subscription) => inner.subscription = Some(subscription),
                Err(e) => {
                    inner.state = ControllerState::Failed(ChatFailure::ConnectionLost(e.to_string()));
                }
            }
            stale
        };
        drop(stale);
    }
}
