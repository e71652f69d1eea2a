//! Single-handler notification slot shared by the push-capable transports.

use parking_lot::RwLock;

use crate::{
    error::{TransportError, TransportResult},
    transport::{Notification, NotificationHandler},
};

/// Holds at most one active notification handler.
#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<NotificationHandler>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler`, keeping any existing one in place on conflict.
    pub fn set(&self, handler: NotificationHandler) -> TransportResult<()> {
        let mut slot = self.handler.write();
        if slot.is_some() {
            return Err(TransportError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn clear(&self) {
        self.handler.write().take();
    }

    pub fn is_set(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Run the handler, if any. Returns whether one ran.
    ///
    /// The handler is cloned out of the lock so it may call back into the
    /// transport.
    pub fn dispatch(&self, notification: &Notification) -> bool {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("set", &self.is_set())
            .finish()
    }
}
