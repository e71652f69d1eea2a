//! Fan-out of notifications to many independent handlers.
//!
//! Transports accept a single handler; a [`NotificationRouter`] installed as
//! that handler lets several consumers observe the same stream.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::transport::{Notification, NotificationHandler};

#[derive(Default)]
pub struct NotificationRouter {
    global: RwLock<Vec<NotificationHandler>>,
    by_method: RwLock<HashMap<String, Vec<NotificationHandler>>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler run for every notification.
    pub fn on_notification(&self, handler: NotificationHandler) {
        self.global.write().push(handler);
    }

    /// Handler run for notifications whose method is exactly `method`.
    pub fn on_method(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.by_method
            .write()
            .entry(method.into())
            .or_default()
            .push(handler);
    }

    /// Remove every global handler.
    pub fn clear_global(&self) {
        self.global.write().clear();
    }

    /// Remove every handler for `method`.
    pub fn clear_method(&self, method: &str) {
        self.by_method.write().remove(method);
    }

    /// Run global handlers, then the method's handlers, in registration order.
    ///
    /// Handlers run on the caller's task against a snapshot of the lists, so
    /// they may register further handlers. A panicking handler unwinds into
    /// the caller.
    pub fn route(&self, notification: &Notification) {
        let global: Vec<NotificationHandler> = self.global.read().clone();
        let specific: Vec<NotificationHandler> = self
            .by_method
            .read()
            .get(&notification.method)
            .cloned()
            .unwrap_or_default();

        for handler in global.iter().chain(specific.iter()) {
            handler(notification);
        }
    }

    /// Adapt the router to the single-handler subscription contract.
    pub fn into_handler(self: Arc<Self>) -> NotificationHandler {
        Arc::new(move |notification| self.route(notification))
    }

    pub fn handler_count(&self) -> usize {
        self.global.read().len() + self.by_method.read().values().map(Vec::len).sum::<usize>()
    }
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("global", &self.global.read().len())
            .field("methods", &self.by_method.read().len())
            .finish()
    }
}
