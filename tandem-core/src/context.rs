//! Process-wide collaborators, built once at startup and handed to the session.

use std::sync::Arc;

use crate::account::AccountProvider;
use crate::config::SessionConfig;
use crate::main_queue::MainQueue;
use crate::observer::{NoopObserver, SessionObserver};
use crate::servers::ServerDirectory;
use crate::sink::ErrorSink;

#[derive(Clone)]
pub struct Context {
    pub config: SessionConfig,
    pub servers: Arc<ServerDirectory>,
    pub account: Arc<dyn AccountProvider>,
    pub errors: Arc<dyn ErrorSink>,
    pub main_queue: MainQueue,
    pub observer: Arc<dyn SessionObserver>,
}

impl Context {
    pub fn new(
        config: SessionConfig,
        servers: Arc<ServerDirectory>,
        account: Arc<dyn AccountProvider>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            config,
            servers,
            account,
            errors,
            main_queue: MainQueue::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }
}
