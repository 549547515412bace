//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use xmq_common::config::ListenerConfig;
use xmq_common::CancellationToken;
use xmq_msg::{AdvisoryMessage, Message};

use crate::manager::SharedObjectManager;

const JOIN_POLL: Duration = Duration::from_millis(10);

struct Running {
    token: CancellationToken,
    thread: JoinHandle<u64>,
}

/// Background thread feeding received messages into a [`SharedObjectManager`].
pub struct MessagingListener {
    manager: Arc<SharedObjectManager>,
    config: ListenerConfig,
    running: Mutex<Option<Running>>,
}

impl MessagingListener {
    /// Listener for `manager`, receiving through the manager's client.
    pub fn new(manager: Arc<SharedObjectManager>, config: ListenerConfig) -> Self {
        Self {
            manager,
            config,
            running: Mutex::new(None),
        }
    }

    /// Spawn the listener thread. Returns false when it already runs or the
    /// thread could not be spawned.
    pub fn start_listener_thread(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("listener already running");
            return false;
        }
        let token = CancellationToken::new();
        let manager = self.manager.clone();
        let idle = self.config.poll_interval;
        let worker_token = token.clone();
        let spawned = thread::Builder::new()
            .name("xmq-listener".into())
            .spawn(move || listen(&manager, &worker_token, idle));
        match spawned {
            Ok(thread) => {
                info!(client = %self.manager.client().client_id(), "listener started");
                *running = Some(Running { token, thread });
                true
            }
            Err(err) => {
                error!(error = %err, "cannot spawn listener thread");
                false
            }
        }
    }

    /// True while the thread runs.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.thread.is_finished())
    }

    /// Cancel the thread and wait up to the configured stop timeout for it to
    /// drain already received messages. Returns false when it was not running.
    pub fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        running.token.cancel();
        let deadline = Instant::now() + self.config.stop_timeout;
        while !running.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if !running.thread.is_finished() {
            warn!(timeout = ?self.config.stop_timeout, "listener did not stop in time, detaching");
            return true;
        }
        match running.thread.join() {
            Ok(handled) => info!(handled, "listener stopped"),
            Err(_) => error!("listener thread panicked"),
        }
        true
    }
}

impl Drop for MessagingListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(manager: &SharedObjectManager, token: &CancellationToken, idle: Duration) -> u64 {
    let client = manager.client().clone();
    let mut handled = 0;
    while !token.is_cancelled() {
        match client.recv_message(Some(token)) {
            Some(message) => {
                dispatch(manager, &message);
                handled += 1;
            }
            None if client.brokers().is_empty() => {
                token.wait_for(idle);
            }
            None => {}
        }
    }
    // already fetched frames are still delivered
    while let Some(message) = client.recv_from_internal_buffer() {
        dispatch(manager, &message);
        handled += 1;
    }
    handled
}

fn dispatch(manager: &SharedObjectManager, message: &Message) {
    if let Some(advisory) = AdvisoryMessage::from_message(message) {
        info!(queue = %advisory.queue, online = advisory.online, "advisory");
        return;
    }
    if let Err(err) = manager.apply(message) {
        warn!(
            message_id = %message.id(),
            sender = %message.header().sender_id,
            description = message.description(),
            error = %err,
            "inbound message not applied"
        );
    }
}
