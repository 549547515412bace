//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
//! Explicit owner of everything one process needs to take part in shared
//! object replication: key material, client, manager, listener and dumper.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use prometheus::Registry;
use tracing::{info, warn};
use xmq_common::config::{AuthConfig, BrokerConfig, MqConfig};
use xmq_common::logging::init_tracing;
use xmq_msg::{BrokerOptions, Connector, MessageClient, MessagingMetricsExporter};
use xmq_security::Keyring;

use crate::dumper::FileDumper;
use crate::listener::MessagingListener;
use crate::manager::SharedObjectManager;

/// Configured messaging stack with a defined start and shutdown.
pub struct MessagingRealm {
    config: MqConfig,
    keyring: Arc<Keyring>,
    registry: Registry,
    client: Arc<MessageClient>,
    manager: Arc<SharedObjectManager>,
    listener: MessagingListener,
    dumper: Mutex<Option<FileDumper>>,
}

impl MessagingRealm {
    /// Load key material, connect the configured brokers and subscribe.
    ///
    /// Missing or unreadable key material is fatal when the configuration
    /// asks for signing, encryption or `auth.require`; otherwise the realm
    /// runs in plain mode. A broker asking for signing or encryption the key
    /// file cannot provide is fatal too. Unreachable brokers are logged and
    /// skipped.
    ///
    /// No tracing subscriber is installed here; see [`Self::init_logging`].
    pub fn build(config: MqConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let keyring = Arc::new(load_keyring(&config.auth, config.wants_auth())?);
        check_key_material(&config.brokers, &keyring)?;
        let registry = Registry::new();
        let exporter = MessagingMetricsExporter::register(&registry)
            .context("failed to register messaging metrics")?;

        let client = MessageClient::new(config.client_id.as_deref(), keyring.clone(), connector)
            .with_recv_timeout(config.listener.poll_interval)
            .with_metrics(exporter);
        client.set_default_receiver_queue(&config.default_receiver_queue);
        let mut connected = 0;
        for broker in &config.brokers {
            if client.add_broker(&broker.url, BrokerOptions::from(broker)) {
                connected += 1;
            } else {
                warn!(broker = %broker.url, "broker not added");
            }
        }
        if connected > 0 {
            if let Err(err) = client.subscribe() {
                warn!(error = %err, "subscription failed");
            }
        } else {
            warn!(client = %client.client_id(), "no broker reachable, running detached");
        }

        let client = Arc::new(client);
        let manager = Arc::new(SharedObjectManager::with_config(
            client.clone(),
            &config.shared,
        ));
        let listener = MessagingListener::new(manager.clone(), config.listener.clone());
        info!(
            client = %client.client_id(),
            brokers = connected,
            signing = keyring.can_sign(),
            encryption = keyring.can_encrypt(),
            "messaging realm ready"
        );
        Ok(Self {
            config,
            keyring,
            registry,
            client,
            manager,
            listener,
            dumper: Mutex::new(None),
        })
    }

    /// Install the process-wide tracing subscriber from the `[logging]`
    /// section. Embedding processes that own their subscriber skip this.
    pub fn init_logging(&self, service_name: &str) -> Result<()> {
        init_tracing(service_name, &self.config.logging)
    }

    /// Start the listener and, when a dump path is configured, the dumper.
    pub fn start(&self) -> Result<()> {
        if !self.listener.start_listener_thread() && !self.listener.is_running() {
            bail!("listener thread could not be started");
        }
        let mut dumper = self.dumper.lock();
        if let (Some(path), None) = (&self.config.dumper.path, dumper.as_ref()) {
            let spawned = FileDumper::spawn(
                self.manager.clone(),
                path.clone(),
                self.config.dumper.interval,
            )
            .with_context(|| format!("failed to start dumper for {}", path.display()))?;
            *dumper = Some(spawned);
        }
        Ok(())
    }

    /// Stop background threads, drop every shared object and detach from the
    /// brokers. Safe to call more than once.
    pub fn shutdown(&self) {
        self.listener.stop();
        if let Some(mut dumper) = self.dumper.lock().take() {
            dumper.stop();
        }
        self.manager.clear();
        self.client.disconnect();
        info!(client = %self.client.client_id(), "messaging realm shut down");
    }

    /// The message client.
    pub fn client(&self) -> &Arc<MessageClient> {
        &self.client
    }

    /// The shared object manager.
    pub fn manager(&self) -> &Arc<SharedObjectManager> {
        &self.manager
    }

    /// Loaded key material.
    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Metrics registry holding the messaging counters.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether the listener thread runs.
    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }
}

impl Drop for MessagingRealm {
    fn drop(&mut self) {
        self.listener.stop();
    }
}

fn load_keyring(auth: &AuthConfig, required: bool) -> Result<Keyring> {
    match &auth.key_file {
        Some(path) => match Keyring::configure(path) {
            Ok(keyring) => {
                info!(path = %path.display(), fingerprint = keyring.fingerprint().as_deref().unwrap_or("none"), "key material loaded");
                Ok(keyring)
            }
            Err(err) if required => Err(err)
                .with_context(|| format!("failed to load key file {}", path.display())),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "key file unusable, running in plain mode");
                Ok(Keyring::plain())
            }
        },
        None if required => bail!("authenticated messaging requires auth.key_file"),
        None => Ok(Keyring::plain()),
    }
}

fn check_key_material(brokers: &[BrokerConfig], keyring: &Keyring) -> Result<()> {
    for broker in brokers {
        if broker.sign && !keyring.can_sign() {
            bail!("broker {} requires signing but no signing key is configured", broker.url);
        }
        if broker.encrypt && !keyring.can_encrypt() {
            bail!(
                "broker {} requires encryption but no shared secret is configured",
                broker.url
            );
        }
    }
    Ok(())
}
