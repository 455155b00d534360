//! The networking module: a [`BroadcastEngine`] fed by a listener loop.

use {
    crate::{
        address_book::SharedAddressBook,
        codec::BincodeCodec,
        config::RainTreeConfig,
        engine::BroadcastEngine,
        envelope::{DeliveredMessage, MessageId, Topic},
        error::{RainTreeError, Result},
        transport::{TcpConnector, TransportConnection, TransportListener},
    },
    async_trait::async_trait,
    crossbeam_channel::Sender,
    log::{debug, info, warn},
    std::sync::{Arc, Mutex, PoisonError},
    tokio::task::JoinHandle,
};

/// A node component with an explicit lifecycle.
#[async_trait]
pub trait Module: Send + Sync {
    /// Short name used in logs and start failures.
    fn name(&self) -> &'static str;

    /// Bring the module up. Called once, in node start order.
    async fn start(&self) -> Result<()>;

    /// Release the module's resources. Called in reverse start order.
    async fn stop(&self) -> Result<()>;

    /// Receive a broadcast payload routed to this module.
    fn handle_message(&self, message: DeliveredMessage) -> Result<()> {
        debug!(
            "{} module ignoring {:?} message from {}",
            self.name(),
            message.topic,
            message.origin
        );
        Ok(())
    }
}

/// Networking module exposing RainTree broadcast.
pub struct P2PModule {
    engine: Arc<BroadcastEngine>,
    listener: Arc<dyn TransportConnection>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl P2PModule {
    /// Module feeding every frame read from `listener` to `engine`.
    pub fn new(engine: Arc<BroadcastEngine>, listener: Arc<dyn TransportConnection>) -> Self {
        Self {
            engine,
            listener,
            task: Mutex::new(None),
        }
    }

    /// Wire a TCP backed module from configuration.
    ///
    /// Resolves the address book and binds the listener; both failures are
    /// fatal configuration errors.
    pub async fn bind(
        config: &RainTreeConfig,
        delivered_sender: Sender<DeliveredMessage>,
    ) -> Result<Self> {
        let book = config.build_address_book()?;
        let handle = TransportListener::new(config).start().await?;
        let engine = BroadcastEngine::new(
            config,
            SharedAddressBook::new(book),
            Arc::new(TcpConnector::new(config)),
            Arc::new(BincodeCodec::new(config.max_message_size)),
            delivered_sender,
        )?;
        Ok(Self::new(engine, handle.inbound))
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    /// Originate `payload` on `topic`. See [`BroadcastEngine::broadcast`].
    pub fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> Result<MessageId> {
        self.engine.broadcast(topic, payload)
    }

    /// Whether the listener loop is still reading.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Read frames until the listener closes, handling each on its own task.
    async fn run(engine: Arc<BroadcastEngine>, listener: Arc<dyn TransportConnection>) {
        loop {
            match listener.read().await {
                Ok(frame) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_incoming(&frame) {
                            debug!("{} dropped inbound frame: {}", engine.identity(), e);
                        }
                    });
                }
                Err(RainTreeError::ChannelClosed) => {
                    info!("{} listener closed", engine.identity());
                    break;
                }
                Err(e) => {
                    warn!("{} listener failed: {}", engine.identity(), e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Module for P2PModule {
    fn name(&self) -> &'static str {
        "p2p"
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        info!(
            "starting p2p module for {} ({} peers)",
            self.engine.identity(),
            self.engine.address_book().snapshot().len()
        );
        *task = Some(tokio::spawn(Self::run(
            Arc::clone(&self.engine),
            Arc::clone(&self.listener),
        )));
        Ok(())
    }

    /// Stop reading and close the listener. A TCP listener releases its
    /// port, so a TCP backed module cannot be started again.
    async fn stop(&self) -> Result<()> {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!("stopped p2p module for {}", self.engine.identity());
        }
        self.listener.close();
        Ok(())
    }
}
