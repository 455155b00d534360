//! Node assembly: an explicit context of modules, started in order, and a
//! router that hands delivered broadcasts to the module they are for.
//!
//! ```text
//!  P2PModule ──DeliveredMessage──▶ crossbeam channel ──▶ EventRouter thread
//!                                                        ├─ Consensus ─▶ consensus module
//!                                                        ├─ Utility   ─▶ utility module
//!                                                        └─ Debug     ─▶ log
//! ```

use {
    crate::{
        config::RainTreeConfig,
        envelope::{DeliveredMessage, Topic},
        error::{RainTreeError, Result},
        module::{Module, P2PModule},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError},
    log::{debug, error, info, warn},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, PoisonError,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

/// How often the router wakes up to check the exit flag.
const ROUTER_POLL_INTERVAL_MS: u64 = 50;

/// Everything a node is built from. Passed in, never looked up globally.
pub struct NodeContext {
    /// Storage; started first so the others can rely on it.
    pub persistence: Arc<dyn Module>,
    /// RainTree broadcast.
    pub network: Arc<P2PModule>,
    /// Receives `Topic::Utility` deliveries.
    pub utility: Arc<dyn Module>,
    /// Receives `Topic::Consensus` deliveries.
    pub consensus: Arc<dyn Module>,
}

impl NodeContext {
    /// Modules in start order.
    fn modules(&self) -> [Arc<dyn Module>; 4] {
        [
            Arc::clone(&self.persistence),
            Arc::clone(&self.network) as Arc<dyn Module>,
            Arc::clone(&self.utility),
            Arc::clone(&self.consensus),
        ]
    }
}

/// Routes delivered broadcasts to modules on a dedicated thread.
pub struct EventRouter {
    thread: JoinHandle<()>,
}

impl EventRouter {
    /// Spawn the router thread. It exits when `exit` is set or the
    /// delivery channel closes.
    pub fn new(
        receiver: Receiver<DeliveredMessage>,
        consensus: Arc<dyn Module>,
        utility: Arc<dyn Module>,
        exit: Arc<AtomicBool>,
    ) -> Result<Self> {
        let thread = Builder::new()
            .name("raintreeRouter".to_string())
            .spawn(move || Self::run(&receiver, consensus.as_ref(), utility.as_ref(), &exit))?;
        Ok(Self { thread })
    }

    /// Wait for the router thread to exit.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }

    fn run(
        receiver: &Receiver<DeliveredMessage>,
        consensus: &dyn Module,
        utility: &dyn Module,
        exit: &AtomicBool,
    ) {
        loop {
            if exit.load(Ordering::Relaxed) {
                info!("EventRouter: exit signal received, shutting down");
                break;
            }
            let message =
                match receiver.recv_timeout(Duration::from_millis(ROUTER_POLL_INTERVAL_MS)) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("EventRouter: delivery channel closed, shutting down");
                        break;
                    }
                };
            Self::route(message, consensus, utility);
        }
    }

    fn route(message: DeliveredMessage, consensus: &dyn Module, utility: &dyn Module) {
        let origin = message.origin.clone();
        let result = match message.topic {
            Topic::Consensus => consensus.handle_message(message),
            Topic::Utility => utility.handle_message(message),
            Topic::Debug => {
                info!(
                    "debug message from {} nonce={} ({} bytes)",
                    message.origin,
                    message.nonce,
                    message.payload.len()
                );
                Ok(())
            }
            Topic::Other(tag) => {
                warn!("no module handles topic {} (from {})", tag, message.origin);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("error handling message from {}: {}", origin, e);
        }
    }
}

/// A running validator node.
pub struct Node {
    context: NodeContext,
    delivered: Receiver<DeliveredMessage>,
    exit: Arc<AtomicBool>,
    router: Mutex<Option<EventRouter>>,
}

impl Node {
    /// Node over an assembled context; `delivered` is the receiving end of
    /// the channel the network engine delivers into.
    pub fn new(context: NodeContext, delivered: Receiver<DeliveredMessage>) -> Self {
        Self {
            context,
            delivered,
            exit: Arc::new(AtomicBool::new(false)),
            router: Mutex::new(None),
        }
    }

    /// Build a TCP backed node from configuration and the external modules.
    pub async fn create(
        config: &RainTreeConfig,
        persistence: Arc<dyn Module>,
        utility: Arc<dyn Module>,
        consensus: Arc<dyn Module>,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let network = Arc::new(P2PModule::bind(config, sender).await?);
        Ok(Self::new(
            NodeContext {
                persistence,
                network,
                utility,
                consensus,
            },
            receiver,
        ))
    }

    /// The networking module, for originating broadcasts.
    pub fn network(&self) -> &Arc<P2PModule> {
        &self.context.network
    }

    /// Start persistence, network, utility, then consensus, then the router.
    ///
    /// If a module fails, the ones already started are stopped in reverse
    /// order and the failure is returned.
    pub async fn start(&self) -> Result<()> {
        info!("starting node {}", self.context.network.engine().identity());
        let modules = self.context.modules();
        for (started, module) in modules.iter().enumerate() {
            debug!("starting {} module", module.name());
            if let Err(e) = module.start().await {
                error!("{} module failed to start: {}", module.name(), e);
                for running in modules.iter().take(started).rev() {
                    if let Err(stop_err) = running.stop().await {
                        warn!("error stopping {} module: {}", running.name(), stop_err);
                    }
                }
                return Err(RainTreeError::ModuleStart {
                    module: module.name(),
                    reason: e.to_string(),
                });
            }
        }

        self.exit.store(false, Ordering::Relaxed);
        let router = EventRouter::new(
            self.delivered.clone(),
            Arc::clone(&self.context.consensus),
            Arc::clone(&self.context.utility),
            Arc::clone(&self.exit),
        )?;
        *self.router.lock().unwrap_or_else(PoisonError::into_inner) = Some(router);
        Ok(())
    }

    /// Stop the router, then every module in reverse start order.
    ///
    /// Every module is asked to stop; the first failure is returned.
    pub async fn stop(&self) -> Result<()> {
        self.exit.store(true, Ordering::Relaxed);
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(router) = router {
            let joined = tokio::task::spawn_blocking(move || router.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("event router did not shut down cleanly");
            }
        }

        let mut first_error = None;
        for module in self.context.modules().iter().rev() {
            if let Err(e) = module.stop().await {
                warn!("error stopping {} module: {}", module.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            address_book::SharedAddressBook,
            codec::BincodeCodec,
            engine::BroadcastEngine,
            test_utils::{book_of, MockNetwork},
        },
        assert_matches::assert_matches,
        async_trait::async_trait,
        crossbeam_channel::Sender,
    };

    /// Records lifecycle events and handled messages into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        handled: Option<Sender<DeliveredMessage>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_start: false,
                handled: None,
            }
        }
    }

    #[async_trait]
    impl Module for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(RainTreeError::EmptyContextValue("database"));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }

        fn handle_message(&self, message: DeliveredMessage) -> Result<()> {
            if let Some(handled) = &self.handled {
                handled.send(message).unwrap();
            }
            Ok(())
        }
    }

    fn network_module() -> (Arc<P2PModule>, Sender<DeliveredMessage>, Receiver<DeliveredMessage>) {
        let book = book_of(2);
        let network = MockNetwork::new(&book);
        let mut config = RainTreeConfig::dev_default();
        config.identity = book.get(0).unwrap().id.to_string();
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = BroadcastEngine::new(
            &config,
            SharedAddressBook::new(book.clone()),
            network.clone(),
            Arc::new(BincodeCodec::new(config.max_message_size)),
            tx.clone(),
        )
        .unwrap();
        let module = P2PModule::new(engine, network.connection(&book.get(0).unwrap().id));
        (Arc::new(module), tx, rx)
    }

    #[tokio::test]
    async fn test_start_order_and_reverse_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (network, _tx, rx) = network_module();
        let node = Node::new(
            NodeContext {
                persistence: Arc::new(Recorder::new("persistence", &log)),
                network,
                utility: Arc::new(Recorder::new("utility", &log)),
                consensus: Arc::new(Recorder::new("consensus", &log)),
            },
            rx,
        );

        node.start().await.unwrap();
        assert!(node.network().is_running());
        node.stop().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            [
                "start persistence",
                "start utility",
                "start consensus",
                "stop consensus",
                "stop utility",
                "stop persistence",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_start_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (network, _tx, rx) = network_module();
        let mut utility = Recorder::new("utility", &log);
        utility.fail_start = true;
        let node = Node::new(
            NodeContext {
                persistence: Arc::new(Recorder::new("persistence", &log)),
                network: Arc::clone(&network),
                utility: Arc::new(utility),
                consensus: Arc::new(Recorder::new("consensus", &log)),
            },
            rx,
        );

        assert_matches!(
            node.start().await,
            Err(RainTreeError::ModuleStart { module: "utility", .. })
        );
        assert!(!network.is_running());
        assert_eq!(
            *log.lock().unwrap(),
            ["start persistence", "stop persistence"]
        );
    }

    #[tokio::test]
    async fn test_router_dispatches_by_topic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (network, tx, rx) = network_module();
        let (consensus_tx, consensus_rx) = crossbeam_channel::unbounded();
        let (utility_tx, utility_rx) = crossbeam_channel::unbounded();
        let mut consensus = Recorder::new("consensus", &log);
        consensus.handled = Some(consensus_tx);
        let mut utility = Recorder::new("utility", &log);
        utility.handled = Some(utility_tx);

        let node = Node::new(
            NodeContext {
                persistence: Arc::new(Recorder::new("persistence", &log)),
                network,
                utility: Arc::new(utility),
                consensus: Arc::new(consensus),
            },
            rx,
        );
        node.start().await.unwrap();

        let message = |topic| DeliveredMessage {
            origin: "val_02".into(),
            nonce: 1,
            topic,
            payload: b"payload".to_vec(),
        };
        tx.send(message(Topic::Debug)).unwrap();
        tx.send(message(Topic::Other(99))).unwrap();
        tx.send(message(Topic::Utility)).unwrap();
        tx.send(message(Topic::Consensus)).unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(consensus_rx.recv_timeout(timeout).unwrap().topic, Topic::Consensus);
        assert_eq!(utility_rx.recv_timeout(timeout).unwrap().topic, Topic::Utility);
        assert!(consensus_rx.try_recv().is_err());

        node.stop().await.unwrap();
    }
}
