//! RainTree broadcast over real localhost TCP connections.

use {
    async_trait::async_trait,
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    trv1_raintree::{
        codec::BincodeCodec,
        config::PeerConfig,
        module::{Module, P2PModule},
        node::Node,
        test_utils::validator_id,
        transport::{
            InboundConnection, TcpConnection, TcpConnector, TransportConnection,
            TransportListener,
        },
        AddressBook, BroadcastEngine, DeliveredMessage, Peer, RainTreeConfig, Result,
        SharedAddressBook, Topic,
    },
};

const WAIT: Duration = Duration::from_secs(5);

/// Bind `size` listeners on ephemeral ports, then build one module per
/// listener against the resulting address book.
async fn tcp_network(
    size: usize,
) -> (
    AddressBook,
    Vec<(P2PModule, crossbeam_channel::Receiver<DeliveredMessage>)>,
) {
    let mut config = RainTreeConfig::dev_default();
    let mut handles = Vec::with_capacity(size);
    for n in 1..=size {
        config.identity = validator_id(n).to_string();
        handles.push(TransportListener::new(&config).start().await.unwrap());
    }
    let book = AddressBook::new(
        handles
            .iter()
            .enumerate()
            .map(|(i, h)| Peer::new(validator_id(i + 1), h.local_addr))
            .collect(),
    )
    .unwrap();

    let mut modules = Vec::with_capacity(size);
    for (i, handle) in handles.into_iter().enumerate() {
        config.identity = validator_id(i + 1).to_string();
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = BroadcastEngine::new(
            &config,
            SharedAddressBook::new(book.clone()),
            Arc::new(TcpConnector::new(&config)),
            Arc::new(BincodeCodec::new(config.max_message_size)),
            tx,
        )
        .unwrap();
        let module = P2PModule::new(engine, handle.inbound);
        module.start().await.unwrap();
        modules.push((module, rx));
    }
    (book, modules)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_reaches_every_validator_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_book, modules) = tcp_network(4).await;

    let id = modules[0]
        .0
        .broadcast(Topic::Consensus, b"block".to_vec())
        .unwrap();

    for (module, delivered) in &modules[1..] {
        let message = tokio::task::block_in_place(|| delivered.recv_timeout(WAIT)).unwrap();
        assert_eq!(message.origin, id.origin);
        assert_eq!(message.nonce, id.nonce);
        assert_eq!(message.payload, b"block");
        assert_eq!(module.engine().stats().delivered, 1);
    }

    // Validators 2 and 3 are each written to twice. Let the second copy
    // land and check it is suppressed.
    let deadline = Instant::now() + WAIT;
    while modules[1].0.engine().stats().received < 2 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for (module, delivered) in &modules {
        assert!(delivered.try_recv().is_err());
        module.stop().await.unwrap();
    }
    assert_eq!(modules[0].0.engine().stats().send_failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peer_counts_failure() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = RainTreeConfig::dev_default();
    let live_1 = TransportListener::new(&config).start().await.unwrap();
    let live_3 = TransportListener::new(&config).start().await.unwrap();
    // Nothing listens on a port that was bound and released.
    let dead = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let book = AddressBook::new(vec![
        Peer::new(validator_id(1), live_1.local_addr),
        Peer::new(validator_id(2), dead),
        Peer::new(validator_id(3), live_3.local_addr),
    ])
    .unwrap();

    let start = |n: usize, inbound: Arc<InboundConnection>| {
        let mut config = config.clone();
        config.identity = validator_id(n).to_string();
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = BroadcastEngine::new(
            &config,
            SharedAddressBook::new(book.clone()),
            Arc::new(TcpConnector::new(&config)),
            Arc::new(BincodeCodec::new(config.max_message_size)),
            tx,
        )
        .unwrap();
        (P2PModule::new(engine, inbound), rx)
    };
    let (sender, _) = start(1, live_1.inbound);
    let (receiver, delivered) = start(3, live_3.inbound);
    sender.start().await.unwrap();
    receiver.start().await.unwrap();

    sender.broadcast(Topic::Debug, b"ping".to_vec()).unwrap();
    let message = tokio::task::block_in_place(|| delivered.recv_timeout(WAIT)).unwrap();
    assert_eq!(message.payload, b"ping");

    let deadline = Instant::now() + WAIT;
    while sender.engine().stats().send_failures == 0 {
        assert!(Instant::now() < deadline, "write to a closed port never failed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sender.engine().stats().sent, 1);
    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopped_module_releases_port() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (book, modules) = tcp_network(2).await;
    let addr = book.get(1).unwrap().addr;
    let conn = TcpConnection::connect(addr, 1_048_576, WAIT).await.unwrap();

    modules[1].0.stop().await.unwrap();
    assert!(!modules[1].0.is_running());

    // The accepted connection is dropped rather than left acknowledging
    // frames nobody reads.
    let err = tokio::time::timeout(WAIT, conn.write(b"late"))
        .await
        .expect("write to a stopped module must fail, not hang")
        .unwrap_err();
    assert!(err.is_transport());

    let deadline = Instant::now() + WAIT;
    while TcpConnection::connect(addr, 1_048_576, WAIT).await.is_ok() {
        assert!(Instant::now() < deadline, "stopped module still accepting");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    modules[0].0.stop().await.unwrap();
}

struct Counting {
    name: &'static str,
    handled: Arc<AtomicUsize>,
}

#[async_trait]
impl Module for Counting {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn handle_message(&self, _message: DeliveredMessage) -> Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_from_config() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = RainTreeConfig {
        identity: "val_01".to_string(),
        peers: vec![PeerConfig {
            identity: "val_01".to_string(),
            address: "127.0.0.1:0".to_string(),
        }],
        ..RainTreeConfig::dev_default()
    };
    let handled = Arc::new(AtomicUsize::new(0));
    let module = |name| -> Arc<dyn Module> {
        Arc::new(Counting {
            name,
            handled: Arc::clone(&handled),
        })
    };
    let node = Node::create(
        &config,
        module("persistence"),
        module("utility"),
        module("consensus"),
    )
    .await
    .unwrap();
    node.start().await.unwrap();

    // A single validator has nobody to write to and never delivers its own
    // broadcast.
    node.network()
        .broadcast(Topic::Utility, b"tx".to_vec())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(node.network().engine().stats().originated, 1);
    assert_eq!(node.network().engine().stats().sent, 0);

    node.stop().await.unwrap();
    assert!(!node.network().is_running());
}
