//! Integration tests for fleetlink-cluster
//!
//! These run the front-end and worker sides against each other over the
//! in-process transport.
//!
//! Run with: cargo test --test integration_tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use fleetlink_cluster::family::WorkerSpec;
use fleetlink_cluster::packet::{handler_fn, ids, keys, split_list, BusSettings, RoutingTable};
use fleetlink_cluster::{
    ClientConnector, Family, FamilyRegistry, LinkState, MemoryRankStore, MemoryTransport,
    PacketBus, Proxy, ProxyContext, RankStore, Result, Transport, Worker, WorkerNode,
};
use fleetlink_core::config::{
    FamilyConfig, LoadBalancerConfig, MagicConfigEntry, MatchmakerConfig, TeamConfig,
};
use fleetlink_core::models::{FamilyId, PlayerId, WorkerId};
use fleetlink_core::{Config, Scheduler};

/// Accepts every placement and counts them
#[derive(Default)]
struct CountingConnector {
    placed: AtomicUsize,
}

#[async_trait]
impl ClientConnector for CountingConnector {
    async fn connect(&self, _player: &PlayerId, _worker: &Worker) -> Result<()> {
        self.placed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const WORKER_ADDRESS: &str = "10.0.0.1:25565";

fn arena_config() -> FamilyConfig {
    FamilyConfig {
        id: "arena".to_string(),
        load_balancer: LoadBalancerConfig::default(),
        matchmaker: Some(MatchmakerConfig {
            teams: vec![TeamConfig {
                name: "all".to_string(),
                min: 4,
                max: 4,
            }],
            ..MatchmakerConfig::default()
        }),
        residence: None,
    }
}

fn worker_spec(address: &str) -> WorkerSpec {
    WorkerSpec {
        id: WorkerId::new(),
        address: address.to_string(),
        display_name: None,
        family: FamilyId::from("arena"),
        magic_config: "arena".to_string(),
        soft_cap: 8,
        hard_cap: 10,
        weight: 0,
        countdown: 15,
        player_count: 0,
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_full_matchmaking_cycle_places_one_session() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let connector = Arc::new(CountingConnector::default());
    let rank_store = Arc::new(MemoryRankStore::new());
    let ctx = ProxyContext::new(
        Scheduler::new(),
        Arc::new(PacketBus::new(
            transport.clone(),
            BusSettings::frontend("packets", 50),
        )),
        connector.clone(),
        rank_store.clone(),
        Duration::from_secs(5),
    );

    // Worker side listens for the session announcement
    let (ready_tx, mut ready_rx) = mpsc::channel(4);
    let worker_bus = Arc::new(PacketBus::new(
        transport.clone(),
        BusSettings::worker("packets", WORKER_ADDRESS, 50),
    ));
    worker_bus
        .subscribe(RoutingTable::new().route(
            ids::RANKED_GAME_READY,
            handler_fn(move |packet| {
                let tx = ready_tx.clone();
                async move {
                    let _ = tx.send(packet).await;
                    Ok(())
                }
            }),
        ))
        .await
        .unwrap();

    let registry = FamilyRegistry::new();
    let family = Arc::new(Family::new(&arena_config(), ctx.clone()).unwrap());
    assert!(registry.add_family(family.clone()));
    let worker = Arc::new(Worker::new(worker_spec(WORKER_ADDRESS)));
    registry.add_worker(worker.clone()).unwrap();

    let matchmaker = family.matchmaker().unwrap().clone();
    for player in ["alex", "sam", "kim", "jo"] {
        assert!(matchmaker.add(player));
    }
    assert!(!matchmaker.add("alex"));
    assert_eq!(matchmaker.queue_len(), 4);

    assert_eq!(matchmaker.run_cycle().await, 1);

    assert_eq!(matchmaker.queue_len(), 0);
    assert_eq!(matchmaker.waiting_session_count(), 0);
    assert_eq!(matchmaker.running_session_count(), 1);
    assert!(worker.is_locked());
    assert_eq!(family.load_balancer().size(false), 0);
    assert_eq!(family.load_balancer().size(true), 1);
    assert_eq!(worker.player_count(), 4);
    assert_eq!(connector.placed.load(Ordering::SeqCst), 4);

    let announcement = tokio::time::timeout(Duration::from_secs(2), ready_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let session = matchmaker.running_session_ids().pop().unwrap();
    assert_eq!(
        announcement.text(keys::SESSION).unwrap(),
        session.as_str()
    );
    assert_eq!(split_list(&announcement.text(keys::PLAYERS).unwrap()).len(), 4);

    matchmaker
        .end_session(
            &session,
            &[PlayerId::from("alex"), PlayerId::from("sam")],
            &[PlayerId::from("kim"), PlayerId::from("jo")],
        )
        .unwrap();
    assert_eq!(matchmaker.running_session_count(), 0);
    assert!(!worker.is_locked());
    assert_eq!(rank_store.record(&PlayerId::from("alex")).wins, 1);
    assert_eq!(rank_store.record(&PlayerId::from("jo")).losses, 1);

    worker_bus.shutdown();
}

#[tokio::test]
async fn test_evicting_a_pinned_worker_ends_its_session() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let ctx = ProxyContext::new(
        Scheduler::new(),
        Arc::new(PacketBus::new(transport, BusSettings::frontend("packets", 50))),
        Arc::new(CountingConnector::default()),
        Arc::new(MemoryRankStore::new()),
        Duration::from_secs(5),
    );

    let registry = FamilyRegistry::new();
    let family = Arc::new(Family::new(&arena_config(), ctx).unwrap());
    registry.add_family(family.clone());
    let worker = Arc::new(Worker::new(worker_spec(WORKER_ADDRESS)));
    registry.add_worker(worker.clone()).unwrap();

    let matchmaker = family.matchmaker().unwrap().clone();
    for player in ["a", "b", "c", "d"] {
        matchmaker.add(player);
    }
    assert_eq!(matchmaker.run_cycle().await, 1);

    registry.remove_worker(worker.id()).unwrap();
    assert_eq!(matchmaker.running_session_count(), 0);
    assert_eq!(family.load_balancer().size(true), 0);
}

fn link_config(secret: Option<&str>) -> Config {
    let mut config = Config::default();
    config.redis.channel = "packets".to_string();
    config.families = vec![FamilyConfig {
        id: "lobby".to_string(),
        load_balancer: LoadBalancerConfig::default(),
        matchmaker: None,
        residence: None,
    }];

    let mut magic_configs = HashMap::new();
    magic_configs.insert(
        "default".to_string(),
        MagicConfigEntry {
            family: "lobby".to_string(),
            soft_cap: 20,
            hard_cap: 30,
            weight: 0,
        },
    );
    config.magic_link.magic_configs = magic_configs;
    config.magic_link.secret = Some("hunter2".to_string());
    config.magic_link.heartbeat_interval_seconds = 7;

    config.worker.address = WORKER_ADDRESS.to_string();
    config.worker.magic_config = "default".to_string();
    config.worker.secret = secret.map(ToString::to_string);
    config
}

#[tokio::test]
async fn test_worker_registers_and_disconnects() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let config = link_config(Some("hunter2"));

    let proxy = Proxy::start(&config, transport.clone(), Arc::new(CountingConnector::default()))
        .await
        .unwrap();
    let mut events = proxy.magic_link().subscribe_events();

    let node = WorkerNode::start(&config, transport).await.unwrap();
    let client = node.client().clone();

    assert!(eventually(|| client.state() == LinkState::Linked).await);
    let assignment = client.assignment().unwrap();
    assert_eq!(assignment.family.as_str(), "lobby");
    assert_eq!(assignment.hard_cap, 30);
    assert_eq!(client.ping_interval(), Duration::from_secs(7));

    let registered = proxy.registry().worker_by_address(WORKER_ADDRESS).unwrap();
    assert_eq!(registered.id(), assignment.worker_id);
    assert!(matches!(
        events.recv().await.unwrap(),
        fleetlink_cluster::FleetEvent::Registered { .. }
    ));

    client.shutdown().await;
    let registry = proxy.registry().clone();
    assert!(eventually(|| registry.worker_by_address(WORKER_ADDRESS).is_none()).await);
    assert!(proxy.family("lobby").unwrap().workers().is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_wrong_secret_is_refused() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let config = link_config(Some("guess"));

    let proxy = Proxy::start(&config, transport.clone(), Arc::new(CountingConnector::default()))
        .await
        .unwrap();
    let node = WorkerNode::start(&config, transport).await.unwrap();
    let mut worker_events = node.client().subscribe_events();

    let event = tokio::time::timeout(Duration::from_secs(2), worker_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        fleetlink_cluster::WorkerEvent::Rejected { .. }
    ));
    assert_eq!(node.client().state(), LinkState::Searching);
    assert_eq!(proxy.registry().worker_count(), 0);

    node.client().shutdown().await;
    proxy.shutdown().await;
}
