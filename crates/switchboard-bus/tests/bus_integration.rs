use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use switchboard_bus::{
    BusConsumer, Event, EventBus, EventHandler, EventKind, FileStreamTransport,
    InMemoryStreamTransport, StreamTransport,
};
use switchboard_core::{BusConfig, BusRetryPolicy, SwitchboardError, SwitchboardResult, TenantId};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

fn quick_config(max_retries: u32) -> BusConfig {
    BusConfig {
        retry: BusRetryPolicy {
            max_retries,
            base_delay_ms: 1,
            multiplier: 4,
            max_delay_ms: 20,
        },
        block_timeout_ms: 20,
        ..BusConfig::default()
    }
}

fn handoff_event(t: &str) -> Event {
    Event::new(
        tenant(t),
        EventKind::HANDOFF_ACCEPTED,
        "supervisor",
        json!({"task": "send a status email"}),
    )
}

#[tokio::test]
async fn test_publish_then_new_group_receives_exactly_once() {
    let transport = Arc::new(InMemoryStreamTransport::new());
    let bus = EventBus::new(tenant("t1"), transport.clone(), quick_config(3));

    let event = handoff_event("t1");
    bus.publish("handoffs", &event).await.unwrap();

    let batch = bus.subscribe("handoffs", "fresh-group", "c1").await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].event, event);
    assert!(bus
        .acknowledge("handoffs", "fresh-group", batch[0].id)
        .await
        .unwrap());

    assert!(bus
        .subscribe("handoffs", "fresh-group", "c2")
        .await
        .unwrap()
        .is_empty());
    assert!(transport
        .pending("t1:handoffs", "fresh-group")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_tenants_sharing_a_transport_never_see_each_other() {
    let transport: Arc<dyn StreamTransport> = Arc::new(InMemoryStreamTransport::new());
    let a = EventBus::new(tenant("acme"), transport.clone(), quick_config(3));
    let b = EventBus::new(tenant("globex"), transport.clone(), quick_config(3));

    a.publish("handoffs", &handoff_event("acme")).await.unwrap();
    assert!(matches!(
        b.publish("handoffs", &handoff_event("acme")).await,
        Err(SwitchboardError::TenantMismatch { .. })
    ));

    assert!(b.subscribe("handoffs", "g", "c").await.unwrap().is_empty());
    assert_eq!(a.subscribe("handoffs", "g", "c").await.unwrap().len(), 1);
}

struct AlwaysFails(AtomicUsize);

#[async_trait::async_trait]
impl EventHandler for AlwaysFails {
    async fn handle(&self, _event: &Event) -> SwitchboardResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(SwitchboardError::Transport("downstream unavailable".into()))
    }
}

#[tokio::test]
async fn test_message_failing_past_limit_lands_in_dlq_exactly_once() {
    let max_retries = 3;
    let transport = Arc::new(InMemoryStreamTransport::new());
    let bus = Arc::new(EventBus::new(
        tenant("t1"),
        transport.clone(),
        quick_config(max_retries),
    ));
    bus.publish("jobs", &handoff_event("t1")).await.unwrap();

    let handler = Arc::new(AlwaysFails(AtomicUsize::new(0)));
    let consumer = BusConsumer::new(bus.clone(), "jobs", "workers", "c1", handler.clone());
    for _ in 0..(max_retries + 3) {
        consumer.run_once().await.unwrap();
    }

    assert_eq!(handler.0.load(Ordering::SeqCst), (max_retries + 1) as usize);
    let letters = bus.dead_letters("jobs").await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retry_count, max_retries);
    assert!(letters[0].error.contains("downstream unavailable"));
    assert!(transport.pending("t1:jobs", "workers").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unacked_message_survives_restart_and_is_reclaimed() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("streams.jsonl");
    let mut config = quick_config(3);
    config.reclaim_idle_ms = 0;

    let event = handoff_event("t1");
    {
        let transport = Arc::new(FileStreamTransport::open(path.clone()).await.unwrap());
        let bus = EventBus::new(tenant("t1"), transport, config.clone());
        bus.publish("handoffs", &event).await.unwrap();
        let batch = bus.subscribe("handoffs", "g", "crashing").await.unwrap();
        assert_eq!(batch.len(), 1);
        // consumer dies before acknowledging
    }

    let transport = Arc::new(FileStreamTransport::open(path).await.unwrap());
    let bus = EventBus::new(tenant("t1"), transport, config);
    let reclaimed = bus.reclaim("handoffs", "g", "survivor").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].event.id, event.id);
    assert!(bus.acknowledge("handoffs", "g", reclaimed[0].id).await.unwrap());
}
