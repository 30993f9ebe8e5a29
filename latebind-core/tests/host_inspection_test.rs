use echo_service::{EchoServiceServer, FILE_DESCRIPTOR_SET};
use echo_service_impl::EchoServiceImpl;
use latebind_core::binding::ServiceConnector;
use latebind_core::catalog::{ContractCatalog, Discovery};
use latebind_core::factory::{ConstructionArgs, ProxyFactory};
use latebind_core::interception::host::{HostInspector, InspectedService};
use latebind_core::interception::{
    EventContext, EventHub, EventKind, InspectorConfig, InterceptionEvent, SchemaSet,
};
use latebind_core::metadata::MetadataFragment;
use latebind_core::proxy::{Proxy, Reply, Strategy};
use latebind_core::type_cache::ClientTypeCache;
use parking_lot::Mutex;
use prost_reflect::DescriptorPool;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tonic::service::Routes;

mod echo_service_impl;

const ADDRESS: &str = "http://echo.test:50051";

type Events = Arc<Mutex<Vec<InterceptionEvent>>>;

fn host_inspector() -> (Arc<HostInspector>, Events) {
    let pool = DescriptorPool::decode(FILE_DESCRIPTOR_SET).unwrap();
    let events = Arc::new(EventHub::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.subscribe(move |event| sink.lock().push(event.clone()));

    let inspector = HostInspector::new(
        "echo.EchoService@host",
        Arc::new(SchemaSet::from_pool(&pool)),
        events,
        InspectorConfig::default(),
    );
    (Arc::new(inspector), seen)
}

fn setup_proxy() -> (Proxy<ServiceConnector<Routes>>, Events) {
    let (inspector, seen) = host_inspector();
    let echo = EchoServiceServer::new(EchoServiceImpl::default());
    let service = InspectedService::new(echo, inspector);

    let catalog = ContractCatalog::resolve(
        vec![MetadataFragment::FileDescriptorSet(FILE_DESCRIPTOR_SET.to_vec())],
        &Discovery::new(ADDRESS),
    )
    .unwrap();

    let proxy = ProxyFactory::new(Arc::new(catalog), ServiceConnector::new(Routes::new(service)))
        .with_type_cache(Arc::new(ClientTypeCache::new()))
        .create(Strategy::per_session(), &ConstructionArgs::new("EchoService"))
        .unwrap();

    (proxy, seen)
}

async fn wait_for_events(seen: &Events, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unary_exchanges_are_decoded() {
    let (mut proxy, seen) = setup_proxy();
    proxy.configure_credentials(|credentials| credentials.insert("x-api-token", "secret"));

    let reply = proxy
        .call("UnaryEcho", vec![json!({ "message": "inspected" })])
        .await
        .unwrap();
    assert_eq!(reply, Reply::Unary(json!({ "message": "inspected" })));

    let events = seen.lock();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::ReceivingRequest, EventKind::SendingReply]);
    assert_eq!(events[0].correlation_id, events[1].correlation_id);
    assert_eq!(events[0].action, "/echo.EchoService/UnaryEcho");
    assert_eq!(events[0].payload, Some(json!({ "message": "inspected" })));
    assert_eq!(events[1].payload, Some(json!({ "message": "inspected" })));
    assert!(events.iter().all(|e| e.validation_error.is_none()));
    assert_eq!(events[0].context.credential_keys, vec!["x-api-token".to_string()]);
    assert_eq!(&*events[0].endpoint, "echo.EchoService@host");
}

#[tokio::test]
async fn test_each_exchange_keeps_its_own_correlation() {
    let (proxy, seen) = setup_proxy();
    let proxy = Arc::new(tokio::sync::Mutex::new(proxy));

    let calls = (0..4).map(|i| {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .lock()
                .await
                .call("UnaryEcho", vec![json!({ "message": format!("m{i}") })])
                .await
                .unwrap()
        })
    });
    for call in calls.collect::<Vec<_>>() {
        call.await.unwrap();
    }

    let events = seen.lock();
    assert_eq!(events.len(), 8);
    for request in events.iter().filter(|e| e.kind == EventKind::ReceivingRequest) {
        let reply = events
            .iter()
            .find(|e| {
                e.kind == EventKind::SendingReply && e.correlation_id == request.correlation_id
            })
            .unwrap();
        assert_eq!(reply.payload, request.payload);
    }
}

#[tokio::test]
async fn test_one_way_exchanges_have_no_reply_event() {
    let (mut proxy, seen) = setup_proxy();

    let reply = proxy
        .call("Notify", vec![json!({ "message": "ping" })])
        .await
        .unwrap();
    assert_eq!(reply, Reply::OneWay);

    wait_for_events(&seen, 1).await;
    // Give a stray reply event the chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = seen.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ReceivingRequest);
    assert!(events[0].one_way);
    assert_eq!(events[0].payload, Some(json!({ "message": "ping" })));
}

#[tokio::test]
async fn test_streaming_exchanges_pass_through() {
    let (mut proxy, seen) = setup_proxy();

    let reply = proxy
        .call("ServerStreamingEcho", vec![json!({ "message": "s" })])
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Streaming(items) if items.len() == 3));

    let events = seen.lock();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::ReceivingRequest, EventKind::SendingReply]);
    assert!(events.iter().all(|e| e.payload.is_none()));
}

#[tokio::test]
async fn test_failed_exchanges_still_reply() {
    let (mut proxy, seen) = setup_proxy();

    let result = proxy.call("Fail", vec![json!({ "message": "3" })]).await;
    assert!(result.is_err());

    let events = seen.lock();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::ReceivingRequest, EventKind::SendingReply]);
    assert_eq!(events[1].payload, None);
}

#[test]
fn test_invalid_requests_are_reported() {
    let (inspector, seen) = host_inspector();

    let token = inspector.after_receive_request(
        "/echo.EchoService/UnaryEcho",
        Some(&json!({ "unknown": 1 })),
        &EventContext::default(),
    );
    inspector.before_send_reply(
        token.clone(),
        Some(&json!({ "message": "ok" })),
        &EventContext::default(),
    );

    let events = seen.lock();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::ErrorOccurred,
            EventKind::ReceivingRequest,
            EventKind::SendingReply
        ]
    );
    assert!(events[1].validation_error.is_some());
    assert!(events.iter().all(|e| e.correlation_id == token.id));
}
