//! Concurrent requests, cancellation, errors and server-to-client requests.

mod common;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use testhost::bus::DataConsumer;
use testhost::protocol::{methods, ErrorCode, ErrorObject, Message, RequestId};
use testhost::updates::BusItem;
use testhost::ExitStatus;
use uuid::Uuid;

#[tokio::test]
async fn cancelling_one_of_three_runs_leaves_the_others() {
    let factory = ScriptedFactory::new(Behavior::Block);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    for id in 1..=3 {
        host.client.request(id, methods::RUN_TESTS, json!({}));
    }
    factory.wait_entered(3).await;
    assert_eq!(host.ledger.inbound_len(), 3);

    host.client.cancel(2);
    let error = host.client.error(2).await;
    assert_eq!(error.kind(), Some(ErrorCode::RequestCancelled));
    assert_eq!(error.message, "Request was cancelled.");
    assert!(error.data.is_none());

    factory.release(2);
    assert_eq!(host.client.result(1).await["passed"], 1);
    assert_eq!(host.client.result(3).await["passed"], 1);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(host.shutdown.outstanding(), 0);
    assert!(host.ledger.is_inbound_empty());
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.dropped(), 3);
}

#[tokio::test]
async fn exit_while_two_of_three_runs_are_in_flight_drains_to_zero() {
    let factory = ScriptedFactory::new(Behavior::Block);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    for id in 1..=3 {
        host.client.request(id, methods::RUN_TESTS, json!({}));
    }
    factory.wait_entered(3).await;

    host.client.cancel(2);
    let error = host.client.error(2).await;
    assert_eq!(error.kind(), Some(ErrorCode::RequestCancelled));

    host.client.exit();
    host.client.request(4, methods::RUN_TESTS, json!({}));
    let error = host.client.error(4).await;
    assert_eq!(error.kind(), Some(ErrorCode::InvalidRequest));
    assert!(host.ledger.contains_inbound(&RequestId::Number(1)));
    assert!(host.ledger.contains_inbound(&RequestId::Number(3)));

    factory.release(2);
    assert_eq!(host.client.result(1).await["passed"], 1);
    assert_eq!(host.client.result(3).await["passed"], 1);

    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(host.shutdown.outstanding(), 0);
    assert!(host.ledger.is_inbound_empty());
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.invocations().len(), 3);
}

#[tokio::test]
async fn cancel_for_unknown_request_is_ignored() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory);
    host.client.initialize().await;

    host.client.cancel(99);
    host.client.request(1, methods::DISCOVER_TESTS, json!({}));
    assert_eq!(host.client.result(1).await["discovered"], 1);

    // Cancelling after the answer was sent changes nothing either.
    host.client.cancel(1);
    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn exit_waits_for_in_flight_work_and_refuses_new_requests() {
    let factory = ScriptedFactory::new(Behavior::Block);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client.request(1, methods::RUN_TESTS, json!({}));
    factory.wait_entered(1).await;
    host.client.exit();
    host.client.request(2, methods::RUN_TESTS, json!({}));

    let error = host.client.error(2).await;
    assert_eq!(error.kind(), Some(ErrorCode::InvalidRequest));

    factory.release(1);
    assert_eq!(host.client.result(1).await["total"], 1);
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.invocations().len(), 1);
}

#[tokio::test]
async fn concurrent_discoveries_get_their_own_engines() {
    let factory = ScriptedFactory::new(Behavior::Block);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client.request(1, methods::DISCOVER_TESTS, json!({}));
    host.client.request(2, methods::DISCOVER_TESTS, json!({}));
    factory.wait_entered(2).await;

    let invocations = factory.invocations();
    let engines: HashSet<usize> = invocations.iter().map(|i| i.engine).collect();
    assert_eq!(engines.len(), 2);
    let ids: HashSet<RequestId> = invocations.iter().map(|i| i.request_id.clone()).collect();
    assert!(ids.contains(&RequestId::Number(1)));
    assert!(ids.contains(&RequestId::Number(2)));

    factory.release(2);
    assert_eq!(host.client.result(1).await["discovered"], 1);
    assert_eq!(host.client.result(2).await["discovered"], 1);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn engine_failure_is_an_internal_error() {
    let factory = ScriptedFactory::new(Behavior::Fail);
    let mut host = TestHost::start(test_config(), factory);
    host.client.initialize().await;

    host.client.request(1, methods::RUN_TESTS, json!({}));
    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::InternalError));
    assert_eq!(error.message, "scripted failure");
    assert!(error.data.unwrap().as_str().unwrap().contains("scripted failure"));

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn run_completes_even_when_no_engine_can_be_created() {
    let factory = ScriptedFactory::new(Behavior::Unavailable);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    let run_id = Uuid::new_v4();
    host.client
        .request(1, methods::RUN_TESTS, json!({ "runId": run_id }));
    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::InternalError));
    assert_eq!(error.message, "engine unavailable");

    let updates = host.client.notifications(methods::TEST_UPDATES);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["runId"], run_id.to_string());
    assert!(updates[0]["changes"].is_null());
    assert_eq!(factory.created(), 0);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(host.shutdown.outstanding(), 0);
}

#[tokio::test]
async fn engine_panic_is_contained() {
    let factory = ScriptedFactory::new(Behavior::Panic);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client.request(1, methods::DISCOVER_TESTS, json!({}));
    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::InternalError));
    assert!(error.message.starts_with("Request handler panicked"));
    assert!(error.message.contains("scripted panic"));

    // The session keeps serving after a handler panic.
    host.client.request(2, methods::DISCOVER_TESTS, json!({}));
    assert_eq!(
        host.client.error(2).await.kind(),
        Some(ErrorCode::InternalError)
    );

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn protocol_errors_are_reported() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client.request(1, methods::RUN_TESTS, json!({ "tests": 5 }));
    assert_eq!(
        host.client.error(1).await.kind(),
        Some(ErrorCode::InvalidParams)
    );

    host.client.request(2, "testing/unknownMethod", json!({}));
    let error = host.client.error(2).await;
    assert_eq!(error.kind(), Some(ErrorCode::MethodNotFound));
    assert!(error.message.contains("testing/unknownMethod"));

    host.client.request(
        3,
        methods::INITIALIZE,
        json!({
            "clientInfo": { "name": "again", "version": "1" },
            "protocolVersion": "1.0.0",
        }),
    );
    assert_eq!(
        host.client.error(3).await.kind(),
        Some(ErrorCode::InvalidRequest)
    );

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn duplicate_request_id_is_rejected() {
    let factory = ScriptedFactory::new(Behavior::Block);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client.request(1, methods::RUN_TESTS, json!({}));
    factory.wait_entered(1).await;
    host.client.request(1, methods::RUN_TESTS, json!({}));

    // The rejection arrives while the original is still blocked.
    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::InvalidRequest));

    factory.release(1);
    assert_eq!(host.client.result(1).await["passed"], 1);
    assert_eq!(factory.created(), 1);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn run_streams_updates_then_completion() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory);
    host.client.initialize().await;

    let run_id = Uuid::new_v4();
    host.client
        .request(1, methods::RUN_TESTS, json!({ "runId": run_id }));
    let result = host.client.result(1).await;
    assert_eq!(result["runId"], run_id.to_string());
    assert_eq!(result["total"], 1);
    assert_eq!(result["attachments"], json!([]));

    let updates: Vec<Value> = host
        .client
        .notifications(methods::TEST_UPDATES)
        .into_iter()
        .filter(|u| u["runId"] == run_id.to_string())
        .collect();
    let states: Vec<&str> = updates
        .iter()
        .filter_map(|u| u["changes"][0]["node"]["state"].as_str())
        .collect();
    assert_eq!(states, vec!["in-progress", "passed"]);
    assert!(updates.last().unwrap()["changes"].is_null());
    assert_eq!(updates.iter().filter(|u| u["changes"].is_null()).count(), 1);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn debug_run_asks_client_to_attach_debugger() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client
        .request(1, methods::RUN_TESTS, json!({ "debug": true }));
    let (id, params) = host.client.server_request(methods::ATTACH_DEBUGGER).await;
    assert_eq!(params.unwrap()["processId"], std::process::id());
    assert!(factory.invocations().is_empty());
    assert_eq!(host.ledger.outbound_len(), 1);

    host.client.send(Message::response(id, json!({})));
    assert_eq!(host.client.result(1).await["passed"], 1);
    assert_eq!(host.ledger.outbound_len(), 0);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn rejected_debugger_attach_fails_the_run() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client
        .request(1, methods::RUN_TESTS, json!({ "debug": true }));
    let (id, _) = host.client.server_request(methods::ATTACH_DEBUGGER).await;
    host.client.send(Message::error(
        id,
        ErrorObject::new(ErrorCode::InternalError, "no debugger available"),
    ));

    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::InternalError));
    assert!(error.message.contains("no debugger available"));
    assert!(factory.invocations().is_empty());

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}

#[tokio::test]
async fn cancel_while_waiting_for_debugger_and_late_answer_is_ignored() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory.clone());
    host.client.initialize().await;

    host.client
        .request(1, methods::RUN_TESTS, json!({ "debug": true }));
    let (id, _) = host.client.server_request(methods::ATTACH_DEBUGGER).await;
    host.client.cancel(1);

    let error = host.client.error(1).await;
    assert_eq!(error.kind(), Some(ErrorCode::RequestCancelled));
    assert_eq!(host.ledger.outbound_len(), 0);

    host.client.send(Message::response(id, json!({})));
    host.client
        .send(Message::response(RequestId::Number(4242), Value::Null));
    host.client.request(2, methods::DISCOVER_TESTS, json!({}));
    assert_eq!(host.client.result(2).await["discovered"], 1);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    assert!(factory
        .invocations()
        .iter()
        .all(|i| i.operation == "discover"));
}

#[tokio::test]
async fn invalid_cancel_is_reported_to_client() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let mut host = TestHost::start(test_config(), factory);
    host.client.initialize().await;

    host.client.notify(methods::CANCEL_REQUEST, json!({}));
    host.client.notify(
        methods::CLIENT_LOG,
        json!({ "level": "info", "message": "hello from the client" }),
    );
    host.client.request(1, methods::DISCOVER_TESTS, json!({}));
    host.client.result(1).await;

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
    host.client.drain_pending();

    let logs = host.client.notifications(methods::CLIENT_LOG);
    assert!(
        logs.iter()
            .any(|l| l["level"] == "warning"
                && l["message"].as_str().unwrap().contains(methods::CANCEL_REQUEST)),
        "got {:?}",
        logs
    );
}

/// Records every node update it sees.
#[derive(Default)]
struct RecordingConsumer {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl DataConsumer<BusItem> for RecordingConsumer {
    fn name(&self) -> &str {
        "recording"
    }

    async fn consume(&self, item: &BusItem) -> anyhow::Result<()> {
        if let BusItem::NodeUpdate { change, .. } = item {
            self.seen.lock().push(change.node.uid.clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn extra_consumers_see_node_updates_before_the_response() {
    let factory = ScriptedFactory::new(Behavior::Succeed);
    let consumer = Arc::new(RecordingConsumer::default());
    let mut host = {
        let consumer = consumer.clone();
        TestHost::start_with(test_config(), factory, move |s| s.with_consumer(consumer))
    };
    host.client.initialize().await;

    host.client.request(1, methods::DISCOVER_TESTS, json!({}));
    host.client.result(1).await;
    assert_eq!(*consumer.seen.lock(), vec!["t1".to_string()]);

    host.client.exit();
    assert_eq!(host.finish().await, ExitStatus::Success);
}
