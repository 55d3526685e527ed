//! End-to-end tests driving the allocator router in process.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rackalloc_allocator::{
    api,
    collaborators::{mock::Call, RecordingCollaborators},
    engine::{Engine, EngineConfig},
    inventory::Inventory,
    state::{AppState, NodeNetwork},
};
use rackalloc_id::HostId;
use rackalloc_networking::RackSubnet;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

struct Rack {
    router: Router,
    state: AppState,
    recorder: Arc<RecordingCollaborators>,
    _shutdown: watch::Sender<bool>,
}

fn inventory(hosts: usize) -> String {
    let mut text = String::new();
    for i in 1..=hosts {
        text.push_str(&format!(
            "[[hosts]]\nid = \"rack01-server{i:02}\"\nprimary_mac = \"52:54:00:00:01:{i:02x}\"\nsecondary_mac = \"52:54:00:00:02:{i:02x}\"\n\n"
        ));
    }
    text
}

impl Rack {
    /// A rack whose hosts have all checked in.
    async fn new(hosts: usize) -> Self {
        let subnet = RackSubnet::from_cidr("192.168.1.1/24").unwrap();
        let recorder = Arc::new(RecordingCollaborators::new());

        let mut engine = Engine::new(EngineConfig::default());
        let now = std::time::Instant::now();
        for host in Inventory::parse(&inventory(hosts))
            .unwrap()
            .into_hosts(&subnet)
            .unwrap()
        {
            engine.add_host(host, now).unwrap();
        }

        let (state, dispatcher) = AppState::new(
            engine,
            recorder.collaborators(),
            NodeNetwork::new(&subnet, subnet.gateway),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(dispatcher.run(shutdown_rx));

        let rack = Self {
            router: api::create_router(state.clone()),
            state,
            recorder,
            _shutdown: shutdown,
        };
        for i in 1..=hosts {
            let (status, _) = rack.host_event(&host_id(i), json!({"event": "checked_in"})).await;
            assert_eq!(status, StatusCode::OK);
        }
        rack
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn command(&self, cmd: &str, arguments: Value) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/v1/commands",
            Some(json!({"cmd": cmd, "arguments": arguments})),
        )
        .await
    }

    async fn host_event(&self, host: &str, event: Value) -> (StatusCode, Value) {
        self.send("POST", &format!("/v1/hosts/{host}/events"), Some(event))
            .await
    }

    /// Waits for the effect dispatcher to have made a matching call.
    async fn wait_for_call(&self, matches: impl Fn(&Call) -> bool) -> bool {
        for _ in 0..100 {
            if self.recorder.calls().iter().any(&matches) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    async fn status(&self) -> Value {
        let (status, body) = self.command("admin.queryStatus", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        body
    }
}

fn host_id(i: usize) -> String {
    format!("rack01-server{i:02}")
}

fn host_states(status: &Value) -> Vec<String> {
    status["hosts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["state"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_allocate_inaugurate_free_restores_pool() {
    let rack = Rack::new(3).await;

    let (status, _) = rack
        .command("handshake", json!({"versionInfo": {"apiVersion": 1}}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, index) = rack
        .command(
            "allocate",
            json!({"requirements": {"count": 2}, "allocationInfo": {"user": "ci"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let index = index.as_u64().unwrap();
    assert_eq!(index, 0);

    let (status, done) = rack.command("allocation.done", json!({"id": index})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done, json!(false));

    let (status, body) = rack.command("allocation.nodes", json!({"id": index})).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["exceptionType"], "PreconditionFailed");

    // Provision whichever two hosts were picked.
    let snapshot = rack.status().await;
    assert_eq!(snapshot["freeHosts"], 1);
    let picked: Vec<String> = snapshot["hosts"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|h| h["allocation"] == json!(index))
        .map(|h| h["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(picked.len(), 2);
    for host in &picked {
        let (status, _) = rack.host_event(host, json!({"event": "label_provided"})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = rack
            .host_event(host, json!({"event": "inauguration_done"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "INAUGURATION_DONE");
    }

    let (_, done) = rack.command("allocation.done", json!({"id": index})).await;
    assert_eq!(done, json!(true));

    let (status, nodes) = rack.command("allocation.nodes", json!({"id": index})).await;
    assert_eq!(status, StatusCode::OK);
    let nodes = nodes.as_object().unwrap();
    assert_eq!(nodes.len(), 2);
    for node in nodes.values() {
        assert!(picked.contains(&node["id"].as_str().unwrap().to_string()));
        assert_eq!(node["netmask"], "255.255.255.0");
        assert_eq!(node["gateway"], "192.168.1.1");
        assert_eq!(node["inauguratorServerIP"], "192.168.1.1");
    }

    let (status, credentials) = rack
        .command(
            "node.rootSSHCredentials",
            json!({"allocationID": index, "nodeID": picked[0]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(credentials["hostname"], "10.0.0.1");

    let (status, _) = rack.command("heartbeat", json!({"ids": [index]})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = rack.command("allocation.free", json!({"id": index})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = rack.command("allocation.free", json!({"id": index})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = rack.command("allocation.nodes", json!({"id": index})).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["exceptionType"], "PreconditionFailed");

    let snapshot = rack.status().await;
    let reclaiming = host_states(&snapshot)
        .iter()
        .filter(|s| *s == "QUICK_RECLAMATION_IN_PROGRESS")
        .count();
    assert_eq!(reclaiming, 2);

    for host in &picked {
        let (status, body) = rack.host_event(host, json!({"event": "checked_in"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "CHECKED_IN");
    }

    let snapshot = rack.status().await;
    assert_eq!(snapshot["freeHosts"], 3);
    assert!(host_states(&snapshot).iter().all(|s| s == "CHECKED_IN"));

    assert!(
        rack.wait_for_call(|c| matches!(c, Call::Published(e) if e.event_type == "allocation.freed"))
            .await
    );
    let soft_reclaims = rack
        .recorder
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::SoftReclaim(_)))
        .count();
    assert_eq!(soft_reclaims, 2);
}

#[tokio::test]
async fn test_unmet_requirements_leave_pool_untouched() {
    let rack = Rack::new(3).await;
    let before = rack.status().await;

    let (status, body) = rack
        .command("allocate", json!({"requirements": {"count": 4}}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["exceptionType"], "InsufficientCapacity");

    let (status, _) = rack
        .command(
            "allocate",
            json!({"requirements": {"count": 1, "hardwareConstraints": {"minimumCpus": 64}}}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let after = rack.status().await;
    assert_eq!(before["hosts"].as_array().unwrap().len(), 3);
    assert_eq!(after["freeHosts"], 3);
    assert_eq!(host_states(&before), host_states(&after));
    assert!(after["allocations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_allocations_get_disjoint_hosts() {
    let rack = Arc::new(Rack::new(4).await);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let rack = rack.clone();
        handles.push(tokio::spawn(async move {
            rack.command("allocate", json!({"requirements": {"count": 1}}))
                .await
        }));
    }
    let mut granted = 0;
    for handle in handles {
        let (status, _) = handle.await.unwrap();
        if status == StatusCode::OK {
            granted += 1;
        } else {
            assert_eq!(status, StatusCode::CONFLICT);
        }
    }
    assert_eq!(granted, 4);

    let snapshot = rack.status().await;
    let mut owners: Vec<u64> = snapshot["hosts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["allocation"].as_u64().unwrap())
        .collect();
    owners.sort_unstable();
    owners.dedup();
    assert_eq!(owners.len(), 4);

    let free = rack.state.with_engine(|engine, _| engine.pool().len()).await;
    assert_eq!(free, 0);
}

#[tokio::test]
async fn test_provisioning_failure_kills_allocation() {
    let rack = Rack::new(2).await;
    let (_, index) = rack
        .command("allocate", json!({"requirements": {"count": 2}}))
        .await;
    let index = index.as_u64().unwrap();

    let snapshot = rack.status().await;
    let victim = snapshot["hosts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|h| h["allocation"] == json!(index))
        .map(|h| h["id"].as_str().unwrap().to_string())
        .unwrap();

    let (status, body) = rack
        .host_event(
            &victim,
            json!({"event": "provisioning_failed", "reason": "disk not found"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "SLOW_RECLAMATION_IN_PROGRESS");

    let (_, dead) = rack.command("allocation.dead", json!({"id": index})).await;
    assert_eq!(dead, json!(true));

    let (status, body) = rack.command("heartbeat", json!({"ids": [index]})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["exceptionType"], "NotFound");

    assert!(
        rack.wait_for_call(|c| matches!(c, Call::Published(e) if e.event_type == "allocation.dead"))
            .await
    );
}

#[tokio::test]
async fn test_command_envelope_errors() {
    let rack = Rack::new(1).await;

    let (status, body) = rack.command("reboot", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["exceptionType"], "InvalidArguments");
    assert!(body["requestId"].is_string());

    let (status, body) = rack
        .command("handshake", json!({"versionInfo": {"apiVersion": 99}}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["exceptionType"], "ProtocolMismatch");

    let (status, body) = rack.command("allocation.done", json!({"id": 42})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["exceptionType"], "NotFound");

    let (status, _) = rack
        .send("POST", "/v1/commands", Some(json!("not an envelope")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = rack
        .host_event("rack01-server99", json!({"event": "checked_in"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["exceptionType"], "NotFound");
}

#[tokio::test]
async fn test_pxe_commands_reach_collaborator() {
    let rack = Rack::new(1).await;

    let (status, _) = rack
        .command("disablepxe", json!({"mac": "52:54:00:00:01:01"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = rack
        .command("enablepxe", json!({"mac": "52:54:00:00:01:01"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let calls = rack.recorder.calls();
    assert!(calls.iter().any(|c| matches!(c, Call::DisablePxe(_))));
    assert!(calls.iter().any(|c| matches!(c, Call::EnablePxe(_))));
}

#[tokio::test]
async fn test_post_mortem_and_serial_log() {
    let rack = Rack::new(1).await;
    let host = host_id(1);
    rack.recorder
        .set_serial_log(HostId::parse(&host).unwrap(), "kernel panic");

    let (status, body) = rack
        .send("GET", &format!("/v1/hosts/{host}/serial-log"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["log"], "kernel panic");
    assert_eq!(body["location"], format!("memory://serial/{host}"));

    let (_, index) = rack
        .command("allocate", json!({"requirements": {"count": 1}}))
        .await;
    let index = index.as_u64().unwrap();

    let (status, body) = rack
        .send("POST", &format!("/v1/allocations/{index}/post-mortem"), None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["location"], format!("memory://post-mortem/{index}"));
    assert_eq!(body["pack"]["nodes"][0]["hostId"], host);

    let (status, _) = rack
        .send("POST", "/v1/allocations/77/post-mortem", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = rack.send("GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
}
