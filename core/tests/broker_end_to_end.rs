//! End-to-end tests driving a real `Mist` instance over its Unix socket.

use std::collections::BTreeMap;
use std::time::Duration;

use mist_core::envelope::{
    Envelope, MSG_AGENT_CATALOG, MSG_AGENT_LIST, MSG_AGENT_READY, MSG_AGENT_REGISTER, MSG_COMMAND,
    MSG_RESPONSE,
};
use mist_core::transport::client::Client;
use mist_core::{Args, Mist};
use serde_json::{json, Value};

async fn start_mist(ws_port: u16) -> (Mist, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        data_dir: dir.path().to_path_buf(),
        ws_host: "127.0.0.1".to_string(),
        ws_port,
        verbose: false,
    };
    let mut mist = Mist::new(&args).await.unwrap();
    mist.start().await.unwrap();
    // give the listeners a moment to bind before clients connect
    tokio::time::sleep(Duration::from_millis(50)).await;
    (mist, dir)
}

fn register_payload(name: &str) -> BTreeMap<String, Value> {
    let mut payload = BTreeMap::new();
    payload.insert("name".to_string(), Value::String(name.to_string()));
    payload.insert("commands".to_string(), json!([]));
    payload
}

#[tokio::test]
async fn register_then_list_round_trip_over_socket() {
    let (mut mist, _dir) = start_mist(18765).await;
    let socket = mist.paths().socket_path();

    let mut agent = Client::connect(&socket, "pending").await.unwrap();
    let register = Envelope::create(MSG_AGENT_REGISTER, "pending", "broker", register_payload("notes"));
    agent.send(&register).unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(2), agent.recv()).await.unwrap().unwrap();
    assert_eq!(ack.r#type, MSG_AGENT_READY);

    let mut ui = Client::connect(&socket, "ui").await.unwrap();
    let list = Envelope::create(MSG_AGENT_LIST, "ui", "broker", BTreeMap::new());
    let reply = ui.request(list, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.r#type, MSG_AGENT_CATALOG);
    let agents = reply.payload["agents"].as_array().unwrap();
    assert!(agents.iter().any(|a| a["name"] == json!("notes")));

    mist.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_names_get_distinct_counters() {
    let (mut mist, _dir) = start_mist(18766).await;
    let socket = mist.paths().socket_path();

    let mut first = Client::connect(&socket, "pending-1").await.unwrap();
    first
        .send(&Envelope::create(MSG_AGENT_REGISTER, "pending-1", "broker", register_payload("notes")))
        .unwrap();
    let first_ack = tokio::time::timeout(Duration::from_secs(2), first.recv()).await.unwrap().unwrap();

    let mut second = Client::connect(&socket, "pending-2").await.unwrap();
    second
        .send(&Envelope::create(MSG_AGENT_REGISTER, "pending-2", "broker", register_payload("notes")))
        .unwrap();
    let second_ack = tokio::time::timeout(Duration::from_secs(2), second.recv()).await.unwrap().unwrap();

    let first_id = first_ack.payload["agent_id"].as_str().unwrap().to_string();
    let second_id = second_ack.payload["agent_id"].as_str().unwrap().to_string();
    assert_ne!(first_id, second_id);
    assert!(first_id.starts_with("notes-"));
    assert!(second_id.starts_with("notes-"));

    mist.shutdown().await.unwrap();
}

#[tokio::test]
async fn task_service_round_trip_over_socket() {
    let (mut mist, _dir) = start_mist(18767).await;
    let socket = mist.paths().socket_path();

    let client = Client::connect(&socket, "agent-0").await.unwrap();
    let created = client
        .service_request(
            "tasks",
            "create",
            [("title".to_string(), Value::String("Write report".to_string()))].into(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(created["task_id"], json!(1));

    let listed = client
        .service_request("tasks", "list", BTreeMap::new(), Duration::from_secs(2))
        .await
        .unwrap();
    let tasks = listed.as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["title"], json!("Write report"));

    mist.shutdown().await.unwrap();
}

#[tokio::test]
async fn command_round_trip_to_connected_agent() {
    let (mut mist, _dir) = start_mist(18768).await;
    let socket = mist.paths().socket_path();

    let mut agent = Client::connect(&socket, "pending").await.unwrap();
    agent
        .send(&Envelope::create(MSG_AGENT_REGISTER, "pending", "broker", register_payload("echo")))
        .unwrap();
    let ack = tokio::time::timeout(Duration::from_secs(2), agent.recv()).await.unwrap().unwrap();
    let agent_id = ack.payload["agent_id"].as_str().unwrap().to_string();

    let mut ui = Client::connect(&socket, "ui").await.unwrap();
    let command = Envelope::create(MSG_COMMAND, "ui", agent_id.as_str(), BTreeMap::new());
    ui.send(&command).unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(2), agent.recv()).await.unwrap().unwrap();
    assert_eq!(forwarded.r#type, MSG_COMMAND);

    let mut reply_payload = BTreeMap::new();
    reply_payload.insert("type".to_string(), Value::String("text".to_string()));
    let reply = Envelope::reply(&forwarded, agent_id.as_str(), MSG_RESPONSE, reply_payload);
    agent.send(&reply).unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), ui.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.r#type, MSG_RESPONSE);

    mist.shutdown().await.unwrap();
}
