//! End-to-end scenarios against a real listener.

use lib_hub::core::{HubConfig, Overflow, QueueBound};
use project_tests::TestServer;

#[tokio::test]
async fn two_clients_chat_and_history_is_served() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut alice = server.connect("alice").await?;
    alice.expect_presence(&["alice"]).await?;

    let mut bob = server.connect("bob").await?;
    alice.expect_presence(&["alice", "bob"]).await?;
    bob.expect_presence(&["alice", "bob"]).await?;

    alice.say("hi").await?;
    assert_eq!(alice.recv_chat().await?, ("alice".to_string(), "hi".to_string()));
    assert_eq!(bob.recv_chat().await?, ("alice".to_string(), "hi".to_string()));

    let chats: serde_json::Value = reqwest::get(server.http_url("/chats")).await?.json().await?;
    let chats = chats.as_array().expect("history is an array");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["UserID"], "alice");
    assert_eq!(chats[0]["Content"], "hi");
    assert_eq!(chats[0]["type"], "chat");

    bob.close().await?;
    alice.expect_presence(&["alice"]).await?;

    server.stop().await
}

#[tokio::test]
async fn sender_is_always_the_announced_identity() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut alice = server.connect("alice").await?;
    alice.expect_presence(&["alice"]).await?;

    let mut eve = server.connect("eve").await?;
    eve.expect_presence(&["alice", "eve"]).await?;
    eve.send_text(r#"{"UserID":"alice","Content":"x","type":"chat"}"#).await?;

    assert_eq!(alice.recv_chat().await?, ("eve".to_string(), "x".to_string()));
    assert_eq!(server.hub.history()[0].sender.as_str(), "eve");

    server.stop().await
}

#[tokio::test]
async fn malformed_announcement_is_never_registered() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut watcher = server.connect("watcher").await?;
    watcher.expect_presence(&["watcher"]).await?;

    let mut bad = server.connect_raw().await?;
    bad.send_text("not json").await?;
    assert!(bad.closed_by_server().await);

    assert_eq!(server.hub.online(), 1);
    assert_eq!(server.hub.snapshot().len(), 1);

    // The next frame the watcher sees is its own chat, not a presence change.
    watcher.say("still here").await?;
    let next = watcher.recv().await?;
    assert_eq!(next.kind(), "chat");

    server.stop().await
}

#[tokio::test]
async fn malformed_chat_ends_the_session() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut alice = server.connect("alice").await?;
    alice.expect_presence(&["alice"]).await?;
    let mut bob = server.connect("bob").await?;
    alice.expect_presence(&["alice", "bob"]).await?;

    bob.send_text("{broken").await?;
    assert!(bob.closed_by_server().await);

    alice.expect_presence(&["alice"]).await?;
    server.wait_for_online(1).await?;
    assert_eq!(server.hub.history_len(), 0);

    server.stop().await
}

#[tokio::test]
async fn duplicate_identities_are_listed_per_connection() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut first = server.connect("sam").await?;
    first.expect_presence(&["sam"]).await?;
    let mut second = server.connect("sam").await?;
    second.expect_presence(&["sam", "sam"]).await?;

    first.close().await?;
    second.expect_presence(&["sam"]).await?;

    server.stop().await
}

#[tokio::test]
async fn every_client_sees_the_same_order() -> anyhow::Result<()> {
    let config = HubConfig {
        queue: QueueBound::Bounded { capacity: 16, overflow: Overflow::Block },
        ..HubConfig::default()
    };
    let server = TestServer::start(config).await?;

    let mut a = server.connect("a").await?;
    a.expect_presence(&["a"]).await?;
    let mut b = server.connect("b").await?;
    a.expect_presence(&["a", "b"]).await?;
    b.expect_presence(&["a", "b"]).await?;

    for i in 0..20 {
        a.say(&format!("a{i}")).await?;
        b.say(&format!("b{i}")).await?;
    }

    let mut seen_a = Vec::new();
    let mut seen_b = Vec::new();
    for _ in 0..40 {
        seen_a.push(a.recv_chat().await?);
        seen_b.push(b.recv_chat().await?);
    }
    assert_eq!(seen_a, seen_b);

    // Each sender's messages keep their relative order.
    for sender in ["a", "b"] {
        let contents: Vec<&str> = seen_a
            .iter()
            .filter(|(from, _)| from == sender)
            .map(|(_, content)| content.as_str())
            .collect();
        let sent: Vec<String> = (0..20).map(|i| format!("{sender}{i}")).collect();
        assert_eq!(contents, sent);
    }
    assert_eq!(server.hub.history_len(), 40);

    server.stop().await
}

#[tokio::test]
async fn monitoring_routes_respond() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let health = reqwest::get(server.http_url("/health")).await?.text().await?;
    assert_eq!(health, "OK");

    let mut alice = server.connect("alice").await?;
    alice.expect_presence(&["alice"]).await?;

    let status: serde_json::Value = reqwest::get(server.http_url("/status")).await?.json().await?;
    assert_eq!(status["online"], 1);
    assert_eq!(status["history"], 0);
    assert!(status["ts"].is_string());

    server.stop().await
}

#[tokio::test]
async fn shutdown_closes_open_connections() -> anyhow::Result<()> {
    let server = TestServer::start(HubConfig::default()).await?;

    let mut alice = server.connect("alice").await?;
    alice.expect_presence(&["alice"]).await?;

    server.hub.shutdown();
    assert!(alice.closed_by_server().await);
    Ok(())
}
