//! End-to-end test: a real single-node server over TCP.
//!
//! Multi-node behavior is covered deterministically in palaver-sim; this
//! exercises the socket path - framing, hello, gateway dispatch,
//! subscription push - against a live listener.

use std::sync::atomic::Ordering;
use std::time::Duration;

use palaver_client::Client;
use palaver_config::{ClusterTableConfig, MemberEntry, PalaverConfig};
use palaver_server::Server;
use palaver_types::MessageId;
use palaver_wire::StreamEvent;

fn test_config(data_dir: &std::path::Path) -> PalaverConfig {
    let mut config = PalaverConfig::default();
    config.node.id = 0;
    config.node.listen_addr = "127.0.0.1:0".to_string();
    config.node.data_directory = data_dir.to_path_buf();
    config.raft.election_timeout_min_ms = 100;
    config.raft.election_timeout_max_ms = 200;
    config.raft.heartbeat_interval_ms = 40;
    config.cluster = ClusterTableConfig {
        members: vec![MemberEntry {
            id: 0,
            addr: "127.0.0.1:0".to_string(),
        }],
    };
    config
}

#[test]
fn register_login_send_and_stream_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = Server::new(test_config(dir.path())).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_handle();

    let handle = std::thread::spawn(move || server.run());

    // Writes retry internally until the node elects itself.
    let mut alice = Client::connect(&addr).unwrap();
    alice.register("alice", "apw").unwrap();
    alice.register("bob", "bpw").unwrap();

    // A second connection logs in as bob and subscribes.
    let mut bob = Client::connect(&addr).unwrap();
    assert_eq!(bob.login("bob", "bpw").unwrap(), 0);
    bob.stream_messages("bob").unwrap();

    let id = alice.send_message("alice", "bob", "hi over tcp").unwrap();
    assert_eq!(id, MessageId::new(1));

    // The subscriber receives the pushed delivery.
    match bob.next_event().unwrap() {
        StreamEvent::NewMessage(message) => {
            assert_eq!(message.id, id);
            assert_eq!(message.sender, "alice");
            assert_eq!(message.content, "hi over tcp");
            assert!(!message.read);
        }
        other => panic!("expected delivery, got {other:?}"),
    }

    // Reads see the message; unread count reflects it.
    let mut reader = Client::connect(&addr).unwrap();
    let messages = reader.get_messages("bob", 10).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(reader.login("bob", "bpw").unwrap(), 1);

    // Mark read, then the unread count drops.
    reader.mark_as_read("bob", vec![id]).unwrap();
    assert_eq!(reader.login("bob", "bpw").unwrap(), 0);

    // Accounts listing with a pattern.
    assert_eq!(reader.list_accounts("ali", 0, 10).unwrap(), vec!["alice"]);

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap().unwrap();
}

#[test]
fn state_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let addr;

    {
        let mut server = Server::new(test_config(dir.path())).unwrap();
        addr = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || server.run());

        let mut client = Client::connect(&addr).unwrap();
        client.register("alice", "apw").unwrap();
        client.register("bob", "bpw").unwrap();
        client.send_message("alice", "bob", "durable").unwrap();

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }

    // Same data directory, fresh process-equivalent.
    let mut server = Server::new(test_config(dir.path())).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_handle();
    let handle = std::thread::spawn(move || server.run());

    // Give the node a moment to re-elect, then read back.
    std::thread::sleep(Duration::from_millis(500));
    let mut client = Client::connect(&addr).unwrap();
    let messages = client.get_messages("bob", 10).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "durable");
    assert_eq!(messages[0].id, MessageId::new(1));

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap().unwrap();
}
