use std::time::Duration;

use mcache_client::{Client, ClientError, GetFields, Opcode, Output, StoreParams};
use mcache_mock::MockServer;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

#[test]
fn test_flush_returns_every_buffered_reply_in_order() {
    let server = MockServer::start().unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    client.set_buffering(true);

    for i in 0..10 {
        let key = format!("k{}", i);
        let reply = client
            .set(key.as_bytes(), b"v", StoreParams::default(), TIMEOUT)
            .unwrap();
        assert!(reply.is_buffered());
    }
    // Nothing is sent before the flush.
    assert_eq!(server.store().get(b"k0"), None);

    let completions = client.flush(TIMEOUT).unwrap();
    assert_eq!(completions.len(), 10);
    for (i, completion) in completions.iter().enumerate() {
        assert_eq!(completion.opcode, Opcode::Set);
        assert_eq!(completion.key, format!("k{}", i).into_bytes());
        assert!(matches!(completion.result, Ok(Output::Stored { .. })));
    }
    assert_eq!(server.store().get(b"k9"), Some(b"v".to_vec()));
    assert!(client.flush(TIMEOUT).unwrap().is_empty());
}

#[test]
fn test_flush_reports_per_command_outcomes() {
    let server = MockServer::start().unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    let _ = client.set(b"present", b"x", StoreParams::default(), TIMEOUT).unwrap();

    client.set_buffering(true);
    let _ = client.get(b"present", GetFields::VALUE, TIMEOUT).unwrap();
    let _ = client.get(b"absent", GetFields::VALUE, TIMEOUT).unwrap();
    let _ = client.add(b"present", b"y", StoreParams::default(), TIMEOUT).unwrap();
    let _ = client.stat("", 0, TIMEOUT).unwrap();

    let completions = client.flush(None).unwrap();
    assert_eq!(completions.len(), 4);
    match &completions[0].result {
        Ok(Output::Item(item)) => assert_eq!(item.value, b"x"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(completions[1].result, Err(ClientError::NotFound)));
    assert!(matches!(completions[2].result, Err(ClientError::KeyExists)));
    assert!(matches!(completions[3].result, Ok(Output::Stats(_))));
}

#[test]
fn test_reset_discards_unsent_commands() {
    let server = MockServer::start().unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    client.set_buffering(true);
    for i in 0..5 {
        let key = format!("k{}", i);
        let _ = client
            .set(key.as_bytes(), b"v", StoreParams::default(), TIMEOUT)
            .unwrap();
    }
    client.reset_buffers();

    assert!(client.flush(TIMEOUT).unwrap().is_empty());
    assert_eq!(client.server_status()[0].pending, 0);
    for i in 0..5 {
        assert_eq!(server.store().get(format!("k{}", i).as_bytes()), None);
    }

    // The connection stays usable.
    client.set_buffering(false);
    let _ = client.set(b"after", b"v", StoreParams::default(), TIMEOUT).unwrap();
    assert_eq!(server.store().get(b"after"), Some(b"v".to_vec()));
}

#[test]
fn test_buffered_commands_span_servers() {
    let first = MockServer::start().unwrap();
    let second = MockServer::start().unwrap();
    let mut client = Client::connect([first.address(), second.address()]).unwrap();
    client.set_buffering(true);

    let keys: Vec<String> = (0..32).map(|i| format!("key-{}", i)).collect();
    for key in &keys {
        let _ = client
            .set(key.as_bytes(), b"v", StoreParams::default(), TIMEOUT)
            .unwrap();
    }
    let completions = client.flush(TIMEOUT).unwrap();
    assert_eq!(completions.len(), keys.len());
    for (key, completion) in keys.iter().zip(&completions) {
        assert_eq!(completion.key, key.as_bytes());
        let owner = client.server_for_key(key.as_bytes()).unwrap();
        assert_eq!(completion.server, owner.index);
        assert!(completion.result.is_ok());
    }
}

#[test]
fn test_direct_calls_do_not_consume_buffered_results() {
    let server = MockServer::start().unwrap();
    let mut client = Client::connect(server.address()).unwrap();
    client.set_buffering(true);
    let _ = client.set(b"queued", b"v", StoreParams::default(), TIMEOUT).unwrap();

    client.set_buffering(false);
    assert_eq!(client.noop(0, TIMEOUT).unwrap().ready(), Some(()));

    let completions = client.flush(TIMEOUT).unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].key, b"queued");
}
