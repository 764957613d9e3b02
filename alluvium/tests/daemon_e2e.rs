//! End-to-end tests driving the daemon through its control socket.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{net::Ipv4Addr, time::Duration};

use alluvium_dns::ARecord;
use support::DaemonHarness;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[tokio::test]
async fn update_creates_a_set_and_drop_removes_it() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("example.com", vec![ARecord::new(ip("1.2.3.4"), 300)]);

    let reply = harness.send("update A\nexample.com\n\n").await;
    assert_eq!(reply, "ok\n");
    assert_eq!(harness.backend.live("A"), Some(vec![ip("1.2.3.4")]));

    let reply = harness.send("drop A\n\n").await;
    assert_eq!(reply, "ok\n");

    // the registry no longer knows the set
    let reply = harness.send("drop A\n\n").await;
    assert_eq!(reply, "set A is not found\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn identical_updates_still_reload_every_time() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("example.com", vec![ARecord::new(ip("1.2.3.4"), 300)]);

    assert_eq!(harness.send("update A\nexample.com\n\n").await, "ok\n");
    assert_eq!(harness.send("update A\nexample.com\n\n").await, "ok\n");

    // update reloads unconditionally, even with identical resolutions
    assert_eq!(harness.backend.replace_count(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn one_set_unions_all_of_its_domains() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("a.example", vec![ARecord::new(ip("1.1.1.1"), 300)]);
    harness.resolver.answer(
        "b.example",
        vec![
            ARecord::new(ip("3.3.3.3"), 300),
            ARecord::new(ip("2.2.2.2"), 300),
        ],
    );

    let reply = harness.send("update A\na.example\nb.example\n\n").await;
    assert_eq!(reply, "ok\n");
    assert_eq!(
        harness.backend.live("A"),
        Some(vec![ip("1.1.1.1"), ip("2.2.2.2"), ip("3.3.3.3")])
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn empty_update_empties_the_kernel_set() {
    let harness = DaemonHarness::start().await;

    let reply = harness.send("update A\n\n").await;
    assert_eq!(reply, "ok\n");
    assert_eq!(harness.backend.live("A"), Some(Vec::new()));

    harness.shutdown().await;
}

#[tokio::test]
async fn request_split_across_writes_is_reassembled() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("foo.example", vec![ARecord::new(ip("5.6.7.8"), 300)]);

    let mut stream = harness.connect().await;
    stream.write_all(b"update A\nfoo.exa").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"mple\n\n").await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "ok\n");
    assert_eq!(harness.backend.live("A"), Some(vec![ip("5.6.7.8")]));

    harness.shutdown().await;
}

#[tokio::test]
async fn eof_terminates_a_request() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("foo.example", vec![ARecord::new(ip("5.6.7.8"), 300)]);

    let mut stream = harness.connect().await;
    // no blank line; the half-close is the terminator
    stream.write_all(b"update A\nfoo.example").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "ok\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_get_their_specific_replies() {
    let harness = DaemonHarness::start().await;

    assert_eq!(harness.send("bogus A\n\n").await, "wrong command\n");
    assert_eq!(harness.send("garbage\n\n").await, "some garbage on input\n");
    assert_eq!(harness.send("drop missing\n\n").await, "set missing is not found\n");

    let long_name = "a".repeat(31);
    assert_eq!(
        harness.send(&format!("update {long_name}\n\n")).await,
        "bad set name\n"
    );

    let edge_name = "a".repeat(30);
    assert_eq!(harness.send(&format!("update {edge_name}\n\n")).await, "ok\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn bad_domain_leaves_the_registry_unchanged() {
    let harness = DaemonHarness::start().await;

    let reply = harness.send("update A\nxn--a\n\n").await;
    assert!(reply.starts_with("error: "), "unexpected reply {reply:?}");
    assert_eq!(harness.backend.replace_count(), 0);

    // the failed update created nothing
    assert_eq!(harness.send("drop A\n\n").await, "set A is not found\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn backend_failure_is_surfaced_and_recoverable() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("example.com", vec![ARecord::new(ip("1.2.3.4"), 300)]);

    harness.backend.set_failing(true);
    let reply = harness.send("update A\nexample.com\n\n").await;
    assert!(reply.starts_with("error: "), "unexpected reply {reply:?}");
    assert_eq!(harness.send("drop A\n\n").await, "set A is not found\n");

    harness.backend.set_failing(false);
    assert_eq!(harness.send("update A\nexample.com\n\n").await, "ok\n");
    assert_eq!(harness.backend.live("A"), Some(vec![ip("1.2.3.4")]));

    harness.shutdown().await;
}

#[tokio::test]
async fn excess_clients_are_accepted_and_closed() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("foo.example", vec![ARecord::new(ip("5.6.7.8"), 300)]);

    let mut first = harness.connect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the daemon is busy with `first`; this one is refused by closing
    let mut second = harness.connect().await;
    let mut buf = String::new();
    second.read_to_string(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    // the first client is still being served
    first.write_all(b"update A\nfoo.example\n\n").await.unwrap();
    let mut reply = String::new();
    first.read_to_string(&mut reply).await.unwrap();
    assert_eq!(reply, "ok\n");

    harness.shutdown().await;
}

#[tokio::test]
async fn unicode_domains_are_accepted_over_the_wire() {
    let harness = DaemonHarness::start().await;
    harness
        .resolver
        .answer("xn--mnchen-3ya.example", vec![ARecord::new(ip("9.9.9.9"), 300)]);

    let reply = harness.send("update A\nmünchen.example\n\n").await;
    assert_eq!(reply, "ok\n");
    assert_eq!(harness.backend.live("A"), Some(vec![ip("9.9.9.9")]));

    harness.shutdown().await;
}

#[tokio::test]
async fn shutdown_removes_the_control_socket() {
    let harness = DaemonHarness::start().await;
    let ctl_path = harness.ctl_path().to_path_buf();
    assert!(ctl_path.exists());

    harness.shutdown().await;
    assert!(!ctl_path.exists());
}
