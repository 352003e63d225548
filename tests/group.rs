//! Asynchronous group scenarios over loopback socket pairs.

mod common;

use bytes::BytesMut;
use common::{MockEngine, tcp_pair};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tls_channel::{ChannelError, ChannelGroup, GroupError, RegisteredChannel, TlsChannel};

fn register_pair(
    group: &ChannelGroup,
) -> (Arc<RegisteredChannel>, Arc<RegisteredChannel>) {
    let (client_stream, server_stream) = tcp_pair();
    let client = TlsChannel::builder(client_stream, MockEngine::client()).build();
    let server = TlsChannel::builder(server_stream, MockEngine::server()).build();
    (
        group.register(client).unwrap(),
        group.register(server).unwrap(),
    )
}

fn read_bufs() -> Vec<BytesMut> {
    vec![BytesMut::with_capacity(4096)]
}

fn write_bufs(data: &[u8]) -> Vec<BytesMut> {
    let mut buf = BytesMut::with_capacity(data.len());
    buf.extend_from_slice(data);
    vec![buf]
}

#[test]
fn test_async_round_trip() {
    let group = ChannelGroup::builder().workers(2).name("rt").build().unwrap();
    let (client, server) = register_pair(&group);

    let (tx, rx) = mpsc::channel();
    let read_tx = tx.clone();
    group
        .start_read(&server, read_bufs(), Some(Duration::from_secs(5)), move |bufs, result| {
            read_tx.send(("read", bufs, result)).unwrap();
        })
        .unwrap();
    group
        .start_write(
            &client,
            write_bufs(b"hello async world"),
            Some(Duration::from_secs(5)),
            move |bufs, result| {
                tx.send(("write", bufs, result)).unwrap();
            },
        )
        .unwrap();

    let mut read_done = false;
    let mut write_done = false;
    for _ in 0..2 {
        let (tag, bufs, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match tag {
            "read" => {
                let n = result.unwrap();
                assert_eq!(n, 17);
                assert_eq!(&bufs[0][..], b"hello async world");
                read_done = true;
            }
            "write" => {
                assert_eq!(result.unwrap(), 17);
                write_done = true;
            }
            _ => unreachable!(),
        }
    }
    assert!(read_done && write_done);

    group.close_channel(&client);
    group.close_channel(&server);
    group.shutdown();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_exactly_one_completion() {
    // Operations against peers that answer, close, or stay silent: every
    // started operation completes exactly once.
    let group = ChannelGroup::builder().workers(4).name("once").build().unwrap();
    let pairs = 12;
    let completions = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let mut handles = Vec::new();
    for i in 0..pairs {
        let (client, server) = register_pair(&group);
        let tx = tx.clone();
        let completions = completions.clone();
        group
            .start_read(
                &server,
                read_bufs(),
                Some(Duration::from_millis(400)),
                move |_bufs, result| {
                    completions.fetch_add(1, Ordering::SeqCst);
                    tx.send((i, result)).unwrap();
                },
            )
            .unwrap();

        match i % 3 {
            0 => {
                // Peer answers.
                group
                    .start_write(&client, write_bufs(b"data"), None, |_bufs, result| {
                        result.unwrap();
                    })
                    .unwrap();
            }
            1 => {
                // Peer closes mid-stream; the read observes EOF or a
                // failure, exactly once either way.
                group.close_channel(&client);
            }
            _ => {
                // Peer stays silent; the deadline fires.
            }
        }
        handles.push((client, server));
    }

    let mut outcomes: Vec<Option<Result<usize, GroupError>>> = (0..pairs).map(|_| None).collect();
    for _ in 0..pairs {
        let (i, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcomes[i].is_none(), "operation {} completed twice", i);
        outcomes[i] = Some(result);
    }

    for (i, outcome) in outcomes.iter().enumerate() {
        let outcome = outcome.as_ref().unwrap();
        match i % 3 {
            0 => assert!(matches!(outcome, Ok(n) if *n > 0), "pair {}: {:?}", i, outcome),
            1 => assert!(
                matches!(outcome, Ok(0) | Err(_)),
                "pair {}: {:?}",
                i,
                outcome
            ),
            _ => assert!(
                matches!(outcome, Err(GroupError::Timeout)),
                "pair {}: {:?}",
                i,
                outcome
            ),
        }
    }

    // No late duplicates.
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(completions.load(Ordering::SeqCst), pairs);
    assert!(rx.try_recv().is_err());

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_timeout_fires_once_and_cancel_after_is_false() {
    let group = ChannelGroup::builder().workers(2).name("to").build().unwrap();
    let (client, server) = register_pair(&group);

    let (tx, rx) = mpsc::channel();
    let token = group
        .start_read(&server, read_bufs(), Some(Duration::from_millis(100)), move |_bufs, result| {
            tx.send(result).unwrap();
        })
        .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(GroupError::Timeout)));

    // The operation is gone: cancelling reports nothing to cancel.
    assert!(!group.cancel_read(&server, token));
    // And no second completion arrives.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    let _ = client;
    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_second_read_rejected_while_pending() {
    let group = ChannelGroup::builder().workers(2).name("dup").build().unwrap();
    let (_client, server) = register_pair(&group);

    let token = group
        .start_read(&server, read_bufs(), None, |_bufs, _result| {})
        .unwrap();

    let err = group
        .start_read(&server, read_bufs(), None, |_bufs, _result| {})
        .unwrap_err();
    assert!(matches!(err, GroupError::ReadPending));

    assert!(group.cancel_read(&server, token));
    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_cancel_pending_invokes_no_callback() {
    let group = ChannelGroup::builder().workers(2).name("cancel").build().unwrap();
    let (_client, server) = register_pair(&group);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let token = group
        .start_read(&server, read_bufs(), Some(Duration::from_secs(60)), move |_bufs, _result| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(group.cancel_read(&server, token));
    // Cancelling again finds nothing.
    assert!(!group.cancel_read(&server, token));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_close_channel_cancels_pending_operations() {
    let group = ChannelGroup::builder().workers(2).name("close").build().unwrap();
    let (_client, server) = register_pair(&group);

    let (tx, rx) = mpsc::channel();
    group
        .start_read(&server, read_bufs(), Some(Duration::from_secs(60)), move |_bufs, result| {
            tx.send(result).unwrap();
        })
        .unwrap();

    group.close_channel(&server);
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(GroupError::Cancelled)));
    assert!(server.is_closed());

    // Operations on a closed channel are rejected.
    let err = group
        .start_read(&server, read_bufs(), None, |_bufs, _result| {})
        .unwrap_err();
    assert!(matches!(
        err,
        GroupError::Channel(ChannelError::Closed)
    ));

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_zero_length_operations_complete_trivially() {
    let group = ChannelGroup::builder().workers(2).name("zero").build().unwrap();
    let (client, server) = register_pair(&group);

    let (tx, rx) = mpsc::channel();
    let read_tx = tx.clone();
    group
        .start_read(&server, vec![], None, move |bufs, result| {
            read_tx.send((bufs.len(), result)).unwrap();
        })
        .unwrap();
    group
        .start_write(&client, vec![], None, move |bufs, result| {
            tx.send((bufs.len(), result)).unwrap();
        })
        .unwrap();

    for _ in 0..2 {
        let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_group_runs_surfaced_tasks() {
    let group = ChannelGroup::builder().workers(2).name("tasks").build().unwrap();
    let (client_stream, server_stream) = tcp_pair();
    let client = TlsChannel::builder(client_stream, MockEngine::client()).build();
    // Misconfigured for group use: tasks are surfaced instead of run
    // inline. The group runs them on a worker as a courtesy.
    let server = TlsChannel::builder(server_stream, MockEngine::server_with_task())
        .run_tasks(false)
        .build();
    let client = group.register(client).unwrap();
    let server = group.register(server).unwrap();

    let (tx, rx) = mpsc::channel();
    group
        .start_read(&server, read_bufs(), Some(Duration::from_secs(5)), move |bufs, result| {
            tx.send((bufs, result)).unwrap();
        })
        .unwrap();
    group
        .start_write(&client, write_bufs(b"taskwork"), None, |_bufs, result| {
            result.unwrap();
        })
        .unwrap();

    let (bufs, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), 8);
    assert_eq!(&bufs[0][..], b"taskwork");

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_graceful_shutdown_lifecycle() {
    let group = ChannelGroup::builder().workers(2).name("grace").build().unwrap();
    let (client, server) = register_pair(&group);
    assert_eq!(group.channel_count(), 2);

    group.shutdown();

    // No new registrations once shutting down.
    let (extra_client, _extra_server) = tcp_pair();
    let extra = TlsChannel::builder(extra_client, MockEngine::client()).build();
    assert!(matches!(group.register(extra), Err(GroupError::Shutdown)));

    // Not terminated while channels remain registered.
    assert!(!group.await_termination(Duration::from_millis(100)));

    group.close_channel(&client);
    group.close_channel(&server);
    assert!(group.await_termination(Duration::from_secs(5)));
    assert_eq!(group.channel_count(), 0);

    // Operations after termination are rejected.
    let err = group
        .start_read(&server, read_bufs(), None, |_bufs, _result| {})
        .unwrap_err();
    assert!(matches!(err, GroupError::Shutdown));
}

#[test]
fn test_many_sequential_operations_are_ordered() {
    // Same-direction operations on one channel never overlap: each read is
    // started after the previous completes, and the reassembled stream
    // matches the written one.
    let group = ChannelGroup::builder().workers(3).name("seq").build().unwrap();
    let (client, server) = register_pair(&group);

    let payload: Vec<u8> = (0..u8::MAX).collect();
    group
        .start_write(&client, write_bufs(&payload), Some(Duration::from_secs(5)), |_bufs, result| {
            result.unwrap();
        })
        .unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let (tx, rx) = mpsc::channel();
        group
            .start_read(
                &server,
                vec![BytesMut::with_capacity(64)],
                Some(Duration::from_secs(5)),
                move |bufs, result| {
                    tx.send((bufs, result)).unwrap();
                },
            )
            .unwrap();
        let (bufs, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let n = result.unwrap();
        assert!(n > 0);
        received.extend_from_slice(&bufs[0][..n]);
    }
    assert_eq!(received, payload);

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_channel_over_mio_stream() {
    // mio's TcpStream satisfies the transport contract directly.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_std = TcpStream::connect(addr).unwrap();
    let (server_std, _) = listener.accept().unwrap();
    client_std.set_nonblocking(true).unwrap();
    server_std.set_nonblocking(true).unwrap();

    let client_mio = mio::net::TcpStream::from_std(client_std);
    let server_mio = mio::net::TcpStream::from_std(server_std);

    let group = ChannelGroup::builder().workers(2).name("mio").build().unwrap();
    let client = group
        .register(TlsChannel::builder(client_mio, MockEngine::client()).build())
        .unwrap();
    let server = group
        .register(TlsChannel::builder(server_mio, MockEngine::server()).build())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    group
        .start_read(&server, read_bufs(), Some(Duration::from_secs(5)), move |bufs, result| {
            tx.send((bufs, result)).unwrap();
        })
        .unwrap();
    group
        .start_write(&client, write_bufs(b"over mio"), None, |_bufs, result| {
            result.unwrap();
        })
        .unwrap();

    let (bufs, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), 8);
    assert_eq!(&bufs[0][..], b"over mio");

    group.shutdown_now();
    assert!(group.await_termination(Duration::from_secs(5)));
}
