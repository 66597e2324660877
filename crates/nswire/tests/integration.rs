//! End-to-end scenarios over an in-memory transport pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use nswire::{
    ClientBuilder, Conn, ConnConfig, Error, Events, Message, Namespaces, NsConn, ON_ANY_EVENT,
    Server, is_system_event,
    transport::pipe,
};

/// Route library tracing to the test harness; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wire a server and a dialing client together over an in-memory pipe.
async fn serve_and_dial(
    server_namespaces: Namespaces,
    client_namespaces: Namespaces,
) -> (Arc<Server>, Arc<Conn>, nswire::Client) {
    init_tracing();
    let server = Server::new(server_namespaces, ConnConfig::default());
    let (server_end, client_end) = pipe(32);
    let accepted = server.accept(Box::new(server_end)).await.unwrap();
    let client = ClientBuilder::new(client_namespaces).dial(Box::new(client_end));
    (server, accepted, client)
}

fn pong_server_namespaces() -> Namespaces {
    Namespaces::new().namespace(
        "default",
        Events::new().on("ping", |ns: Arc<NsConn>, msg: Message| async move {
            ns.reply(&msg, b"PONG MESSAGE".to_vec()).await
        }),
    )
}

#[tokio::test]
async fn ask_ping_pong() {
    let (_server, _accepted, client) = serve_and_dial(
        pong_server_namespaces(),
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    for _ in 0..5 {
        let reply = ns.ask("ping", Vec::new(), None).await.unwrap();
        assert_eq!(reply.body, b"PONG MESSAGE");
    }
    // One more after the burst; correlation state must be clean.
    let reply = ns.ask("ping", Vec::new(), None).await.unwrap();
    assert_eq!(reply.body, b"PONG MESSAGE");

    client.close().await;
}

#[tokio::test]
async fn any_event_echo_keeps_namespace_and_event() {
    let seen: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    // The server has no specific handler; its catch-all echoes the body
    // back under the same event name.
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on(ON_ANY_EVENT, move |ns: Arc<NsConn>, msg: Message| {
            let sink = Arc::clone(&sink);
            async move {
                if is_system_event(&msg.event) {
                    return Ok(());
                }
                sink.lock().push((msg.event.clone(), msg.body.clone()));
                let body = msg.body.clone();
                ns.emit(&msg.event, body).await
            }
        }),
    );

    let echoed: Arc<Mutex<Vec<(String, String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let echo_sink = Arc::clone(&echoed);
    let client_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on("an_event", move |ns: Arc<NsConn>, msg: Message| {
            let echo_sink = Arc::clone(&echo_sink);
            async move {
                echo_sink
                    .lock()
                    .push((ns.namespace().to_owned(), msg.event.clone(), msg.body));
                Ok(())
            }
        }),
    );

    let (_server, _accepted, client) =
        serve_and_dial(server_namespaces, client_namespaces).await;

    let ns = client.connect("default").await.unwrap();
    ns.emit("an_event", b"a_body".to_vec()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The catch-all saw exactly the application event, none of the
    // lifecycle events fired during the handshake.
    assert_eq!(
        seen.lock().as_slice(),
        &[("an_event".to_owned(), b"a_body".to_vec())]
    );
    // The echo arrived exactly once, on the same namespace and event.
    assert_eq!(
        echoed.lock().as_slice(),
        &[(
            "default".to_owned(),
            "an_event".to_owned(),
            b"a_body".to_vec()
        )]
    );
}

#[tokio::test]
async fn catch_all_skips_events_with_specific_handlers() {
    let any_log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let lifecycle_log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let any_sink = Arc::clone(&any_log);
    let connect_sink = Arc::clone(&lifecycle_log);
    let connected_sink = Arc::clone(&lifecycle_log);
    let disconnect_sink = Arc::clone(&lifecycle_log);

    let client_namespaces = Namespaces::new().namespace(
        "default",
        Events::new()
            .on(ON_ANY_EVENT, move |_ns: Arc<NsConn>, msg: Message| {
                let any_sink = Arc::clone(&any_sink);
                async move {
                    any_sink.lock().push(msg.event.clone());
                    Ok(())
                }
            })
            .on(
                nswire::ON_NAMESPACE_CONNECT,
                move |_ns: Arc<NsConn>, _msg: Message| {
                    let connect_sink = Arc::clone(&connect_sink);
                    async move {
                        connect_sink.lock().push("connect");
                        Ok(())
                    }
                },
            )
            .on(
                nswire::ON_NAMESPACE_CONNECTED,
                move |_ns: Arc<NsConn>, _msg: Message| {
                    let connected_sink = Arc::clone(&connected_sink);
                    async move {
                        connected_sink.lock().push("connected");
                        Ok(())
                    }
                },
            )
            .on(
                nswire::ON_NAMESPACE_DISCONNECT,
                move |_ns: Arc<NsConn>, _msg: Message| {
                    let disconnect_sink = Arc::clone(&disconnect_sink);
                    async move {
                        disconnect_sink.lock().push("disconnected");
                        Ok(())
                    }
                },
            ),
    );

    let (_server, accepted, client) = serve_and_dial(
        Namespaces::new().namespace("default", Events::new()),
        client_namespaces,
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    let server_ns = accepted.namespace("default").unwrap();
    server_ns.emit("announce", b"x".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    ns.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The lifecycle events went to their specific handlers, never to the
    // catch-all; the catch-all saw only the application event.
    assert_eq!(any_log.lock().as_slice(), &["announce".to_owned()]);
    assert_eq!(
        lifecycle_log.lock().as_slice(),
        &["connect", "connected", "disconnected"]
    );
}

#[tokio::test]
async fn connected_handler_runs_before_first_application_event() {
    // The server emits an application event from inside its own Connected
    // handler, immediately after acking the handshake.
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on(
            nswire::ON_NAMESPACE_CONNECTED,
            |ns: Arc<NsConn>, _msg: Message| async move { ns.emit("early", Vec::new()).await },
        ),
    );

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let connected_sink = Arc::clone(&order);
    let early_sink = Arc::clone(&order);
    let client_namespaces = Namespaces::new().namespace(
        "default",
        Events::new()
            .on(
                nswire::ON_NAMESPACE_CONNECTED,
                move |_ns: Arc<NsConn>, _msg: Message| {
                    let connected_sink = Arc::clone(&connected_sink);
                    async move {
                        connected_sink.lock().push("connected");
                        Ok(())
                    }
                },
            )
            .on("early", move |_ns: Arc<NsConn>, _msg: Message| {
                let early_sink = Arc::clone(&early_sink);
                async move {
                    early_sink.lock().push("early");
                    Ok(())
                }
            }),
    );

    let (_server, _accepted, client) =
        serve_and_dial(server_namespaces, client_namespaces).await;

    let _ns = client.connect("default").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The local Connected handler must observe the transition before the
    // peer's first application event is dispatched.
    assert_eq!(order.lock().as_slice(), &["connected", "early"]);
}

#[tokio::test]
async fn concurrent_asks_resolve_to_their_own_replies() {
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on("double", |ns: Arc<NsConn>, msg: Message| async move {
            let mut body = msg.body.clone();
            body.extend_from_slice(&msg.body);
            ns.reply(&msg, body).await
        }),
    );
    let (_server, _accepted, client) = serve_and_dial(
        server_namespaces,
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    let mut tasks = Vec::new();
    for i in 0..50u8 {
        let asker = Arc::clone(&ns);
        tasks.push(tokio::spawn(async move {
            let reply = asker.ask("double", vec![i], None).await?;
            Ok::<_, Error>((i, reply.body))
        }));
    }
    for task in tasks {
        let (i, body) = task.await.unwrap().unwrap();
        assert_eq!(body, vec![i, i]);
    }
}

#[tokio::test]
async fn disconnect_fails_pending_asks() {
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on("silent", |_ns: Arc<NsConn>, _msg: Message| async move { Ok(()) }),
    );
    let (_server, _accepted, client) = serve_and_dial(
        server_namespaces,
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    let mut pending = Vec::new();
    for _ in 0..8 {
        let asker = Arc::clone(&ns);
        pending.push(tokio::spawn(async move {
            asker.ask("silent", Vec::new(), None).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    ns.disconnect().await.unwrap();
    for task in pending {
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_disconnect());
    }
}

#[tokio::test]
async fn emits_arrive_in_order() {
    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on("seq", move |_ns: Arc<NsConn>, msg: Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(msg.body[0]);
                Ok(())
            }
        }),
    );
    let (_server, _accepted, client) = serve_and_dial(
        server_namespaces,
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    for i in 0..30u8 {
        ns.emit("seq", vec![i]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock();
    assert_eq!(seen.len(), 30);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "order violated: {seen:?}");
}

#[tokio::test]
async fn connect_phase_rejection_reaches_the_dialer() {
    let server_namespaces = Namespaces::new().namespace(
        "vip",
        Events::new().on(
            nswire::ON_NAMESPACE_CONNECT,
            |_ns: Arc<NsConn>, _msg: Message| async move {
                Err(Error::Handshake {
                    message: "members only".into(),
                })
            },
        ),
    );
    let (_server, accepted, client) = serve_and_dial(
        server_namespaces,
        Namespaces::new().namespace("vip", Events::new()),
    )
    .await;

    let err = client.connect("vip").await.unwrap_err();
    match err {
        Error::Handshake { message } => assert!(message.contains("members only")),
        other => panic!("expected handshake rejection, got {other:?}"),
    }
    assert!(client.namespace("vip").is_none());
    assert!(accepted.namespace("vip").is_none());
    // The connection survives the failed handshake.
    assert!(!client.is_closed());
}

#[tokio::test]
async fn ask_timeout_leaves_connection_usable() {
    let server_namespaces = Namespaces::new().namespace(
        "default",
        Events::new()
            .on("silent", |_ns: Arc<NsConn>, _msg: Message| async move { Ok(()) })
            .on("ping", |ns: Arc<NsConn>, msg: Message| async move {
                ns.reply(&msg, b"PONG MESSAGE".to_vec()).await
            }),
    );
    let (_server, _accepted, client) = serve_and_dial(
        server_namespaces,
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;

    let ns = client.connect("default").await.unwrap();
    let err = ns
        .ask("silent", Vec::new(), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // A timed-out ask is local; the next one succeeds.
    let reply = ns.ask("ping", Vec::new(), None).await.unwrap();
    assert_eq!(reply.body, b"PONG MESSAGE");
}

#[tokio::test]
async fn server_initiated_ask_reaches_client_handler() {
    let client_namespaces = Namespaces::new().namespace(
        "default",
        Events::new().on("whoami", |ns: Arc<NsConn>, msg: Message| async move {
            ns.reply(&msg, b"client here".to_vec()).await
        }),
    );
    init_tracing();
    let server = Server::new(
        Namespaces::new().namespace("default", Events::new()),
        ConnConfig::default(),
    );
    server.set_auto_connect(["default"]);

    let (server_end, client_end) = pipe(32);
    let client = ClientBuilder::new(client_namespaces).dial(Box::new(client_end));
    let accepted = server.accept(Box::new(server_end)).await.unwrap();

    let ns = accepted.namespace("default").unwrap();
    let reply = ns.ask("whoami", Vec::new(), None).await.unwrap();
    assert_eq!(reply.body, b"client here");
    drop(client);
}

#[tokio::test]
async fn broadcast_fans_out_to_all_joined_clients() {
    init_tracing();
    let counts: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let server = Server::new(
        Namespaces::new().namespace("chat", Events::new()),
        ConnConfig::default(),
    );
    let mut clients = Vec::new();
    for _ in 0..3 {
        let sink = Arc::clone(&counts);
        let namespaces = Namespaces::new().namespace(
            "chat",
            Events::new().on("news", move |_ns: Arc<NsConn>, _msg: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    let _ = sink.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let (server_end, client_end) = pipe(32);
        let _ = server.accept(Box::new(server_end)).await.unwrap();
        let client = ClientBuilder::new(namespaces).dial(Box::new(client_end));
        let _ = client.connect("chat").await.unwrap();
        clients.push(client);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let delivered = server.broadcast("chat", "news", b"extra".to_vec()).await.unwrap();
    assert_eq!(delivered, 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn namespaces_are_isolated_on_one_connection() {
    let chat_log: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let news_log: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let chat_sink = Arc::clone(&chat_log);
    let news_sink = Arc::clone(&news_log);

    let server_namespaces = Namespaces::new()
        .namespace(
            "chat",
            Events::new().on("post", move |_ns: Arc<NsConn>, msg: Message| {
                let chat_sink = Arc::clone(&chat_sink);
                async move {
                    chat_sink.lock().push(msg.body);
                    Ok(())
                }
            }),
        )
        .namespace(
            "news",
            Events::new().on("post", move |_ns: Arc<NsConn>, msg: Message| {
                let news_sink = Arc::clone(&news_sink);
                async move {
                    news_sink.lock().push(msg.body);
                    Ok(())
                }
            }),
        );
    let client_namespaces = Namespaces::new()
        .namespace("chat", Events::new())
        .namespace("news", Events::new());
    let (_server, _accepted, client) =
        serve_and_dial(server_namespaces, client_namespaces).await;

    let chat = client.connect("chat").await.unwrap();
    let news = client.connect("news").await.unwrap();

    chat.emit("post", b"to chat".to_vec()).await.unwrap();
    news.emit("post", b"to news".to_vec()).await.unwrap();

    // Disconnecting one namespace leaves the other usable.
    chat.disconnect().await.unwrap();
    news.emit("post", b"still here".to_vec()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(chat_log.lock().as_slice(), &[b"to chat".to_vec()]);
    assert_eq!(
        news_log.lock().as_slice(),
        &[b"to news".to_vec(), b"still here".to_vec()]
    );
}

#[tokio::test]
async fn client_close_cleans_up_server_side() {
    let (server, accepted, client) = serve_and_dial(
        pong_server_namespaces(),
        Namespaces::new().namespace("default", Events::new()),
    )
    .await;
    let _ = client.connect("default").await.unwrap();
    assert_eq!(server.total_connections(), 1);

    client.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(accepted.is_closed());
    assert_eq!(server.total_connections(), 0);
}
