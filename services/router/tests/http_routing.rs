
use std::time::Duration;

use futures_util::StreamExt;
use gatehouse_router::RouterError;
use gatehouse_types::{EventType, Route};
use harness::{get, read_head, self_signed, tls_handshake, EchoBackend, HttpBackend, HttpHandle};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as SocketListener, TcpStream};
use tokio::time::timeout;

#[tokio::test]
async fn routes_by_host_and_follows_backend_changes() {
    let mut router = HttpHandle::start().await;
    let one = HttpBackend::spawn("1").await.unwrap();
    router.discovery.register("test", &one.addr_string());
    router.add_route(Route::http("example.com", "test")).await;

    let reply = get(router.addr(), "example.com", "/", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "1");

    let two = HttpBackend::spawn("2").await.unwrap();
    router.discovery.unregister("test", &one.addr_string());
    router
        .wait_for_backend(EventType::BackendDown, &one.addr_string())
        .await;
    router.discovery.register("test", &two.addr_string());
    router
        .wait_for_backend(EventType::BackendUp, &two.addr_string())
        .await;

    let reply = get(router.addr(), "EXAMPLE.com:8080", "/", None).await;
    assert_eq!(reply.body, "2");
}

#[tokio::test]
async fn unknown_host_is_not_found() {
    let router = HttpHandle::start().await;
    let reply = get(router.addr(), "nowhere.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn route_without_backends_is_unavailable() {
    let mut router = HttpHandle::start().await;
    router.add_route(Route::http("empty.example", "empty")).await;

    let reply = get(router.addr(), "empty.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn disabled_route_is_not_found() {
    let mut router = HttpHandle::start().await;
    let backend = HttpBackend::spawn("up").await.unwrap();
    router.discovery.register("web", &backend.addr_string());
    let mut route = Route::http("off.example", "web");
    route.disabled = true;
    router.add_route(route).await;

    let reply = get(router.addr(), "off.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn longest_path_prefix_wins() {
    let mut router = HttpHandle::start().await;
    let mut backends = Vec::new();
    for service in ["root", "foo", "bar"] {
        let backend = HttpBackend::spawn(service).await.unwrap();
        router.discovery.register(service, &backend.addr_string());
        backends.push(backend);
    }
    router.add_route(Route::http("a.example", "root")).await;
    router
        .add_route(Route::http("a.example", "foo").with_path("/foo/"))
        .await;
    router
        .add_route(Route::http("a.example", "bar").with_path("/foo/bar"))
        .await;

    let cases = [
        ("/foo/bar/baz", "bar"),
        ("/foo/other", "foo"),
        ("/foo", "root"),
        ("/anything-else", "root"),
    ];
    for (path, expected) in cases {
        let reply = get(router.addr(), "a.example", path, None).await;
        assert_eq!(reply.body, expected, "path {path}");
    }
}

#[tokio::test]
async fn wildcard_domain_routes_subdomains() {
    let mut router = HttpHandle::start().await;
    let backend = HttpBackend::spawn("wild").await.unwrap();
    router.discovery.register("wild", &backend.addr_string());
    router.add_route(Route::http("*.a.example", "wild")).await;

    let reply = get(router.addr(), "x.a.example", "/", None).await;
    assert_eq!(reply.body, "wild");
    let reply = get(router.addr(), "x.b.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sni_selects_wildcard_certificate() {
    let mut router = HttpHandle::start().await;
    let (cert, der) = self_signed(&["*.a.example"]);
    let mut route = Route::http("*.a.example", "web");
    route.certificate = Some(cert);
    router.add_route(route).await;

    let presented = tls_handshake(router.tls_addr(), "x.a.example").await.unwrap();
    assert_eq!(presented, der);

    assert!(tls_handshake(router.tls_addr(), "y.b.example").await.is_err());
}

#[tokio::test]
async fn sticky_cookie_pins_backend_until_it_leaves() {
    let mut router = HttpHandle::start().await;
    let one = HttpBackend::spawn("1").await.unwrap();
    let two = HttpBackend::spawn("2").await.unwrap();
    router.discovery.register("sticky", &one.addr_string());
    let mut route = Route::http("sticky.example", "sticky");
    route.sticky = true;
    router.add_route(route).await;

    // Only B1 is live, so the first response pins it.
    let reply = get(router.addr(), "sticky.example", "/", None).await;
    assert_eq!(reply.body, "1");
    let set_cookie = reply.headers["set-cookie"].to_str().unwrap().to_string();
    let cookie = set_cookie.split(';').next().unwrap().to_string();
    assert!(cookie.starts_with("_backend="));

    router.discovery.register("sticky", &two.addr_string());
    router
        .wait_for_backend(EventType::BackendUp, &two.addr_string())
        .await;
    for _ in 0..2 {
        let reply = get(router.addr(), "sticky.example", "/", Some(&cookie)).await;
        assert_eq!(reply.body, "1");
        assert!(reply.headers.get("set-cookie").is_none());
    }

    router.discovery.unregister("sticky", &one.addr_string());
    router
        .wait_for_backend(EventType::BackendDown, &one.addr_string())
        .await;
    let reply = get(router.addr(), "sticky.example", "/", Some(&cookie)).await;
    assert_eq!(reply.body, "2");
    let renewed = reply.headers["set-cookie"].to_str().unwrap();
    assert!(renewed.starts_with("_backend="));
    assert_ne!(renewed.split(';').next().unwrap(), cookie);
}

#[tokio::test]
async fn upgrade_bridges_connections() {
    let mut router = HttpHandle::start().await;
    let backend = EchoBackend::spawn_upgrade().await.unwrap();
    router
        .discovery
        .register("ws", &backend.addr.to_string());
    router.add_route(Route::http("ws.example", "ws")).await;

    let mut client = TcpStream::connect(router.addr()).await.unwrap();
    client
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: ws.example\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\n",
        )
        .await
        .unwrap();
    let head = timeout(Duration::from_secs(5), read_head(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {head}");

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    // Half-closing our side ends the backend's echo loop, which closes its
    // side in turn.
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn removed_route_stops_matching() {
    let mut router = HttpHandle::start().await;
    let backend = HttpBackend::spawn("x").await.unwrap();
    router.discovery.register("web", &backend.addr_string());
    let route = router.add_route(Route::http("gone.example", "web")).await;
    assert_eq!(get(router.addr(), "gone.example", "/", None).await.body, "x");

    router.listener.remove_route(&route.id).await.unwrap();
    harness::wait_for_event(&mut router.events, EventType::Remove, |e| {
        e.route_id() == Some(route.id.as_str())
    })
    .await;
    let reply = get(router.addr(), "gone.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn explicit_port_listener_follows_its_routes() {
    let mut router = HttpHandle::start().await;
    let backend = HttpBackend::spawn("ported").await.unwrap();
    router.discovery.register("web", &backend.addr_string());

    let port = {
        let socket = SocketListener::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    };
    let mut route = Route::http("ported.example", "web");
    route.port = i32::from(port);
    let route = router.add_route(route).await;

    let addr = router.listener.port_addr(route.port).unwrap();
    assert_eq!(addr.port(), port);
    assert_eq!(get(addr, "ported.example", "/", None).await.body, "ported");
    // Routes with an explicit port are not served on the default listener.
    let reply = get(router.addr(), "ported.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);

    router.listener.remove_route(&route.id).await.unwrap();
    harness::wait_for_event(&mut router.events, EventType::Remove, |e| {
        e.route_id() == Some(route.id.as_str())
    })
    .await;
    assert!(router.listener.port_addr(route.port).is_none());
}

#[tokio::test]
async fn removing_last_certificate_route_clears_sni_entry() {
    let mut router = HttpHandle::start().await;
    let (cert, der) = self_signed(&["secure.example"]);
    let mut route = Route::http("secure.example", "web");
    route.certificate = Some(cert);
    let route = router.add_route(route).await;

    let presented = tls_handshake(router.tls_addr(), "secure.example").await.unwrap();
    assert_eq!(presented, der);

    router.listener.remove_route(&route.id).await.unwrap();
    harness::wait_for_event(&mut router.events, EventType::Remove, |e| {
        e.route_id() == Some(route.id.as_str())
    })
    .await;
    assert!(tls_handshake(router.tls_addr(), "secure.example").await.is_err());
}

#[tokio::test]
async fn failure_after_dial_closes_the_client_connection() {
    let mut router = HttpHandle::start().await;
    let broken = SocketListener::bind("127.0.0.1:0").await.unwrap();
    let broken_addr = broken.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = broken.accept().await {
            tokio::spawn(async move {
                let _ = read_head(&mut stream).await;
                let _ = stream.write_all(b"not http at all\r\n\r\n").await;
            });
        }
    });
    router.discovery.register("broken", &broken_addr);
    router.add_route(Route::http("broken.example", "broken")).await;

    let reply = get(router.addr(), "broken.example", "/", None).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.headers["connection"], "close");
}

#[tokio::test]
async fn paused_service_holds_requests_until_resumed() {
    let mut router = HttpHandle::start().await;
    let backend = HttpBackend::spawn("held").await.unwrap();
    router.discovery.register("web", &backend.addr_string());
    router.add_route(Route::http("held.example", "web")).await;

    assert!(matches!(
        router.listener.pause_service("missing", true),
        Err(RouterError::NotFound)
    ));

    router.listener.pause_service("web", true).unwrap();
    let addr = router.addr();
    let pending = tokio::spawn(async move { get(addr, "held.example", "/", None).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    router.listener.pause_service("web", false).unwrap();
    let reply = timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.body, "held");

    let gate = router.listener.service_gate("web").unwrap();
    let mut drained = Box::pin(gate.drained());
    timeout(Duration::from_secs(5), drained.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gate.in_flight(), 0);
}

#[tokio::test]
async fn stalled_tls_handshake_is_dropped() {
    let router = HttpHandle::start().await;
    let mut client = TcpStream::connect(router.tls_addr()).await.unwrap();

    // Never send a ClientHello; the listener gives up after its handshake
    // timeout and closes the socket.
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(20), client.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));
}
