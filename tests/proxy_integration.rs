use std::sync::Arc;
use std::time::Duration;

use shellguard::proxy::{DomainAllowlist, DomainApprovalGate, ProxyServer, ProxyServerBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_proxy(allowed: &[&str], gate: Option<DomainApprovalGate>) -> (ProxyServer, u16) {
    let mut builder = ProxyServerBuilder::new()
        .port(0)
        .require_approval(true)
        .allowlist(Arc::new(DomainAllowlist::new(allowed)));
    if let Some(gate) = gate {
        builder = builder.approval(Arc::new(gate));
    }
    let proxy = builder.build();
    let addr = proxy.start().await.expect("proxy should start");
    (proxy, addr.port())
}

/// Read an HTTP response head, up to and including the blank line.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(IO_TIMEOUT, stream.read(&mut byte))
            .await
            .expect("response head timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// TCP server that echoes everything back on each connection.
async fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Minimal origin answering every request with a fixed body.
async fn start_origin(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_connect_unlisted_without_gate_is_forbidden() {
    let (proxy, port) = start_proxy(&["api.anthropic.com"], None).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"CONNECT blocked.example.com:443 HTTP/1.1\r\nHost: blocked.example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"), "got: {}", head);

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_allowed_tunnels_bytes() {
    let echo_port = start_echo_server().await;
    let (proxy, port) = start_proxy(&["127.0.0.1"], None).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = format!(
        "CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n",
        echo_port
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

    client.write_all(b"ping through tunnel").await.unwrap();
    let mut echoed = [0u8; 19];
    timeout(IO_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping through tunnel");

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_allowed_but_unreachable_is_bad_gateway() {
    // Bind and drop to find a port with nothing listening.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (proxy, port) = start_proxy(&["127.0.0.1"], None).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", dead_port);
    client.write_all(connect.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"), "got: {}", head);

    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_forwarded_to_origin() {
    let origin_port = start_origin("hello").await;
    let (proxy, port) = start_proxy(&["127.0.0.1"], None).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{0}/index HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
        origin_port
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("hello"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_plain_http_unlisted_is_forbidden() {
    let (proxy, port) = start_proxy(&[], None).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"GET http://tracker.example.net/ HTTP/1.1\r\nHost: tracker.example.net\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"), "got: {}", head);

    proxy.stop().await;
}

#[tokio::test]
async fn test_approved_domain_added_to_allowlist() {
    let echo_port = start_echo_server().await;
    let gate = DomainApprovalGate::from_fn(Duration::from_secs(5), |domain: String| async move {
        domain == "127.0.0.1"
    });
    let (proxy, port) = start_proxy(&[], Some(gate)).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", echo_port);
    client.write_all(connect.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);
    assert!(proxy.allowlist().is_allowed("127.0.0.1"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_denied_domain_not_added() {
    let gate = DomainApprovalGate::from_fn(Duration::from_secs(5), |_domain: String| async { false });
    let (proxy, port) = start_proxy(&[], Some(gate)).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"CONNECT denied.example.org:443 HTTP/1.1\r\nHost: denied.example.org:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403"), "got: {}", head);
    assert!(!proxy.allowlist().is_allowed("denied.example.org"));

    proxy.stop().await;
}
