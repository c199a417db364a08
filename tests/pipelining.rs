use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{StatusCode, Uri};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use hyperpipe::client::{Builder, Client, Config, ContextId, Error};
use hyperpipe::message::Request;
use hyperpipe::Body;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn uri(addr: SocketAddr, path: &str) -> Uri {
    format!("http://{addr}{path}").parse().unwrap()
}

fn quick_retries() -> Client {
    let mut config = Config::default();
    config.min_retry_base = Duration::from_millis(1);
    Builder::new().with_config(config).build()
}

/// Read from `stream` until `count` header blocks have arrived.
async fn read_heads(stream: &mut TcpStream, count: usize) -> io::Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.windows(4).filter(|w| w == b"\r\n\r\n").count() < count {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        received.extend_from_slice(&buf[..n]);
    }
    Ok(received)
}

/// Accept connections, handing each one to `script` along with its index.
async fn listen<F, Fut>(script: F) -> (SocketAddr, JoinHandle<usize>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut accepted = 0;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return accepted;
            };
            accepted += 1;
            if script(accepted, stream).await {
                return accepted;
            }
        }
    });
    (addr, handle)
}

#[tokio::test]
async fn responses_arrive_in_request_order() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, server) = listen(|_, mut stream| async move {
        let received = read_heads(&mut stream, 3).await.unwrap();
        let text = String::from_utf8(received).unwrap();
        let order: Vec<_> = ["/one", "/two", "/three"]
            .iter()
            .map(|path| text.find(&format!("GET {path} ")).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));

        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\none\
                  HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n3\r\ntwo\r\n0\r\n\r\n\
                  HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nthree",
            )
            .await
            .unwrap();
        let _ = stream.read(&mut [0u8; 16]).await;
        true
    })
    .await;

    let client = Client::new();
    let ctx = ContextId::new();
    let mut pending = Vec::new();
    for path in ["/one", "/two", "/three"] {
        pending.push(
            client
                .submit(ctx, Request::get(uri(addr, path)), None)
                .await?,
        );
    }
    assert_eq!(client.context_active_count(ctx), 1);

    while client.pump(ctx, Some(Duration::from_secs(5))).await {}

    for (response, body) in pending.into_iter().zip(["one", "two", "three"]) {
        let response = response.await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from(body));
    }

    client.shutdown();
    assert_eq!(server.await?, 1);
    Ok(())
}

#[tokio::test]
async fn conflicting_framing_is_rejected() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = listen(|_, mut stream| async move {
        read_heads(&mut stream, 1).await.unwrap();
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\ncontent-length: 50\r\n\r\n\
                  5\r\nhello\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        let _ = stream.read(&mut [0u8; 16]).await;
        false
    })
    .await;

    let client = Client::new();
    let request = Request::get(uri(addr, "/")).with_sink(Vec::new());
    let error = client
        .process(ContextId::new(), request)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Protocol(_)), "unexpected error: {error}");
    Ok(())
}

#[tokio::test]
async fn read_until_close() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, _server) = listen(|_, mut stream| async move {
        read_heads(&mut stream, 1).await.unwrap();
        stream
            .write_all(b"HTTP/1.0 200 OK\r\n\r\nuntil the very end")
            .await
            .unwrap();
        false
    })
    .await;

    let client = Client::new();
    let response = client
        .process(ContextId::new(), Request::get(uri(addr, "/")))
        .await?;
    assert_eq!(response.body(), &Bytes::from_static(b"until the very end"));
    assert_eq!(client.idle_count(), 0);
    Ok(())
}

#[tokio::test]
async fn dropped_get_is_retried() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, server) = listen(|accepted, mut stream| async move {
        read_heads(&mut stream, 1).await.unwrap();
        if accepted == 1 {
            return false;
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        true
    })
    .await;

    let client = quick_retries();
    let response = client
        .process(ContextId::new(), Request::get(uri(addr, "/")))
        .await?;
    assert_eq!(response.body(), &Bytes::from_static(b"ok"));
    assert_eq!(server.await?, 2);
    Ok(())
}

#[tokio::test]
async fn half_sent_post_is_not_retried() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (addr, server) = listen(|_, mut stream| async move {
        let received = read_heads(&mut stream, 1).await.unwrap();
        if !received.windows(10).any(|w| w == b"first half") {
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        }
        drop(stream);
        true
    })
    .await;

    let client = quick_retries();
    let ctx = ContextId::new();
    let (sender, body) = Body::channel();
    let response = client
        .submit(ctx, Request::post(uri(addr, "/upload"), body), None)
        .await?;
    sender.send("first half")?;

    while client.pump(ctx, Some(Duration::from_secs(5))).await {}
    let error = response.await.unwrap_err();
    assert!(error.is_connection(), "unexpected error: {error}");
    assert_eq!(server.await?, 1);
    drop(sender);
    Ok(())
}

#[tokio::test]
async fn https_is_never_downgraded() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let client = Client::new();
    let ctx = ContextId::new();
    let response = client
        .submit(
            ctx,
            Request::get(format!("https://{addr}/secret").parse()?),
            None,
        )
        .await?;
    while client.pump(ctx, Some(Duration::from_secs(5))).await {}

    let error = response.await.unwrap_err();
    assert!(error.is_connection(), "unexpected error: {error}");

    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err(), "a plain text connection was opened");
    Ok(())
}
