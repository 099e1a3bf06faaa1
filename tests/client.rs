//! End-to-end tests against real sockets.
//!
//! Each test spins up a minimal TCP handler that speaks just enough
//! HTTP/1.1 for the scenario under test, in the spirit of a dummy server:
//! the handlers assert on raw wire bytes, not on any HTTP library's idea
//! of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use filament::{Body, Client, Proxy, Retry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

async fn spawn_server<F, Fut>(per_conn: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(TcpStream, usize) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let n = seen.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(per_conn(stream, n));
        }
    });
    (addr, count)
}

async fn read_until(stream: &mut TcpStream, pattern: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut block = [0u8; 4096];
    loop {
        let n = stream.read(&mut block).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&block[..n]);
        if buf.windows(pattern.len()).any(|window| window == pattern) {
            break;
        }
    }
    buf
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    read_until(stream, b"\r\n\r\n").await
}

fn client() -> Client {
    Client::builder().build().unwrap()
}

#[tokio::test]
async fn get_reuses_connection() {
    let _ = pretty_env_logger::try_init();
    let (addr, conns) = spawn_server(|mut stream, _n| async move {
        loop {
            let head = read_head(&mut stream).await;
            if head.is_empty() {
                return;
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
        }
    })
    .await;

    let client = client();
    for _ in 0..2 {
        let resp = client
            .get(&format!("http://{}/", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    assert_eq!(conns.load(Ordering::SeqCst), 1, "second request reuses the socket");
}

#[tokio::test]
async fn chunked_body_wire_format_skips_empty_chunks() {
    let _ = pretty_env_logger::try_init();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (addr, _conns) = spawn_server(move |mut stream, _n| {
        let tx = tx.clone();
        async move {
            let wire = read_until(&mut stream, b"\r\n0\r\n\r\n").await;
            tx.send(wire).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        }
    })
    .await;

    let chunks = vec![
        Bytes::from_static(b"foo"),
        Bytes::from_static(b"bar"),
        Bytes::from_static(b""),
        Bytes::from_static(b"bazzzzzzzzzzzzzzzzzzzzzz"),
    ];
    let resp = client()
        .get(&format!("http://{}/", addr))
        .body(Body::chunks(chunks))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let wire = rx.recv().await.unwrap();
    let head_end = wire
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("request head is terminated");
    let head = &wire[..head_end + 4];
    let body = &wire[head_end + 4..];

    assert!(String::from_utf8_lossy(head).contains("transfer-encoding: chunked"));
    assert_eq!(
        body,
        b"3\r\nfoo\r\n3\r\nbar\r\n18\r\nbazzzzzzzzzzzzzzzzzzzzzz\r\n0\r\n\r\n".as_slice(),
    );
    // the only zero-size line is the terminator
    assert_eq!(
        String::from_utf8_lossy(body).matches("0\r\n").count(),
        1,
    );
}

#[tokio::test]
async fn text_body_is_rejected_before_any_wire_activity() {
    // no server: if the client tried to connect, this would surface as a
    // connect error instead of the body error
    let err = client()
        .post("http://127.0.0.1:9/")
        .body("thisshouldbeonechunk\r\näöüß")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_invalid_body());
}

#[tokio::test]
async fn redirect_strips_authorization_cross_origin() {
    let _ = pretty_env_logger::try_init();

    // target origin: echoes the received request head as the body
    let (target_addr, _t) = spawn_server(|mut stream, _n| async move {
        let head = read_head(&mut stream).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
            head.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.write_all(&head).await.unwrap();
    })
    .await;

    // initial origin: 303 over to the target
    let (addr, _a) = spawn_server(move |mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        let response = format!(
            "HTTP/1.1 303 See Other\r\nlocation: http://{}/headers\r\ncontent-length: 0\r\n\r\n",
            target_addr
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    })
    .await;

    let resp = client()
        .get(&format!("http://{}/redirect", addr))
        .header("authorization", "Basic c2VjcmV0")
        .header("x-keep-me", "yes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.url().as_str(), format!("http://{}/headers", target_addr));

    let echoed = String::from_utf8(resp.bytes().await.unwrap().to_vec())
        .unwrap()
        .to_ascii_lowercase();
    assert!(echoed.contains("x-keep-me"), "unrelated headers survive");
    assert!(
        !echoed.contains("authorization"),
        "no Authorization variant crosses origins: {}",
        echoed
    );
}

#[tokio::test]
async fn relative_redirect_same_connection() {
    let _ = pretty_env_logger::try_init();
    let (addr, conns) = spawn_server(|mut stream, _n| async move {
        loop {
            let head = read_head(&mut stream).await;
            if head.is_empty() {
                return;
            }
            let line = String::from_utf8_lossy(&head).to_string();
            let response: &[u8] = if line.starts_with("GET /start") {
                b"HTTP/1.1 303 See Other\r\nlocation: /dest\r\ncontent-length: 0\r\n\r\n"
            } else {
                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"
            };
            stream.write_all(response).await.unwrap();
        }
    })
    .await;

    let resp = client()
        .get(&format!("http://{}/start", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.url().path(), "/dest");
    assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"ok"));
    assert_eq!(
        conns.load(Ordering::SeqCst),
        1,
        "same-origin redirect reuses the drained connection"
    );
}

#[tokio::test]
async fn retry_after_paces_retries() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, n| async move {
        let _ = read_head(&mut stream).await;
        let response: &[u8] = if n < 2 {
            b"HTTP/1.1 429 Too Many Requests\r\nretry-after: 1\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        } else {
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"
        };
        stream.write_all(response).await.unwrap();
    })
    .await;

    let client = Client::builder()
        .retry(Retry::new(5).status_forcelist([429]))
        .build()
        .unwrap();

    let started = Instant::now();
    let resp = client
        .get(&format!("http://{}/limited", addr))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(resp.status().as_u16(), 200);
    assert!(
        elapsed >= Duration::from_secs(2),
        "two Retry-After: 1 responses must cost at least two seconds, took {:?}",
        elapsed
    );
}

struct UnseekableBody {
    data: std::io::Cursor<Vec<u8>>,
}

impl std::io::Read for UnseekableBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.data, buf)
    }
}

impl std::io::Seek for UnseekableBody {
    fn seek(&mut self, _: std::io::SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "this body cannot seek",
        ))
    }
}

#[tokio::test]
async fn unrewindable_body_fails_307_redirect() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, _n| async move {
        // chunked request body: read through the terminator
        let _ = read_until(&mut stream, b"\r\n0\r\n\r\n").await;
        stream
            .write_all(
                b"HTTP/1.1 307 Temporary Redirect\r\nlocation: /moved\r\ncontent-length: 0\r\n\r\n",
            )
            .await
            .unwrap();
    })
    .await;

    let body = Body::reader(UnseekableBody {
        data: std::io::Cursor::new(b"important payload".to_vec()),
    });
    let err = client()
        .put(&format!("http://{}/upload", addr))
        .body(body)
        .send()
        .await
        .unwrap_err();
    assert!(err.is_unrewindable_body(), "got: {:?}", err);
}

#[tokio::test]
async fn tunnel_refusal_attaches_response() {
    let _ = pretty_env_logger::try_init();
    let (proxy_addr, _conns) = spawn_server(|mut stream, _n| async move {
        let head = read_head(&mut stream).await;
        assert!(head.starts_with(b"CONNECT "));
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let client = Client::builder()
        .proxy(Proxy::new(&format!("http://{}", proxy_addr)).unwrap())
        .build()
        .unwrap();

    let err = client
        .get("http://origin.example/")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_failed_tunnel());
    let attached = err.tunnel_response().expect("tunnel response is attached");
    assert_eq!(attached.status.as_u16(), 403);
}

#[tokio::test]
async fn early_response_poisons_connection() {
    let _ = pretty_env_logger::try_init();
    let (addr, conns) = spawn_server(|mut stream, n| async move {
        if n == 0 {
            // read a little of the upload, then refuse it outright
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 413 Payload Too Large\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            // leave the socket open long enough for the client to read
            // the response, but never consume the rest of the upload
            tokio::time::sleep(Duration::from_millis(500)).await;
        } else {
            let _ = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        }
    })
    .await;

    let client = client();

    // a large chunked upload the server will cut short
    let chunks: Vec<Bytes> = (0..8192).map(|_| Bytes::from(vec![b'x'; 8192])).collect();
    let resp = client
        .post(&format!("http://{}/upload", addr))
        .body(Body::chunks(chunks))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413, "early response is surfaced");
    drop(resp);

    let resp = client
        .get(&format!("http://{}/after", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    assert_eq!(
        conns.load(Ordering::SeqCst),
        2,
        "the aborted-send connection must not be reused"
    );
}

#[tokio::test]
async fn blocked_pool_checkout_times_out() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        // announce a large body but only deliver a sliver, holding the
        // connection (and its pool slot) open
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000000\r\n\r\npartial")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
    .await;

    let client = Client::builder()
        .pool_max_connections(1)
        .pool_block(true)
        .pool_checkout_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let held = client
        .get(&format!("http://{}/big", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(held.status().as_u16(), 200);

    let err = client
        .get(&format!("http://{}/second", addr))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_pool_empty(), "got: {:?}", err);
    drop(held);
}

#[tokio::test]
async fn total_timeout_bounds_slow_servers() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
    })
    .await;

    let client = Client::builder()
        .total_timeout(Duration::from_millis(200))
        .retry(Retry::none())
        .build()
        .unwrap();

    let started = Instant::now();
    let err = client
        .get(&format!("http://{}/slow", addr))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_read_timeout(), "got: {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn read_timeout_exhausts_the_retry_budget() {
    let _ = pretty_env_logger::try_init();
    let (addr, conns) = spawn_server(|mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        // never answer
        tokio::time::sleep(Duration::from_secs(30)).await;
    })
    .await;

    let client = Client::builder()
        .read_timeout(Duration::from_millis(50))
        .retry(Retry::new(2))
        .build()
        .unwrap();

    let err = client
        .get(&format!("http://{}/silent", addr))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_max_retry(), "got: {:?}", err);
    let cause = err
        .into_cause()
        .and_then(|cause| cause.downcast::<filament::Error>().ok())
        .expect("max-retry wraps the last error");
    assert!(cause.is_read_timeout());
    // initial attempt plus two retries
    assert_eq!(conns.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bad_http_version_is_terminal() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/2.0 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let err = client()
        .get(&format!("http://{}/", addr))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_bad_version(), "got: {:?}", err);
}

#[tokio::test]
async fn streaming_body_chunks_arrive_lazily() {
    let _ = pretty_env_logger::try_init();
    let (addr, _conns) = spawn_server(|mut stream, _n| async move {
        let _ = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        stream.write_all(b"5\r\nfirst\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(b"6\r\nsecond\r\n0\r\n\r\n").await.unwrap();
    })
    .await;

    let mut resp = client()
        .get(&format!("http://{}/stream", addr))
        .send()
        .await
        .unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        collected.push(chunk);
    }
    let joined: Vec<u8> = collected.concat();
    assert_eq!(joined, b"firstsecond");
    assert!(collected.len() >= 2, "body arrives in multiple chunks");
}
