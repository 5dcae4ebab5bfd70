mod common;

use std::io::Cursor;
use std::sync::Arc;

use common::{client_tls, origin, scratch_dir, text, tls_origin, wait_for_requests};
use snare::{
  Certificate, GeneratedAuthority, MemoryRepo, Method, ProxyServer, Recorder, Repo, Response,
  StatusCode, CONNECTION_ESTABLISHED,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[tokio::test]
async fn plain_request_is_forwarded_and_recorded() {
  let origin = origin(|request| {
    if request.uri().path() == "/items" {
      text(201, "created")
    } else {
      text(404, "missing")
    }
  })
  .await;
  let repo = Arc::new(MemoryRepo::new());
  let ca = GeneratedAuthority::new(scratch_dir("plain")).await.unwrap();
  let proxy = ProxyServer::builder()
    .authority(Arc::new(ca))
    .recorder(Recorder::new(repo.clone()))
    .bind("127.0.0.1:0")
    .await
    .unwrap()
    .start();

  let port = origin.port();
  let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
  let request = format!(
    "POST http://127.0.0.1:{port}/items?kind=book HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nProxy-Connection: keep-alive\r\nCookie: sid=42\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 11\r\n\r\ntitle=dune+"
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  client.read_to_end(&mut raw).await.unwrap();
  let response = Response::read_from(&mut BufReader::new(Cursor::new(raw)), &Method::POST)
    .await
    .unwrap();
  assert_eq!(response.status_code(), StatusCode::CREATED);
  assert_eq!(response.text(), "created");

  let seen = origin.seen();
  assert_eq!(seen.len(), 1);
  assert!(seen[0].headers().get("proxy-connection").is_none());
  assert_eq!(seen[0].headers()["cookie"], "sid=42");
  assert_eq!(seen[0].body().unwrap().to_text(), "title=dune+");

  let records = wait_for_requests(repo.as_ref(), 1).await;
  let record = &records[0];
  assert_eq!(record.method, "POST");
  assert_eq!(record.url(), format!("http://127.0.0.1:{port}/items"));
  assert_eq!(record.get_params[0].value, "book");
  assert_eq!(record.post_params[0].value, "dune ");
  assert_eq!(record.cookies[0].name, "sid");
  let stored = repo.response_for_request(record.id).await.unwrap().unwrap();
  assert_eq!(stored.code, 201);
  assert_eq!(stored.content_length, Some(7));
  assert_eq!(stored.body, "created");
  proxy.shutdown().await;
}

#[tokio::test]
async fn connect_tunnel_is_intercepted() {
  let (origin, origin_root) = tls_origin(|request| {
    text(200, &format!("hello {}", request.uri().query().unwrap_or_default()))
  })
  .await;
  let repo = Arc::new(MemoryRepo::new());
  let ca = GeneratedAuthority::new(scratch_dir("mitm")).await.unwrap();
  let proxy_root = ca.ca_cert_pem().to_string();
  let origin_root = Certificate::from_pem_bundle(origin_root.as_bytes())
    .unwrap()
    .remove(0);
  let proxy = ProxyServer::builder()
    .authority(Arc::new(ca))
    .configure_client(move |builder| builder.add_root_certificate(origin_root))
    .recorder(Recorder::new(repo.clone()))
    .bind("127.0.0.1:0")
    .await
    .unwrap()
    .start();

  let port = origin.port();
  let mut tcp = TcpStream::connect(proxy.local_addr()).await.unwrap();
  tcp
    .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
  tcp.read_exact(&mut established).await.unwrap();
  assert_eq!(established, CONNECTION_ESTABLISHED);

  let connector = TlsConnector::from(client_tls(&proxy_root));
  let mut tls = connector
    .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
    .await
    .unwrap();
  tls
    .write_all(format!("GET /greet?name=snare HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let response = Response::read_from(&mut BufReader::new(tls), &Method::GET)
    .await
    .unwrap();
  assert_eq!(response.status_code(), StatusCode::OK);
  assert_eq!(response.text(), "hello name=snare");
  assert_eq!(origin.hits(), 1);

  let records = wait_for_requests(repo.as_ref(), 1).await;
  assert_eq!(records[0].scheme, "https");
  assert_eq!(records[0].host, format!("127.0.0.1:{port}"));
  assert_eq!(records[0].path, "/greet");
  let stored = repo
    .response_for_request(records[0].id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(stored.body, "hello name=snare");
  proxy.shutdown().await;
}

#[tokio::test]
async fn untrusted_origin_closes_the_tunnel() {
  let (origin, _) = tls_origin(|_| text(200, "unreachable")).await;
  let ca = GeneratedAuthority::new(scratch_dir("untrusted")).await.unwrap();
  let proxy_root = ca.ca_cert_pem().to_string();
  let proxy = ProxyServer::builder()
    .authority(Arc::new(ca))
    .bind("127.0.0.1:0")
    .await
    .unwrap()
    .start();

  let port = origin.port();
  let mut tcp = TcpStream::connect(proxy.local_addr()).await.unwrap();
  tcp
    .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
  tcp.read_exact(&mut established).await.unwrap();
  let connector = TlsConnector::from(client_tls(&proxy_root));
  let mut tls = connector
    .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
    .await
    .unwrap();
  let _ = tls
    .write_all(format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
    .await;
  let mut rest = Vec::new();
  let _ = tls.read_to_end(&mut rest).await;
  assert!(rest.is_empty());
  assert_eq!(origin.hits(), 0);
  proxy.shutdown().await;
}
