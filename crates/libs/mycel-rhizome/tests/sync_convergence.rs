//! End-to-end reconciliation over real sockets: two nodes with disjoint
//! stores converge, bundle imports survive arbitrary TCP segmentation, and
//! the bare-file API builds valid bundles.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use mycel_identity as identity;
use mycel_rhizome::http::{post_bundle, sync_with_peer, RhizomeHttpServer};
use mycel_rhizome::manifest::SERVICE_FILE;
use mycel_rhizome::store::PRIORITY_DEFAULT;
use mycel_rhizome::{Manifest, RhizomeConfig, RhizomeStore};
use rand_core::OsRng;

fn bundle(payload: &[u8], version: u64) -> Manifest {
    let mut manifest = Manifest::new();
    manifest.set("service", SERVICE_FILE);
    manifest.set("name", "blob");
    manifest.set_u64("date", 1_700_000_000_000);
    manifest.set_u64("version", version);
    manifest.set_u64("filesize", payload.len() as u64);
    if !payload.is_empty() {
        manifest.set("filehash", identity::sha512_hex(payload));
    }
    manifest.create_id(OsRng, None);
    manifest.sign().expect("sign");
    manifest
}

async fn spawn_server(
    store: Arc<Mutex<RhizomeStore>>,
    config: RhizomeConfig,
) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = RhizomeHttpServer::new(store, config, None, std::env::temp_dir());
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(listener, cancel.clone()));
    (addr, cancel)
}

fn bundle_set(store: &Arc<Mutex<RhizomeStore>>) -> BTreeSet<(String, u64, Option<String>)> {
    store
        .lock()
        .expect("lock")
        .list_bundles()
        .expect("list")
        .into_iter()
        .collect()
}

#[tokio::test]
async fn disjoint_stores_converge_within_bounded_rounds() {
    let store_a = Arc::new(Mutex::new(RhizomeStore::in_memory(50 << 20).expect("store")));
    let store_b = Arc::new(Mutex::new(RhizomeStore::in_memory(50 << 20).expect("store")));
    for i in 0u64..10 {
        let payload = format!("bundle a{i}").into_bytes();
        let manifest = bundle(&payload, 1 + i);
        store_a
            .lock()
            .expect("lock")
            .add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT)
            .expect("add");
        let payload = format!("bundle b{i} with a different size").into_bytes();
        let manifest = bundle(&payload, 100 + i);
        store_b
            .lock()
            .expect("lock")
            .add_bundle(&manifest, Some(&payload), PRIORITY_DEFAULT)
            .expect("add");
    }

    let (addr_b, cancel_b) = spawn_server(store_b.clone(), RhizomeConfig::default()).await;
    sync_with_peer(addr_b, &store_a, 10).await.expect("converges");

    assert_eq!(bundle_set(&store_a).len(), 20);
    assert_eq!(bundle_set(&store_a), bundle_set(&store_b));
    cancel_b.cancel();
}

#[tokio::test]
async fn import_survives_segmented_multipart_bodies() {
    let store = Arc::new(Mutex::new(RhizomeStore::in_memory(50 << 20).expect("store")));
    let (addr, cancel) = spawn_server(store.clone(), RhizomeConfig::default()).await;

    // a payload bigger than any single socket read, stuffed with CRLFs so
    // boundary-shaped bytes land on read edges
    let mut payload = Vec::new();
    while payload.len() < 40_000 {
        payload.extend_from_slice(b"chunk of data\r\n--not-the-boundary\r\n\x00\xFF");
    }
    let manifest = bundle(&payload, 7);

    let status = post_bundle(addr, &manifest.to_bytes(), &payload).await.expect("post");
    assert_eq!(status, 201);
    let stored = store
        .lock()
        .expect("lock")
        .payload(manifest.filehash().expect("hash"))
        .expect("query")
        .expect("blob");
    assert_eq!(stored, payload);

    // replaying the same bundle reports "already have"
    let status = post_bundle(addr, &manifest.to_bytes(), &payload).await.expect("post");
    assert_eq!(status, 204);
    cancel.cancel();
}

#[tokio::test]
async fn tampered_bundles_are_refused_with_403() {
    let store = Arc::new(Mutex::new(RhizomeStore::in_memory(50 << 20).expect("store")));
    let (addr, cancel) = spawn_server(store.clone(), RhizomeConfig::default()).await;

    let manifest = bundle(b"honest payload", 1);
    let status = post_bundle(addr, &manifest.to_bytes(), b"tampered payload")
        .await
        .expect("post");
    assert_eq!(status, 403);
    assert!(bundle_set(&store).is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn bare_file_api_builds_a_bundle_for_loopback_clients() {
    let store = Arc::new(Mutex::new(RhizomeStore::in_memory(50 << 20).expect("store")));
    let config = RhizomeConfig {
        addfile_uri: Some("/rhizome/secretaddfile".to_string()),
        ..RhizomeConfig::default()
    };
    let (addr, cancel) = spawn_server(store.clone(), config).await;

    let boundary = "----bare-file-test";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"data\"; filename=\"notes.txt\"\r\n\
          Content-Type: application/octet-stream\r\n\r\n",
    );
    body.extend_from_slice(b"file body");
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let request = format!(
        "POST /rhizome/secretaddfile HTTP/1.0\r\n\
         Content-Length: {}\r\n\
         Content-Type: multipart/form-data; boundary={boundary}\r\n\r\n",
        body.len()
    );

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request.as_bytes()).await.expect("head");
    stream.write_all(&body).await.expect("body");
    stream.shutdown().await.ok();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("response");
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.0 200"), "got: {text}");

    // the response body is the manifest that was created
    let body_start = text.find("\r\n\r\n").expect("header end") + 4;
    let created = Manifest::parse(&response[body_start..]).expect("manifest");
    assert_eq!(created.get("name"), Some("notes.txt"));
    assert_eq!(created.get("service"), Some(SERVICE_FILE));
    created.verify().expect("self signed");

    let bundles = bundle_set(&store);
    assert_eq!(bundles.len(), 1);
    cancel.cancel();
}
