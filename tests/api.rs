//! The HTTP API end to end: a local port layer on an ephemeral port, driven
//! with reqwest.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use vch_portlayer::api::{self, PortLayer};
use vch_portlayer::config::PortLayerConfig;
use vch_portlayer::paths::PortLayerPaths;

struct Server {
    base: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
    _stop: oneshot::Sender<()>,
}

impl Server {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = PortLayerPaths {
            config: dir.path().join("config"),
            data: dir.path().join("data"),
            logs: dir.path().join("data/logs"),
        };
        let mut cfg = PortLayerConfig::default();
        cfg.storage.scratch_size_kb = 1024;

        let state = PortLayer::local(&cfg, &paths).await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(api::serve(listener, Arc::new(state), async move {
            let _ = stopped.await;
        }));

        Self {
            base,
            client: reqwest::Client::new(),
            _dir: dir,
            _stop: stop,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).unwrap();
    }
    builder.into_inner().unwrap()
}

#[tokio::test]
async fn image_store_lifecycle() {
    let srv = Server::start().await;
    let c = &srv.client;

    let resp = c.post(srv.url("/storage")).json(&json!({"name": "s"})).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert!(body["url"].as_str().unwrap().ends_with("/storage/s"));

    let again = c.post(srv.url("/storage")).json(&json!({"name": "s"})).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let scratch: Value = c
        .get(srv.url("/storage/s/info/scratch"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(scratch["parent"].is_null());

    let resp = c
        .put(srv.url("/storage/s/scratch/layer-1?metadatakey=author&metadataval=me"))
        .body(layer(&[("etc/motd", b"hi\n".as_slice())]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let image: Value = resp.json().await.unwrap();
    assert_eq!(image["parent"], "scratch");
    assert_eq!(image["metadata"]["author"], "me");

    let listed: Vec<Value> = c
        .get(srv.url("/storage/s?ids=layer-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "layer-1");

    let stores: Vec<String> = c.get(srv.url("/storage")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stores.len(), 1);

    let missing = c.get(srv.url("/storage/s/info/nope")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let err: Value = missing.json().await.unwrap();
    assert_eq!(err["code"], 404);
}

#[tokio::test]
async fn bad_digest_is_rejected() {
    let srv = Server::start().await;
    let c = &srv.client;
    c.post(srv.url("/storage")).json(&json!({"name": "s"})).send().await.unwrap();

    let wrong = format!("sha256:{}", "0".repeat(64));
    let resp = c
        .put(srv.url(&format!("/storage/s/scratch/bad?sum={wrong}")))
        .body(layer(&[("a", b"a".as_slice())]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let gone = c.get(srv.url("/storage/s/info/bad")).send().await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn container_runs_through_a_handle() {
    let srv = Server::start().await;
    let c = &srv.client;

    let resp = c
        .post(srv.url("/containers"))
        .json(&json!({"name": "web", "path": "/bin/sleep", "args": ["60"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_owned();
    let handle = created["handle"].as_str().unwrap().to_owned();

    let ids: Vec<String> = c.get(srv.url("/containers")).send().await.unwrap().json().await.unwrap();
    assert_eq!(ids, vec![id.clone()]);

    let resp = c
        .put(srv.url(&format!("/handles/{handle}/state")))
        .json(&json!({"state": "RUNNING"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = c.post(srv.url(&format!("/handles/{handle}/commit"))).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let state: Value = c
        .get(srv.url(&format!("/containers/{id}/state")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state["state"], "RUNNING");

    // a committed handle is spent
    let spent = c.post(srv.url(&format!("/handles/{handle}/commit"))).send().await.unwrap();
    assert_eq!(spent.status(), StatusCode::NOT_FOUND);

    let fresh: Value = c
        .get(srv.url(&format!("/containers/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(fresh["handle"].as_str().unwrap(), handle);
}

#[tokio::test]
async fn unknown_state_and_missing_container() {
    let srv = Server::start().await;
    let c = &srv.client;

    let missing = c.get(srv.url("/containers/deadbeef")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let created: Value = c
        .post(srv.url("/containers"))
        .json(&json!({"path": "/bin/true"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let handle = created["handle"].as_str().unwrap();
    let resp = c
        .put(srv.url(&format!("/handles/{handle}/state")))
        .json(&json!({"state": "PAUSED"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn handles_reserve_bridge_endpoints() {
    let srv = Server::start().await;
    let c = &srv.client;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let created: Value = c
            .post(srv.url("/containers"))
            .json(&json!({"path": "/bin/true"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        handles.push(created["handle"].as_str().unwrap().to_owned());
    }

    let resp = c
        .put(srv.url(&format!("/handles/{}/endpoints", handles[0])))
        .json(&json!({"scope": "bridge"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let added: Value = resp.json().await.unwrap();
    assert_eq!(added["endpoint"]["ip"], "172.16.0.2");
    assert_eq!(added["endpoint"]["gateway"], "172.16.0.1");

    let taken = c
        .put(srv.url(&format!("/handles/{}/endpoints", handles[1])))
        .json(&json!({"scope": "bridge", "ip": "172.16.0.2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(taken.status(), StatusCode::CONFLICT);

    let unknown = c
        .put(srv.url(&format!("/handles/{}/endpoints", handles[1])))
        .json(&json!({"scope": "external"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let resp = c.post(srv.url(&format!("/handles/{}/commit", handles[0]))).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}
