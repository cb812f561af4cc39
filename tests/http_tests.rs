use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use quillhub::config::ServerConfig;
use quillhub::events::NEW_POST;
use quillhub::relay::{HostResponse, ImageHost, RelayError};
use quillhub::server::{router, AppState};

struct OkHost(AtomicUsize);

#[async_trait]
impl ImageHost for OkHost {
    async fn upload(&self, payload: Vec<u8>, filename: &str, _mime_type: &str) -> Result<HostResponse, RelayError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "success": true, "data": { "filename": filename, "size": payload.len() } });
        Ok(HostResponse { status: 200, body: body.to_string() })
    }
}

struct Server {
    base: String,
    addr: std::net::SocketAddr,
    state: AppState,
    host: Arc<OkHost>,
    _tmp: tempfile::TempDir,
}

async fn start_server() -> anyhow::Result<Server> {
    let tmp = tempfile::tempdir()?;
    let config = ServerConfig { upload_dir: tmp.path().to_path_buf(), ..Default::default() };
    let host = Arc::new(OkHost(AtomicUsize::new(0)));
    let state = AppState::with_host(&config, host.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await { eprintln!("server task error: {e:?}"); }
    });
    Ok(Server { base: format!("http://{}", addr), addr, state, host, _tmp: tmp })
}

async fn sign_up(client: &reqwest::Client, base: &str, name: &str) -> anyhow::Result<String> {
    let resp: Value = client
        .post(format!("{base}/sign-up"))
        .json(&json!({ "name": name, "email": format!("{name}@example.com"), "password": "pw" }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(resp["token"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn auth_flow_over_http() -> anyhow::Result<()> {
    let srv = start_server().await?;
    let client = reqwest::Client::new();
    assert_eq!(client.get(&srv.base).send().await?.text().await?, "quillhub ok");

    let resp = client.get(format!("{}/me", srv.base)).send().await?;
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], "unauthenticated");

    let token = sign_up(&client, &srv.base, "ann").await?;
    let me: Value = client.get(format!("{}/me", srv.base)).bearer_auth(&token).send().await?.json().await?;
    assert_eq!(me["name"], "ann");
    assert!(me.get("passwordHash").is_none());

    let avail: Value = client.get(format!("{}/email?email=ann@example.com", srv.base)).send().await?.json().await?;
    assert_eq!(avail["available"], false);

    let dup = client
        .post(format!("{}/sign-up", srv.base))
        .json(&json!({ "name": "ann", "email": "x@example.com", "password": "pw" }))
        .send()
        .await?;
    assert_eq!(dup.status(), 409);

    let invite = client
        .post(format!("{}/invites", srv.base))
        .bearer_auth(&token)
        .json(&json!({ "email": "f@example.com", "role": "MEMBER" }))
        .send()
        .await?;
    assert_eq!(invite.status(), 403);

    let out = client.post(format!("{}/sign-out", srv.base)).bearer_auth(&token).send().await?;
    assert_eq!(out.status(), 200);
    let resp = client.get(format!("{}/me", srv.base)).bearer_auth(&token).send().await?;
    assert_eq!(resp.status(), 401);
    Ok(())
}

#[tokio::test]
async fn image_upload_is_relayed() -> anyhow::Result<()> {
    let srv = start_server().await?;
    let client = reqwest::Client::new();
    let form = || {
        let part = reqwest::multipart::Part::bytes(b"fake image".to_vec()).file_name("cat.png").mime_str("image/png");
        part.map(|p| reqwest::multipart::Form::new().part("file", p))
    };

    let resp = client.post(format!("{}/images", srv.base)).multipart(form()?).send().await?;
    assert_eq!(resp.status(), 401);
    assert_eq!(srv.host.0.load(Ordering::SeqCst), 0);

    let token = sign_up(&client, &srv.base, "ann").await?;
    let resp = client.post(format!("{}/images", srv.base)).bearer_auth(&token).multipart(form()?).send().await?;
    assert_eq!(resp.status(), 200);
    let out: Value = resp.json().await?;
    assert_eq!(out["status"], "success");
    assert_eq!(out["message"], "success");
    let res: Value = serde_json::from_str(out["res"].as_str().unwrap_or("{}"))?;
    assert_eq!(res["data"]["filename"], "cat.png");
    assert_eq!(res["data"]["size"], 10);
    assert_eq!(srv.host.0.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_dir(srv._tmp.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn uploads_above_default_body_limit_are_relayed() -> anyhow::Result<()> {
    let srv = start_server().await?;
    let client = reqwest::Client::new();
    let token = sign_up(&client, &srv.base, "ann").await?;
    // 3 MiB: above axum's 2 MiB default, below the 5 MiB upload cap
    let size = 3 * 1024 * 1024;
    let part = reqwest::multipart::Part::bytes(vec![7u8; size]).file_name("big.png").mime_str("image/png")?;
    let resp = client
        .post(format!("{}/images", srv.base))
        .bearer_auth(&token)
        .multipart(reqwest::multipart::Form::new().part("file", part))
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let out: Value = resp.json().await?;
    assert_eq!(out["status"], "success", "relay outcome: {out}");
    let res: Value = serde_json::from_str(out["res"].as_str().unwrap_or("{}"))?;
    assert_eq!(res["data"]["size"], size);
    assert_eq!(srv.host.0.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_dir(srv._tmp.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn uploads_over_the_cap_never_reach_the_host() -> anyhow::Result<()> {
    let srv = start_server().await?;
    let client = reqwest::Client::new();
    let token = sign_up(&client, &srv.base, "ann").await?;
    let part = reqwest::multipart::Part::bytes(vec![7u8; 6 * 1024 * 1024]).file_name("huge.png").mime_str("image/png")?;
    let resp = client
        .post(format!("{}/images", srv.base))
        .bearer_auth(&token)
        .multipart(reqwest::multipart::Form::new().part("file", part))
        .send()
        .await;
    // the server may answer with a failure outcome or cut the connection
    if let Ok(resp) = resp {
        if resp.status() == 200 {
            let out: Value = resp.json().await?;
            assert_eq!(out["status"], "failure");
        }
    }
    assert_eq!(srv.host.0.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn websocket_receives_new_posts() -> anyhow::Result<()> {
    let srv = start_server().await?;
    let client = reqwest::Client::new();
    let token = sign_up(&client, &srv.base, "ann").await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", srv.addr)).await?;
    let bus = srv.state.dispatcher.bus().clone();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while bus.subscriber_count(NEW_POST) == 0 {
        anyhow::ensure!(std::time::Instant::now() < deadline, "subscriber never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let created = client
        .post(format!("{}/posts", srv.base))
        .bearer_auth(&token)
        .json(&json!({ "title": "live", "content": "hi", "category": "tech" }))
        .send()
        .await?;
    assert_eq!(created.status(), 201);

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next()).await?.expect("frame")?;
    let text = match frame {
        Message::Text(t) => t,
        other => anyhow::bail!("expected text frame, got {other:?}"),
    };
    let ev: Value = serde_json::from_str(&text)?;
    assert_eq!(ev["topic"], NEW_POST);
    assert_eq!(ev["payload"]["newPost"]["title"], "live");
    assert_eq!(ev["payload"]["newPost"]["category"]["value"], "tech");

    ws.close(None).await?;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while bus.subscriber_count(NEW_POST) != 0 {
        anyhow::ensure!(std::time::Instant::now() < deadline, "subscriber not released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
