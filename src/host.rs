//! The host runtime: every name the `funee:` namespace serves, implemented
//! as one deno_core extension plus a JS prologue that adapts the raw ops to
//! the binding shapes user programs import (`log`, `readFile`, `serve`,
//! timers, `fetch`, watchers, and the `Closure` / `CanonicalName`
//! constructors emitted macro output relies on).

use bytes::Bytes;
use deno_core::error::AnyError;
use deno_core::{op2, FastString, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use deno_error::JsErrorBox;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};

/// The JS prologue prepended to every emitted bundle.
pub const HOST_PROLOGUE: &str = include_str!("host/prologue.js");

/// Every name user code may import from the host namespace.
pub const HOST_BINDINGS: &[&str] = &[
    "log",
    "readFile",
    "writeFile",
    "isFile",
    "lstat",
    "readdir",
    "join",
    "tmpdir",
    "randomBytes",
    "httpFetch",
    "httpRequest",
    "httpGetJSON",
    "httpPostJSON",
    "getBody",
    "serve",
    "spawn",
    "kill",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "fetch",
    "Response",
    "Headers",
    "URL",
    "watchFile",
    "watchDirectory",
    "Closure",
    "CanonicalName",
];

pub fn host_binding_names() -> HashSet<String> {
    HOST_BINDINGS.iter().map(|s| s.to_string()).collect()
}

/// Run an emitted bundle to completion on a single-threaded event loop.
pub fn run_bundle(code: &str) -> Result<(), AnyError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut js = JsRuntime::new(RuntimeOptions {
            extensions: vec![funee_host::init()],
            ..Default::default()
        });
        js.execute_script("[funee:bundle]", FastString::from(code.to_string()))?;
        js.run_event_loop(PollEventLoopOptions::default()).await
    })
}

deno_core::extension!(
    funee_host,
    ops = [
        op_funee_log,
        op_funee_read_file,
        op_funee_write_file,
        op_funee_is_file,
        op_funee_lstat,
        op_funee_readdir,
        op_funee_join,
        op_funee_tmpdir,
        op_funee_random_bytes,
        op_funee_http_request,
        op_funee_sleep,
        op_funee_spawn,
        op_funee_kill,
        op_funee_serve_start,
        op_funee_serve_next,
        op_funee_serve_respond,
        op_funee_watch_start,
        op_funee_watch_next,
    ],
    state = |state| {
        state.put(SpawnedChildren::default());
    }
);

fn io_err(e: impl std::fmt::Display) -> JsErrorBox {
    JsErrorBox::generic(e.to_string())
}

#[op2(fast)]
fn op_funee_log(#[string] line: &str) {
    println!("{}", line);
}

#[op2]
#[string]
fn op_funee_read_file(#[string] path: &str) -> Result<String, JsErrorBox> {
    std::fs::read_to_string(path).map_err(io_err)
}

#[op2(fast)]
fn op_funee_write_file(#[string] path: &str, #[string] data: &str) -> Result<(), JsErrorBox> {
    std::fs::write(path, data).map_err(io_err)
}

#[op2(fast)]
fn op_funee_is_file(#[string] path: &str) -> bool {
    Path::new(path).is_file()
}

#[op2]
#[serde]
fn op_funee_lstat(#[string] path: &str) -> Result<Value, JsErrorBox> {
    let meta = std::fs::symlink_metadata(path).map_err(io_err)?;
    Ok(json!({
        "isFile": meta.is_file(),
        "isDirectory": meta.is_dir(),
        "isSymlink": meta.file_type().is_symlink(),
        "size": meta.len(),
    }))
}

#[op2]
#[serde]
fn op_funee_readdir(#[string] path: &str) -> Result<Vec<String>, JsErrorBox> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[op2]
#[string]
fn op_funee_join(#[serde] parts: Vec<String>) -> String {
    let mut path = PathBuf::new();
    for part in parts {
        path.push(part);
    }
    path.to_string_lossy().into_owned()
}

#[op2]
#[string]
fn op_funee_tmpdir() -> String {
    std::env::temp_dir().to_string_lossy().into_owned()
}

#[op2]
#[string]
fn op_funee_random_bytes(#[smi] len: u32) -> String {
    let mut buf = vec![0u8; len as usize];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestSpec {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

#[op2(async)]
#[serde]
async fn op_funee_http_request(#[serde] spec: HttpRequestSpec) -> Result<Value, JsErrorBox> {
    let method = spec.method.as_deref().unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| JsErrorBox::generic(format!("invalid method: {}", method)))?;
    let client = reqwest::Client::new();
    let mut request = client.request(method, &spec.url);
    for (name, value) in &spec.headers {
        request = request.header(name, value);
    }
    if let Some(body) = spec.body {
        request = request.body(body);
    }
    let response = request.send().await.map_err(io_err)?;
    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = response.text().await.map_err(io_err)?;
    Ok(json!({ "status": status, "headers": headers, "body": body }))
}

#[op2(async)]
async fn op_funee_sleep(#[number] ms: f64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms.max(0.0) as u64)).await;
}

/// Children spawned detached; terminated when the runtime goes away so a
/// watch-and-restart loop never leaks servers.
#[derive(Default)]
struct SpawnedChildren {
    pids: Vec<i32>,
}

impl Drop for SpawnedChildren {
    fn drop(&mut self) {
        #[cfg(unix)]
        for pid in self.pids.drain(..) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    detached: bool,
}

#[op2(async)]
#[serde]
async fn op_funee_spawn(
    state: Rc<RefCell<OpState>>,
    #[serde] spec: SpawnSpec,
) -> Result<Value, JsErrorBox> {
    let mut command = tokio::process::Command::new(&spec.command);
    command.args(&spec.args).envs(&spec.env);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    if spec.detached {
        let mut child = command.spawn().map_err(io_err)?;
        let pid = child.id().unwrap_or(0) as i32;
        state
            .borrow_mut()
            .borrow_mut::<SpawnedChildren>()
            .pids
            .push(pid);
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        return Ok(json!({ "pid": pid }));
    }

    let output = command.output().await.map_err(io_err)?;
    Ok(json!({
        "code": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}

#[op2(fast)]
fn op_funee_kill(state: &mut OpState, #[smi] pid: i32) -> Result<(), JsErrorBox> {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        )
        .map_err(io_err)?;
        state.borrow_mut::<SpawnedChildren>().pids.retain(|p| *p != pid);
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (state, pid);
        Err(JsErrorBox::generic("kill is only supported on unix"))
    }
}

struct IncomingRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: String,
    respond: oneshot::Sender<OutgoingResponse>,
}

struct OutgoingResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

/// Bridge between the hyper acceptor tasks and the JS serve loop: requests
/// queue on a channel, responses travel back over per-request oneshots.
struct HttpBridge {
    incoming: Mutex<mpsc::Receiver<IncomingRequest>>,
    pending: std::sync::Mutex<HashMap<u64, oneshot::Sender<OutgoingResponse>>>,
    next_id: AtomicU64,
}

impl deno_core::Resource for HttpBridge {
    fn name(&self) -> Cow<'_, str> {
        "funeeHttpServer".into()
    }
}

#[op2]
#[smi]
fn op_funee_serve_start(state: &mut OpState, #[smi] port: u16) -> Result<u32, JsErrorBox> {
    let (tx, rx) = mpsc::channel::<IncomingRequest>(64);

    tokio::spawn(async move {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("⚠ serve: failed to bind port {}: {}", port, e);
                return;
            }
        };
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let tx = tx.clone();
                    async move { handle_request(request, tx).await }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Ok(state.resource_table.add(HttpBridge {
        incoming: Mutex::new(rx),
        pending: std::sync::Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
    }))
}

async fn handle_request(
    request: Request<Incoming>,
    tx: mpsc::Sender<IncomingRequest>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = request.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let headers = parts
        .headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let (respond, responded) = oneshot::channel();
    let incoming = IncomingRequest {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        respond,
    };

    let fallback = || {
        Response::builder()
            .status(500)
            .body(Full::new(Bytes::from_static(b"server closed")))
            .unwrap_or_default()
    };
    if tx.send(incoming).await.is_err() {
        return Ok(fallback());
    }
    let Ok(out) = responded.await else {
        return Ok(fallback());
    };

    let mut builder = Response::builder().status(out.status);
    for (name, value) in &out.headers {
        builder = builder.header(name, value);
    }
    Ok(builder
        .body(Full::new(Bytes::from(out.body)))
        .unwrap_or_else(|_| fallback()))
}

#[op2(async)]
#[serde]
async fn op_funee_serve_next(
    state: Rc<RefCell<OpState>>,
    #[smi] rid: u32,
) -> Result<Value, JsErrorBox> {
    let bridge = state
        .borrow()
        .resource_table
        .get::<HttpBridge>(rid)
        .map_err(io_err)?;
    let next = bridge.incoming.lock().await.recv().await;
    match next {
        None => Ok(Value::Null),
        Some(request) => {
            let id = bridge.next_id.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut pending) = bridge.pending.lock() {
                pending.insert(id, request.respond);
            }
            Ok(json!({
                "id": id,
                "method": request.method,
                "url": request.url,
                "headers": request.headers,
                "body": request.body,
            }))
        }
    }
}

#[op2]
fn op_funee_serve_respond(
    state: &mut OpState,
    #[smi] rid: u32,
    #[number] id: f64,
    #[smi] status: u16,
    #[serde] headers: HashMap<String, String>,
    #[string] body: &str,
) -> Result<(), JsErrorBox> {
    let bridge = state.resource_table.get::<HttpBridge>(rid).map_err(io_err)?;
    let sender = bridge
        .pending
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&(id as u64)));
    if let Some(sender) = sender {
        let _ = sender.send(OutgoingResponse {
            status,
            headers,
            body: body.to_string(),
        });
    }
    Ok(())
}

struct WatchBridge {
    // Held only to keep the watcher alive for the resource's lifetime.
    _watcher: std::sync::Mutex<notify::RecommendedWatcher>,
    events: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl deno_core::Resource for WatchBridge {
    fn name(&self) -> Cow<'_, str> {
        "funeeWatcher".into()
    }
}

#[op2]
#[smi]
fn op_funee_watch_start(
    state: &mut OpState,
    #[string] path: &str,
    recursive: bool,
) -> Result<u32, JsErrorBox> {
    use notify::Watcher;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher =
        notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            if let Ok(event) = result {
                let paths: Vec<String> = event
                    .paths
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                let _ = tx.send(json!({ "kind": format!("{:?}", event.kind), "paths": paths }));
            }
        })
        .map_err(io_err)?;
    let mode = if recursive {
        notify::RecursiveMode::Recursive
    } else {
        notify::RecursiveMode::NonRecursive
    };
    watcher.watch(Path::new(path), mode).map_err(io_err)?;

    Ok(state.resource_table.add(WatchBridge {
        _watcher: std::sync::Mutex::new(watcher),
        events: Mutex::new(rx),
    }))
}

#[op2(async)]
#[serde]
async fn op_funee_watch_next(
    state: Rc<RefCell<OpState>>,
    #[smi] rid: u32,
) -> Result<Value, JsErrorBox> {
    let bridge = state
        .borrow()
        .resource_table
        .get::<WatchBridge>(rid)
        .map_err(io_err)?;
    let next = bridge.events.lock().await.recv().await;
    Ok(next.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_prologue_defines_every_host_binding() {
        for name in HOST_BINDINGS {
            assert!(
                HOST_PROLOGUE.contains(name),
                "prologue is missing the {} binding",
                name
            );
        }
    }

    #[test]
    fn a_trivial_bundle_runs_to_completion() {
        let code = format!(
            "{}\n__funee_host.log(\"hello from the bundle\");",
            HOST_PROLOGUE
        );
        run_bundle(&code).unwrap();
    }

    #[test]
    fn timers_drive_the_event_loop() {
        let code = format!(
            "{}\nlet done = false;\n__funee_host.setTimeout(() => {{ done = true; }}, 10);",
            HOST_PROLOGUE
        );
        run_bundle(&code).unwrap();
    }

    #[test]
    fn closure_values_reconstruct_in_the_runtime() {
        let code = format!(
            r#"{}
const c = new __funee_host.Closure(
    {{ type: "ArrowFunctionExpression", code: "(a, b)=>a + b" }},
    new Map([["add", new __funee_host.CanonicalName("/app/other.ts", "add")]])
);
if (c.expression.type !== "ArrowFunctionExpression") throw new Error("bad kind");
if (c.references.get("add").uri !== "/app/other.ts") throw new Error("bad reference");
"#,
            HOST_PROLOGUE
        );
        run_bundle(&code).unwrap();
    }
}
