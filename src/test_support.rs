//! In-memory cluster for tests
//!
//! Every fake node speaks the real framing over `tokio::io::duplex`, answers
//! greetings, auth, role probes and data requests, and can be told to go
//! silent, slow down, reorder replies, fail probes or drop off the network.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::core::transport::{Link, Transport};
use crate::core::Role;
use crate::error::ConnectError;
use crate::protocol::{
    self, AuthBody, Frame, Greeting, Opcode, GREETING, RESPONSE_ERROR_FLAG, RESPONSE_OK,
    ROLE_PROBE_EXPR,
};

const SALT: &[u8] = b"fake-cluster-salt-0123456789";

/// Error code a read-only node returns for writes
pub(crate) const READONLY_ERROR: u32 = 7;

pub(crate) fn deadline_in(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

pub(crate) struct FakeNode {
    pub addr: String,
    read_only: AtomicBool,
    reachable: AtomicBool,
    silent: AtomicBool,
    fail_probes: AtomicBool,
    jitter: AtomicBool,
    delay_ms: AtomicU64,
    banner: Mutex<String>,
    password: Mutex<Option<String>>,
    served: AtomicUsize,
    probes: AtomicUsize,
    links_opened: AtomicUsize,
    /// Bumped to drop every open link
    epoch: watch::Sender<u64>,
}

impl FakeNode {
    fn new(addr: &str, role: Role) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            addr: addr.to_string(),
            read_only: AtomicBool::new(role == Role::ReadOnly),
            reachable: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            fail_probes: AtomicBool::new(false),
            jitter: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            banner: Mutex::new("Tarantool 2.11.1 (Binary)".to_string()),
            password: Mutex::new(None),
            served: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            links_opened: AtomicUsize::new(0),
            epoch,
        }
    }

    pub fn set_role(&self, role: Role) {
        self.read_only.store(role == Role::ReadOnly, Ordering::SeqCst);
    }

    /// Stop answering data requests; probes and pings still work
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Random per-request delay so replies overtake each other
    pub fn set_jitter(&self, jitter: bool) {
        self.jitter.store(jitter, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_banner(&self, banner: &str) {
        *self.banner.lock().unwrap() = banner.to_string();
    }

    pub fn set_password(&self, password: &str) {
        *self.password.lock().unwrap() = Some(password.to_string());
    }

    /// Data requests answered (or swallowed, when silent)
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn links_opened(&self) -> usize {
        self.links_opened.load(Ordering::SeqCst)
    }

    /// Drop every open link; the node stays reachable
    pub fn sever(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Drop every open link and refuse new ones
    pub fn go_down(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        self.sever();
    }

    pub fn come_back(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    fn reply_delay(&self) -> Duration {
        let mut ms = self.delay_ms.load(Ordering::SeqCst);
        if self.jitter.load(Ordering::SeqCst) {
            ms += rand::thread_rng().gen_range(0..10);
        }
        Duration::from_millis(ms)
    }

    fn greeting(&self) -> Frame {
        let greeting = Greeting {
            server: self.banner.lock().unwrap().clone(),
            salt: hex::encode(SALT),
        };
        Frame::new(GREETING, 0, Bytes::from(serde_json::to_vec(&greeting).unwrap()))
    }

    /// Answer one request, or `None` to leave it hanging
    fn answer(&self, frame: &Frame) -> Option<Frame> {
        let ok = |body: Bytes| Some(Frame::new(RESPONSE_OK, frame.sync, body));
        let err = |code: u32, message: &str| {
            Some(Frame::new(
                RESPONSE_ERROR_FLAG | code,
                frame.sync,
                protocol::error_body(message),
            ))
        };

        let opcode = Opcode::from_code(frame.code)?;
        let body: Value = if frame.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&frame.body).unwrap_or(Value::Null)
        };

        match opcode {
            Opcode::Auth => {
                let auth: AuthBody = serde_json::from_value(body).ok()?;
                let expected = self
                    .password
                    .lock()
                    .unwrap()
                    .as_deref()
                    .map(|password| hex::encode(protocol::scramble(SALT, password)));
                match expected {
                    Some(expected) if expected != auth.scramble => {
                        err(47, &format!("Incorrect password supplied for user '{}'", auth.user))
                    }
                    _ => ok(Bytes::new()),
                }
            }
            Opcode::Ping => ok(Bytes::new()),
            Opcode::Eval if body["expr"] == json!(ROLE_PROBE_EXPR) => {
                self.probes.fetch_add(1, Ordering::SeqCst);
                if self.fail_probes.load(Ordering::SeqCst) {
                    return err(32, "box.info is unavailable");
                }
                let read_only = self.read_only.load(Ordering::SeqCst);
                ok(protocol::data_body(vec![json!(read_only)]))
            }
            _ => {
                self.served.fetch_add(1, Ordering::SeqCst);
                if self.silent.load(Ordering::SeqCst) {
                    return None;
                }
                let is_write = matches!(
                    opcode,
                    Opcode::Insert
                        | Opcode::Replace
                        | Opcode::Update
                        | Opcode::Delete
                        | Opcode::Upsert
                );
                if is_write && self.read_only.load(Ordering::SeqCst) {
                    return err(
                        READONLY_ERROR,
                        "Can't modify data because this instance is in read-only mode.",
                    );
                }
                ok(protocol::data_body(vec![
                    json!(self.addr),
                    body,
                    json!(opcode.to_string()),
                ]))
            }
        }
    }
}

/// A set of fake nodes addressable through [`Transport`]
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    nodes: Arc<Mutex<HashMap<String, Arc<FakeNode>>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, addr: &str, role: Role) -> Arc<FakeNode> {
        let node = Arc::new(FakeNode::new(addr, role));
        self.nodes
            .lock()
            .unwrap()
            .insert(addr.to_string(), Arc::clone(&node));
        node
    }
}

#[async_trait]
impl Transport for FakeCluster {
    async fn open(&self, addr: &str) -> Result<Link, ConnectError> {
        let node = self.nodes.lock().unwrap().get(addr).cloned();
        let node = match node {
            Some(node) if node.reachable.load(Ordering::SeqCst) => node,
            _ => {
                return Err(ConnectError::Unreachable {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
                })
            }
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        node.links_opened.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(node, Link::from_stream(server)));
        Ok(Link::from_stream(client))
    }
}

async fn serve(node: Arc<FakeNode>, link: Link) {
    let Link { mut reader, mut writer } = link;
    let mut epoch = node.epoch.subscribe();
    let mut writer_epoch = node.epoch.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_epoch.changed() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if writer.write(frame.encode()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let _ = tx.send(node.greeting());

    loop {
        let bytes = tokio::select! {
            _ = epoch.changed() => break,
            read = reader.read() => match read {
                Ok(bytes) => bytes,
                Err(_) => break,
            },
        };
        let Ok(frame) = Frame::decode(bytes) else { break };
        let Some(reply) = node.answer(&frame) else { continue };

        let delay = node.reply_delay();
        if delay.is_zero() {
            let _ = tx.send(reply);
        } else {
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(reply);
            });
        }
    }
}
