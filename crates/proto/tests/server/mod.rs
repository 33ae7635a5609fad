//! Scripted in-memory SFTP v3 server.
//!
//! Speaks the wire protocol over a `tokio::io::duplex` pair and follows a
//! small script: which version to answer, which WRITE offsets to fail,
//! whether to batch READ replies and answer them in reverse order, and so
//! on. Every request is appended to an operation log so tests can assert
//! ordering.

#![allow(dead_code)]

use ferry_proto::sftp::wire::{
    open_flags, ClosePacket, DataPacket, FileAttributes, HandlePacket, InitPacket, MkdirPacket,
    NameEntry, NamePacket, OpenDirPacket, OpenPacket, PacketType, ReadDirPacket, ReadPacket,
    RealPathPacket, RemovePacket, RmdirPacket, StatPacket, StatusCode, StatusPacket,
    VersionPacket, WritePacket, file_mode,
};
use ferry_proto::sftp::{Connection, SftpClient, SftpClientConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// A node of the scripted remote filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
}

/// Server script, built before spawning.
pub struct ScriptedServer {
    version: u32,
    nodes: BTreeMap<String, Node>,
    write_status: HashMap<u64, StatusCode>,
    read_status: HashMap<u64, StatusCode>,
    reversed_read_window: usize,
    max_read: Option<u32>,
    ok_status_on_read: bool,
    remove_failure: Option<(String, StatusCode)>,
    mkdir_failure: Option<(String, StatusCode)>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self {
            version: 3,
            nodes: BTreeMap::new(),
            write_status: HashMap::new(),
            read_status: HashMap::new(),
            reversed_read_window: 0,
            max_read: None,
            ok_status_on_read: false,
            remove_failure: None,
            mkdir_failure: None,
        }
    }

    /// Version the server answers INIT with.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Seeds a regular file.
    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.nodes.insert(path.to_string(), Node::File(data));
        self
    }

    /// Seeds a directory.
    pub fn with_dir(mut self, path: &str) -> Self {
        self.nodes.insert(path.to_string(), Node::Dir);
        self
    }

    /// Replies to the WRITE at `offset` with `code` instead of OK.
    pub fn with_write_status(mut self, offset: u64, code: StatusCode) -> Self {
        self.write_status.insert(offset, code);
        self
    }

    /// Replies to the READ at `offset` with `code` instead of data.
    pub fn with_read_status(mut self, offset: u64, code: StatusCode) -> Self {
        self.read_status.insert(offset, code);
        self
    }

    /// Buffers READ replies in batches of `window` and sends each batch in
    /// reverse order.
    pub fn with_reversed_reads(mut self, window: usize) -> Self {
        self.reversed_read_window = window;
        self
    }

    /// Caps DATA replies at `len` bytes, forcing short reads.
    pub fn with_max_read(mut self, len: u32) -> Self {
        self.max_read = Some(len);
        self
    }

    /// Answers every READ with a bare STATUS OK.
    pub fn with_ok_status_on_read(mut self) -> Self {
        self.ok_status_on_read = true;
        self
    }

    /// Fails REMOVE of `path` with `code`.
    pub fn with_remove_failure(mut self, path: &str, code: StatusCode) -> Self {
        self.remove_failure = Some((path.to_string(), code));
        self
    }

    /// Fails MKDIR of `path` with `code`.
    pub fn with_mkdir_failure(mut self, path: &str, code: StatusCode) -> Self {
        self.mkdir_failure = Some((path.to_string(), code));
        self
    }

    /// Spawns the server task, returning the client-side pipes and the
    /// shared state for assertions.
    pub fn spawn(
        self,
    ) -> (
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
        ServerHarness,
    ) {
        let (client_io, server_io) = duplex(1 << 16);
        let (client_r, client_w) = split(client_io);
        let (server_r, server_w) = split(server_io);
        let conn = Connection::new(server_r, server_w);

        let state = Arc::new(Mutex::new(ServerState {
            nodes: self.nodes.clone(),
            written: BTreeMap::new(),
            oplog: Vec::new(),
            handles: HashMap::new(),
            next_handle: 0,
        }));

        let task = tokio::spawn(run(self, conn, state.clone()));
        (client_r, client_w, ServerHarness { state, task })
    }
}

/// Live server state shared with the test.
pub struct ServerState {
    nodes: BTreeMap<String, Node>,
    /// Bytes written per path, assembled by offset.
    pub written: BTreeMap<String, Vec<u8>>,
    /// One line per request, e.g. `REMOVE /dir/a`.
    pub oplog: Vec<String>,
    handles: HashMap<Vec<u8>, OpenHandle>,
    next_handle: u32,
}

struct OpenHandle {
    path: String,
    is_dir: bool,
    dir_served: bool,
}

pub struct ServerHarness {
    pub state: Arc<Mutex<ServerState>>,
    pub task: JoinHandle<()>,
}

/// Connects a default-config client to the scripted server.
pub async fn connect(script: ScriptedServer) -> (SftpClient, ServerHarness) {
    let (r, w, harness) = script.spawn();
    let client = SftpClient::new(r, w).await.expect("handshake");
    (client, harness)
}

/// Connects a client with an explicit configuration.
pub async fn connect_with_config(
    script: ScriptedServer,
    config: SftpClientConfig,
) -> (SftpClient, ServerHarness) {
    let (r, w, harness) = script.spawn();
    let client = SftpClient::with_config(r, w, config)
        .await
        .expect("handshake");
    (client, harness)
}

enum ReadReply {
    Data { id: u32, data: Vec<u8> },
    Status { id: u32, code: StatusCode },
}

async fn send_read_reply(conn: &Connection, reply: &ReadReply) {
    match reply {
        ReadReply::Data { id, data } => {
            let _ = conn.send(&DataPacket { id: *id, data }).await;
        }
        ReadReply::Status { id, code } => {
            let _ = conn.send(&StatusPacket::from_code(*id, *code)).await;
        }
    }
}

async fn run(script: ScriptedServer, conn: Connection, state: Arc<Mutex<ServerState>>) {
    let mut pending_reads: Vec<ReadReply> = Vec::new();

    loop {
        let (typ, body) = match conn.recv().await {
            Ok(frame) => frame,
            Err(_) => break,
        };

        match PacketType::from_u8(typ) {
            Some(PacketType::Init) => {
                let _ = InitPacket::decode(&body).unwrap();
                let _ = conn
                    .send(&VersionPacket {
                        version: script.version,
                        extensions: vec![],
                    })
                    .await;
            }
            Some(PacketType::RealPath) => {
                let p = RealPathPacket::decode(&body).unwrap();
                log(&state, format!("REALPATH {}", p.path));
                let resolved = canonical(&p.path);
                let _ = conn
                    .send(&NamePacket {
                        id: p.id,
                        entries: vec![NameEntry {
                            filename: resolved,
                            longname: String::new(),
                            attrs: FileAttributes::new(),
                        }],
                    })
                    .await;
            }
            Some(PacketType::Stat) => {
                let p = StatPacket::decode(&body).unwrap();
                log(&state, format!("STAT {}", p.path));
                let node = state.lock().unwrap().nodes.get(&p.path).cloned();
                match node {
                    Some(node) => {
                        let _ = conn
                            .send(&ferry_proto::sftp::wire::AttrsPacket {
                                id: p.id,
                                attrs: attrs_for(&node),
                            })
                            .await;
                    }
                    None => {
                        let _ = conn
                            .send(&StatusPacket::from_code(p.id, StatusCode::NoSuchFile))
                            .await;
                    }
                }
            }
            Some(PacketType::Open) => {
                let p = OpenPacket::decode(&body).unwrap();
                log(&state, format!("OPEN {}", p.path));
                let not_found = {
                    let mut st = state.lock().unwrap();
                    if p.pflags & open_flags::CREAT != 0 {
                        st.nodes.insert(p.path.clone(), Node::File(Vec::new()));
                        st.written.insert(p.path.clone(), Vec::new());
                        false
                    } else {
                        !matches!(st.nodes.get(&p.path), Some(Node::File(_)))
                    }
                };
                if not_found {
                    let _ = conn
                        .send(&StatusPacket::from_code(p.id, StatusCode::NoSuchFile))
                        .await;
                    continue;
                }
                let handle = {
                    let mut st = state.lock().unwrap();
                    st.issue_handle(&p.path, false)
                };
                let _ = conn.send(&HandlePacket { id: p.id, handle }).await;
            }
            Some(PacketType::Close) => {
                let p = ClosePacket::decode(&body).unwrap();
                state.lock().unwrap().handles.remove(p.handle);
                let _ = conn
                    .send(&StatusPacket::from_code(p.id, StatusCode::Ok))
                    .await;
            }
            Some(PacketType::Read) => {
                let p = ReadPacket::decode(&body).unwrap();
                let reply = build_read_reply(&script, &state, &p);
                if script.reversed_read_window > 0 {
                    // a STATUS reply marks the tail of the file; flush the
                    // partial batch so no request is left unanswered
                    let at_tail = matches!(reply, ReadReply::Status { .. });
                    pending_reads.push(reply);
                    if pending_reads.len() >= script.reversed_read_window || at_tail {
                        for reply in pending_reads.iter().rev() {
                            send_read_reply(&conn, reply).await;
                        }
                        pending_reads.clear();
                    }
                } else {
                    send_read_reply(&conn, &reply).await;
                }
            }
            Some(PacketType::Write) => {
                let p = WritePacket::decode(&body).unwrap();
                if let Some(code) = script.write_status.get(&p.offset) {
                    let _ = conn.send(&StatusPacket::from_code(p.id, *code)).await;
                    continue;
                }
                {
                    let mut st = state.lock().unwrap();
                    let path = st.handles.get(p.handle).map(|h| h.path.clone());
                    if let Some(path) = path {
                        let buf = st.written.entry(path).or_default();
                        let off = p.offset as usize;
                        if buf.len() < off + p.data.len() {
                            buf.resize(off + p.data.len(), 0);
                        }
                        buf[off..off + p.data.len()].copy_from_slice(p.data);
                    }
                }
                let _ = conn
                    .send(&StatusPacket::from_code(p.id, StatusCode::Ok))
                    .await;
            }
            Some(PacketType::OpenDir) => {
                let p = OpenDirPacket::decode(&body).unwrap();
                log(&state, format!("OPENDIR {}", p.path));
                let not_found = {
                    let st = state.lock().unwrap();
                    !matches!(st.nodes.get(&p.path), Some(Node::Dir))
                };
                if not_found {
                    let _ = conn
                        .send(&StatusPacket::from_code(p.id, StatusCode::NoSuchFile))
                        .await;
                    continue;
                }
                let handle = {
                    let mut st = state.lock().unwrap();
                    st.issue_handle(&p.path, true)
                };
                let _ = conn.send(&HandlePacket { id: p.id, handle }).await;
            }
            Some(PacketType::ReadDir) => {
                let p = ReadDirPacket::decode(&body).unwrap();
                let dir = {
                    let mut st = state.lock().unwrap();
                    match st.handles.get_mut(p.handle) {
                        None => Err(StatusCode::Failure),
                        Some(h) if h.dir_served => Err(StatusCode::Eof),
                        Some(h) => {
                            h.dir_served = true;
                            Ok(h.path.clone())
                        }
                    }
                };
                match dir {
                    Err(code) => {
                        let _ = conn.send(&StatusPacket::from_code(p.id, code)).await;
                    }
                    Ok(dir) => {
                        let mut entries = vec![
                            NameEntry {
                                filename: ".".to_string(),
                                longname: String::new(),
                                attrs: attrs_for(&Node::Dir),
                            },
                            NameEntry {
                                filename: "..".to_string(),
                                longname: String::new(),
                                attrs: attrs_for(&Node::Dir),
                            },
                        ];
                        {
                            let st = state.lock().unwrap();
                            for (name, node) in children(&st.nodes, &dir) {
                                entries.push(NameEntry {
                                    filename: name,
                                    longname: String::new(),
                                    attrs: attrs_for(&node),
                                });
                            }
                        }
                        let _ = conn.send(&NamePacket { id: p.id, entries }).await;
                    }
                }
            }
            Some(PacketType::Remove) => {
                let p = RemovePacket::decode(&body).unwrap();
                log(&state, format!("REMOVE {}", p.path));
                if let Some((path, code)) = &script.remove_failure {
                    if *path == p.path {
                        let _ = conn.send(&StatusPacket::from_code(p.id, *code)).await;
                        continue;
                    }
                }
                let existed = state.lock().unwrap().nodes.remove(&p.path).is_some();
                let code = if existed {
                    StatusCode::Ok
                } else {
                    StatusCode::NoSuchFile
                };
                let _ = conn.send(&StatusPacket::from_code(p.id, code)).await;
            }
            Some(PacketType::RmDir) => {
                let p = RmdirPacket::decode(&body).unwrap();
                log(&state, format!("RMDIR {}", p.path));
                let code = {
                    let mut st = state.lock().unwrap();
                    if !children(&st.nodes, &p.path).is_empty() {
                        StatusCode::Failure
                    } else if st.nodes.remove(&p.path).is_some() {
                        StatusCode::Ok
                    } else {
                        StatusCode::NoSuchFile
                    }
                };
                let _ = conn.send(&StatusPacket::from_code(p.id, code)).await;
            }
            Some(PacketType::MkDir) => {
                let p = MkdirPacket::decode(&body).unwrap();
                log(&state, format!("MKDIR {}", p.path));
                if let Some((path, code)) = &script.mkdir_failure {
                    if *path == p.path {
                        let _ = conn.send(&StatusPacket::from_code(p.id, *code)).await;
                        continue;
                    }
                }
                state
                    .lock()
                    .unwrap()
                    .nodes
                    .insert(p.path.clone(), Node::Dir);
                let _ = conn
                    .send(&StatusPacket::from_code(p.id, StatusCode::Ok))
                    .await;
            }
            _ => break,
        }
    }
}

impl ServerState {
    fn issue_handle(&mut self, path: &str, is_dir: bool) -> Vec<u8> {
        self.next_handle += 1;
        let handle = format!("h{}", self.next_handle).into_bytes();
        self.handles.insert(
            handle.clone(),
            OpenHandle {
                path: path.to_string(),
                is_dir,
                dir_served: false,
            },
        );
        handle
    }
}

fn build_read_reply(
    script: &ScriptedServer,
    state: &Arc<Mutex<ServerState>>,
    p: &ReadPacket<'_>,
) -> ReadReply {
    if script.ok_status_on_read {
        return ReadReply::Status {
            id: p.id,
            code: StatusCode::Ok,
        };
    }
    if let Some(code) = script.read_status.get(&p.offset) {
        return ReadReply::Status {
            id: p.id,
            code: *code,
        };
    }
    let st = state.lock().unwrap();
    let Some(handle) = st.handles.get(p.handle) else {
        return ReadReply::Status {
            id: p.id,
            code: StatusCode::Failure,
        };
    };
    let Some(Node::File(data)) = st.nodes.get(&handle.path) else {
        return ReadReply::Status {
            id: p.id,
            code: StatusCode::Failure,
        };
    };
    let off = p.offset as usize;
    if off >= data.len() {
        return ReadReply::Status {
            id: p.id,
            code: StatusCode::Eof,
        };
    }
    let mut len = (p.len as usize).min(data.len() - off);
    if let Some(cap) = script.max_read {
        len = len.min(cap as usize);
    }
    ReadReply::Data {
        id: p.id,
        data: data[off..off + len].to_vec(),
    }
}

fn attrs_for(node: &Node) -> FileAttributes {
    match node {
        Node::File(data) => FileAttributes {
            size: Some(data.len() as u64),
            permissions: Some(file_mode::REGULAR | 0o644),
            ..Default::default()
        },
        Node::Dir => FileAttributes {
            permissions: Some(file_mode::DIR | 0o755),
            ..Default::default()
        },
    }
}

fn children(nodes: &BTreeMap<String, Node>, dir: &str) -> Vec<(String, Node)> {
    let prefix = if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    };
    nodes
        .iter()
        .filter_map(|(path, node)| {
            let rest = path.strip_prefix(&prefix)?;
            if rest.is_empty() || rest.contains('/') {
                None
            } else {
                Some((rest.to_string(), node.clone()))
            }
        })
        .collect()
}

fn canonical(path: &str) -> String {
    if path == "." {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn log(state: &Arc<Mutex<ServerState>>, line: String) {
    state.lock().unwrap().oplog.push(line);
}
