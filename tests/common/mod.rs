//! A scripted in-process memcached speaking enough of the ASCII protocol for
//! the integration suite to run without an external server. One client
//! connection is served at a time, which matches the client's
//! one-connection-per-node model and lets tests kill the connection by
//! aborting the server task.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct Entry {
    pub flags: u32,
    pub exptime: u32,
    pub data: Vec<u8>,
    pub cas: u64,
}

#[derive(Default)]
pub struct StoreInner {
    pub map: HashMap<Vec<u8>, Entry>,
    cas_counter: u64,
}

impl StoreInner {
    fn next_cas(&mut self) -> u64 {
        self.cas_counter += 1;
        self.cas_counter
    }
}

pub type SharedStore = Arc<Mutex<StoreInner>>;

pub fn new_store() -> SharedStore {
    Arc::new(Mutex::new(StoreInner::default()))
}

#[derive(Clone, Default)]
pub struct MockOptions {
    /// Close the connection after serving this many commands.
    pub drop_after: Option<usize>,
    /// Sleep before writing each response.
    pub response_delay: Option<Duration>,
}

pub struct MockServer {
    pub addr: String,
    pub store: SharedStore,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, new_store(), options)
    }

    /// Bind a specific address with an existing store; used to "restart" a
    /// server on the port a client already knows.
    pub async fn start_on(addr: &str, store: SharedStore, options: MockOptions) -> MockServer {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve(listener, store, options)
    }

    fn serve(listener: TcpListener, store: SharedStore, options: MockOptions) -> MockServer {
        let addr = listener.local_addr().unwrap().to_string();
        let conn_store = store.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                serve_conn(stream, &conn_store, &options).await;
            }
        });
        MockServer { addr, store, task }
    }

    /// Drop the listener and whatever connection is being served.
    pub fn stop(self) -> SharedStore {
        let store = self.store.clone();
        drop(self);
        store
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_conn(mut stream: TcpStream, store: &SharedStore, options: &MockOptions) {
    let mut buf: Vec<u8> = Vec::new();
    let mut served = 0usize;

    loop {
        while let Some((consumed, response)) = try_handle(&buf, store) {
            buf.drain(..consumed);
            if let Some(delay) = options.response_delay {
                tokio::time::sleep(delay).await;
            }
            if stream.write_all(&response).await.is_err() {
                return;
            }
            served += 1;
            if options.drop_after == Some(served) {
                return;
            }
        }

        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

// Returns (bytes consumed, response) once a full command (including any data
// block) is buffered.
fn try_handle(buf: &[u8], store: &SharedStore) -> Option<(usize, Vec<u8>)> {
    let line_end = find_crlf(buf)?;
    let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
    let mut consumed = line_end + 2;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Some((consumed, b"ERROR\r\n".to_vec()));
    }

    let mut inner = store.lock().unwrap();
    let response: Vec<u8> = match tokens[0] {
        verb @ ("set" | "add" | "replace" | "append" | "prepend" | "cas") => {
            let key = tokens[1].as_bytes().to_vec();
            let flags: u32 = tokens[2].parse().unwrap();
            let exptime: u32 = tokens[3].parse().unwrap();
            let len: usize = tokens[4].parse().unwrap();
            if buf.len() < consumed + len + 2 {
                return None;
            }
            let data = buf[consumed..consumed + len].to_vec();
            consumed += len + 2;

            let exists = inner.map.contains_key(&key);
            match verb {
                "set" => {
                    let cas = inner.next_cas();
                    inner.map.insert(key, Entry { flags, exptime, data, cas });
                    b"STORED\r\n".to_vec()
                }
                "add" if exists => b"NOT_STORED\r\n".to_vec(),
                "add" => {
                    let cas = inner.next_cas();
                    inner.map.insert(key, Entry { flags, exptime, data, cas });
                    b"STORED\r\n".to_vec()
                }
                "replace" if !exists => b"NOT_STORED\r\n".to_vec(),
                "replace" => {
                    let cas = inner.next_cas();
                    inner.map.insert(key, Entry { flags, exptime, data, cas });
                    b"STORED\r\n".to_vec()
                }
                "append" | "prepend" => {
                    if !exists {
                        b"NOT_STORED\r\n".to_vec()
                    } else {
                        let cas = inner.next_cas();
                        let entry = inner.map.get_mut(&key).unwrap();
                        if verb == "append" {
                            entry.data.extend_from_slice(&data);
                        } else {
                            let mut combined = data;
                            combined.extend_from_slice(&entry.data);
                            entry.data = combined;
                        }
                        entry.cas = cas;
                        b"STORED\r\n".to_vec()
                    }
                }
                "cas" => {
                    let cas_id: u64 = tokens[5].parse().unwrap();
                    match inner.map.get(&key).map(|e| e.cas) {
                        None => b"NOT_FOUND\r\n".to_vec(),
                        Some(current) if current != cas_id => b"EXISTS\r\n".to_vec(),
                        Some(_) => {
                            let cas = inner.next_cas();
                            inner.map.insert(key, Entry { flags, exptime, data, cas });
                            b"STORED\r\n".to_vec()
                        }
                    }
                }
                _ => unreachable!(),
            }
        }
        verb @ ("get" | "gets") => {
            let mut out = Vec::new();
            for key in &tokens[1..] {
                if let Some(entry) = inner.map.get(key.as_bytes()) {
                    if verb == "gets" {
                        out.extend_from_slice(
                            format!("VALUE {} {} {} {}\r\n", key, entry.flags, entry.data.len(), entry.cas)
                                .as_bytes(),
                        );
                    } else {
                        out.extend_from_slice(
                            format!("VALUE {} {} {}\r\n", key, entry.flags, entry.data.len())
                                .as_bytes(),
                        );
                    }
                    out.extend_from_slice(&entry.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        "delete" => {
            if inner.map.remove(tokens[1].as_bytes()).is_some() {
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        verb @ ("incr" | "decr") => {
            let key = tokens[1].as_bytes().to_vec();
            let delta: u64 = tokens[2].parse().unwrap();
            let cas = inner.next_cas();
            match inner.map.get_mut(&key) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(entry) => match std::str::from_utf8(&entry.data)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    None => {
                        b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec()
                    }
                    Some(current) => {
                        let next = if verb == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        entry.data = next.to_string().into_bytes();
                        entry.cas = cas;
                        format!("{}\r\n", next).into_bytes()
                    }
                },
            }
        }
        "touch" => {
            let exptime: u32 = tokens[2].parse().unwrap();
            match inner.map.get_mut(tokens[1].as_bytes()) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(entry) => {
                    entry.exptime = exptime;
                    b"TOUCHED\r\n".to_vec()
                }
            }
        }
        "flush_all" => {
            inner.map.clear();
            b"OK\r\n".to_vec()
        }
        "version" => b"VERSION 1.6.0-mock\r\n".to_vec(),
        "stats" => {
            format!("STAT curr_items {}\r\nSTAT version 1.6.0-mock\r\nEND\r\n", inner.map.len())
                .into_bytes()
        }
        _ => b"ERROR\r\n".to_vec(),
    };

    Some((consumed, response))
}
