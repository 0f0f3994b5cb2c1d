//! Minimal `nvkv` wire-protocol simulator, backed by an
//! [`EmbeddedStore`](crate::embedded::EmbeddedStore).
//!
//! This is the networked KV store spec.md §1 treats as external to the
//! core; it exists here so [`crate::net::client::NetworkStore`] has a real
//! peer to round-trip against in tests, not as a production KV engine.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::wire::{self, Opcode, Request, Response, Status};
use crate::embedded::EmbeddedStore;
use crate::KvStore;

pub struct Simulator {
    listener: TcpListener,
    store: Arc<EmbeddedStore>,
}

impl Simulator {
    pub fn bind(addr: &str) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            store: Arc::new(EmbeddedStore::in_memory()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever, spawning one thread per connection.
    pub fn serve(self) -> std::io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = stream?;
            let store = self.store.clone();
            thread::spawn(move || {
                if let Err(e) = handle_connection(stream, store) {
                    debug!(error = %e, "nvkv simulator connection ended");
                }
            });
        }
        Ok(())
    }

    /// Serve a single request/response pair; used by tests that don't want
    /// a background thread.
    pub fn serve_one(&self, mut stream: TcpStream) -> std::io::Result<()> {
        handle_request(&mut stream, &self.store)
    }
}

fn handle_connection(mut stream: TcpStream, store: Arc<EmbeddedStore>) -> std::io::Result<()> {
    loop {
        if let Err(e) = handle_request(&mut stream, &store) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            warn!(error = %e, "nvkv simulator request failed");
            return Err(e);
        }
    }
}

fn handle_request(stream: &mut TcpStream, store: &EmbeddedStore) -> std::io::Result<()> {
    let req = Request::read_from(stream)?;
    let resp = match req.opcode {
        Opcode::Store => match store.put(&req.key, &req.value) {
            Ok(()) => ok_response(req.command_id, Vec::new()),
            Err(_) => err_response(req.command_id, Status::Internal),
        },
        Opcode::Retrieve => match store.get(&req.key) {
            Ok(Some(v)) => ok_response(req.command_id, v),
            Ok(None) => err_response(req.command_id, Status::NotFound),
            Err(_) => err_response(req.command_id, Status::Internal),
        },
        Opcode::Delete => match store.delete(&req.key) {
            Ok(()) => ok_response(req.command_id, Vec::new()),
            Err(_) => err_response(req.command_id, Status::Internal),
        },
        Opcode::Exist => match store.get(&req.key) {
            Ok(Some(_)) => ok_response(req.command_id, Vec::new()),
            Ok(None) => err_response(req.command_id, Status::NotFound),
            Err(_) => err_response(req.command_id, Status::Internal),
        },
        Opcode::List => match store.prefix_iter(&req.key) {
            Ok(mut it) => {
                let mut entries = Vec::new();
                while it.valid() {
                    entries.push((it.key().to_vec(), it.value().to_vec()));
                    it.next();
                }
                ok_response(req.command_id, wire::encode_list_payload(&entries))
            }
            Err(_) => err_response(req.command_id, Status::Internal),
        },
    };
    resp.write_to(stream)
}

fn ok_response(command_id: u32, value: Vec<u8>) -> Response {
    Response {
        status: Status::Success,
        command_id,
        value,
    }
}

fn err_response(command_id: u32, status: Status) -> Response {
    Response {
        status,
        command_id,
        value: Vec::new(),
    }
}
