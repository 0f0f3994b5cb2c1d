//! [`KvStore`] client for the networked `nvkv` simulator.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::wire::{self, Opcode, Request, Response, Status};
use crate::{KvError, KvIterator, KvResult, KvStore};

/// A connection to a networked KV backend, serializing request/response
/// pairs through a per-connection mutex as spec.md §5 requires (the
/// simulator has no internal pipelining).
pub struct NetworkStore {
    conn: Mutex<TcpStream>,
    next_command_id: AtomicU32,
}

impl NetworkStore {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> KvResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            conn: Mutex::new(stream),
            next_command_id: AtomicU32::new(1),
        })
    }

    fn roundtrip(&self, opcode: Opcode, key: &[u8], value: &[u8]) -> KvResult<Response> {
        let command_id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(opcode, command_id, key.to_vec(), value.to_vec())
            .map_err(|_| KvError::KeyTooLong)?;
        let mut conn = self.conn.lock();
        req.write_to(&mut *conn)?;
        Response::read_from(&mut *conn).map_err(KvError::Io)
    }
}

impl KvStore for NetworkStore {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let resp = self.roundtrip(Opcode::Retrieve, key, &[])?;
        match resp.status {
            Status::Success => Ok(Some(resp.value)),
            Status::NotFound => Ok(None),
            other => Err(KvError::RemoteStatus(other as u16)),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        if value.len() > wire::MAX_VALUE_LEN {
            return Err(KvError::ValueTooLong);
        }
        let resp = self.roundtrip(Opcode::Store, key, value)?;
        match resp.status {
            Status::Success => Ok(()),
            other => Err(KvError::RemoteStatus(other as u16)),
        }
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        let resp = self.roundtrip(Opcode::Delete, key, &[])?;
        match resp.status {
            Status::Success | Status::NotFound => Ok(()),
            other => Err(KvError::RemoteStatus(other as u16)),
        }
    }

    fn prefix_iter<'a>(&'a self, prefix: &[u8]) -> KvResult<Box<dyn KvIterator + 'a>> {
        let resp = self.roundtrip(Opcode::List, prefix, &[])?;
        match resp.status {
            Status::Success => {
                let entries = wire::decode_list_payload(&resp.value)
                    .map_err(|e| KvError::Protocol(e.to_string()))?;
                Ok(Box::new(ListIter { entries, pos: 0 }))
            }
            Status::NotFound => Ok(Box::new(ListIter {
                entries: Vec::new(),
                pos: 0,
            })),
            other => Err(KvError::RemoteStatus(other as u16)),
        }
    }
}

struct ListIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl KvIterator for ListIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn next(&mut self) {
        self.pos += 1;
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }
}
