//! Client side of the RPC fabric: one lazily-established connection per
//! peer node, request/reply correlation, and the `WrongClient`/`Timeout`
//! semantics the invocation engine relies on (§7).

use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use proclet_common::error::{CallError, WireStatus};
use proclet_common::ids::NodeId;
use rustc_hash::FxHashMap;
use proclet_wire::RequestKind;

use crate::connection::{read_loop, Connection};
use crate::envelope::{decode_reply, encode_request, REPLY_KIND};

type PendingMap = Mutex<FxHashMap<u64, Sender<(WireStatus, Vec<u8>)>>>;

/// Pool of outbound connections plus the bookkeeping needed to correlate
/// replies streaming back on each connection's reader thread.
pub struct RpcClient {
    connections: Mutex<FxHashMap<NodeId, Arc<Connection>>>,
    pending: Arc<PendingMap>,
    next_request_id: AtomicU64,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(default_timeout: Duration) -> Self {
        RpcClient {
            connections: Mutex::new(FxHashMap::default()),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            next_request_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    fn connection_for(&self, node: NodeId) -> Result<Arc<Connection>, CallError> {
        if let Some(conn) = self.connections.lock().get(&node) {
            return Ok(Arc::clone(conn));
        }

        let stream = TcpStream::connect((node.ip, node.port)).map_err(|_| CallError::Timeout(node))?;
        let conn = Connection::from_stream(node, stream).map_err(|_| CallError::Timeout(node))?;
        self.connections.lock().insert(node, Arc::clone(&conn));

        let reader = conn.reader().map_err(|_| CallError::Timeout(node))?;
        let pending = Arc::clone(&self.pending);
        std::thread::spawn(move || {
            read_loop(reader, move |kind, payload| {
                if kind != REPLY_KIND {
                    return true;
                }
                let Some((id, status, body)) = decode_reply(&payload) else {
                    return true;
                };
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send((status, body.to_vec()));
                }
                true
            });
            // Connection dropped: wake any calls still waiting on it so they
            // time out instead of hanging forever.
        });

        Ok(conn)
    }

    /// Drop a cached connection after observing it misbehave (closed by
    /// peer, framing error). The next call re-dials.
    pub fn invalidate(&self, node: NodeId) {
        self.connections.lock().remove(&node);
    }

    /// Issue one request and block for its matching reply, honoring the
    /// wire-level status the callee returned.
    pub fn call(&self, node: NodeId, kind: RequestKind, body: &[u8]) -> Result<Vec<u8>, CallError> {
        self.call_with_timeout(node, kind, body, self.default_timeout)
    }

    pub fn call_with_timeout(
        &self,
        node: NodeId,
        kind: RequestKind,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, CallError> {
        let conn = self.connection_for(node)?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.lock().insert(request_id, tx);

        let payload = encode_request(request_id, body);
        if conn.send_frame_with_credit(kind as u8, &payload).is_err() {
            self.pending.lock().remove(&request_id);
            self.invalidate(node);
            return Err(CallError::Timeout(node));
        }

        let outcome = rx.recv_timeout(timeout);
        conn.release_credit();

        match outcome {
            Ok((WireStatus::Ok, body)) => Ok(body),
            // The fabric doesn't know which proclet the caller meant; the
            // invocation engine (which does) rewrites this with the real id.
            Ok((WireStatus::WrongClient, _)) => {
                Err(CallError::WrongClient(proclet_common::ids::ProcletId::NONE))
            }
            Ok((WireStatus::Timeout, _)) => Err(CallError::Timeout(node)),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(CallError::Timeout(node))
            }
        }
    }
}
