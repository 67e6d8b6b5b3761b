//! Server side of the RPC fabric: accept loop plus per-connection reader
//! thread, grounded in the source's `accept_loop` / per-session thread
//! pattern (minus the TLS and cookie layers, which are out of scope here).

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proclet_common::error::WireStatus;
use proclet_common::ids::NodeId;
use proclet_wire::RequestKind;
use tracing::warn;

use crate::connection::{read_loop, Connection};
use crate::envelope::{decode_request, encode_reply, REPLY_KIND};

/// Handles one request kind's payload and produces a reply body plus
/// wire status. Implemented by whatever owns the dispatch table
/// (controller, proclet server).
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, kind: RequestKind, body: &[u8]) -> (WireStatus, Vec<u8>);
}

impl<F> RequestHandler for F
where
    F: Fn(RequestKind, &[u8]) -> (WireStatus, Vec<u8>) + Send + Sync + 'static,
{
    fn handle(&self, kind: RequestKind, body: &[u8]) -> (WireStatus, Vec<u8>) {
        self(kind, body)
    }
}

pub struct RpcServer {
    shutdown: Arc<AtomicBool>,
    local_addr: std::net::SocketAddr,
}

impl RpcServer {
    /// Bind `bind_addr` and spawn the accept loop on a background thread.
    /// Every accepted connection gets its own reader thread dispatching
    /// through `handler`.
    pub fn spawn<H: RequestHandler>(bind_addr: (std::net::IpAddr, u16), handler: Arc<H>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_loop = Arc::clone(&shutdown);

        std::thread::spawn(move || accept_loop(listener, shutdown_for_loop, handler));

        Ok(RpcServer { shutdown, local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn accept_loop<H: RequestHandler>(listener: TcpListener, shutdown: Arc<AtomicBool>, handler: Arc<H>) {
    listener.set_nonblocking(true).expect("set_nonblocking failed on rpc listener");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                let peer = NodeId::new(addr.ip(), addr.port());
                let handler = Arc::clone(&handler);
                if let Ok(conn) = Connection::from_stream(peer, stream) {
                    std::thread::spawn(move || serve_connection(conn, handler));
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(e) => {
                warn!(error = %e, "transient accept error on rpc listener");
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
}

fn serve_connection<H: RequestHandler>(conn: Arc<Connection>, handler: Arc<H>) {
    let Ok(reader) = conn.reader() else { return };
    read_loop(reader, move |kind, payload| {
        if kind == REPLY_KIND {
            // A reply arrived on a connection we're serving as acceptor;
            // nothing to route it to here, drop it.
            return true;
        }
        let Some(req_kind) = RequestKind::from_byte(kind) else {
            return true;
        };
        let Some((request_id, body)) = decode_request(&payload) else {
            return true;
        };

        let (status, reply_body) = handler.handle(req_kind, body);
        let reply = encode_reply(request_id, status, &reply_body);
        conn.send_frame(REPLY_KIND, &reply).is_ok()
    });
}
