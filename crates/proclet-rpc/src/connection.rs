//! A single framed TCP connection between two nodes.
//!
//! Mirrors the source's node-session shape: one `TcpStream`, writes
//! serialized through a mutex, reads driven by a dedicated thread per
//! connection so a slow peer never blocks anyone else's send.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use proclet_common::ids::NodeId;
use proclet_wire::{read_frame, write_frame, FrameError};

/// In-flight requests allowed on one connection before a sender blocks
/// waiting for a credit back (§6 "credit-bounded"). Crude compared to the
/// source's per-flow credit windows, but it bounds the same thing: how far
/// a fast sender can get ahead of a slow peer's replies.
const DEFAULT_CREDITS: usize = 256;

pub struct Connection {
    pub peer: NodeId,
    writer: Mutex<TcpStream>,
    reader_source: TcpStream,
    credit_tx: Sender<()>,
    credit_rx: Receiver<()>,
}

impl Connection {
    pub fn from_stream(peer: NodeId, stream: TcpStream) -> io::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let reader_source = stream.try_clone()?;
        let (credit_tx, credit_rx) = bounded(DEFAULT_CREDITS);
        for _ in 0..DEFAULT_CREDITS {
            let _ = credit_tx.send(());
        }
        Ok(Arc::new(Connection {
            peer,
            writer: Mutex::new(stream),
            reader_source,
            credit_tx,
            credit_rx,
        }))
    }

    /// Block until a send credit is available, send the frame, and leave
    /// the credit spent; callers return it via [`Connection::release_credit`]
    /// once the matching reply (or a timeout) retires the request.
    pub fn send_frame_with_credit(&self, kind: u8, payload: &[u8]) -> Result<(), FrameError> {
        let _ = self.credit_rx.recv();
        let result = self.send_frame(kind, payload);
        if result.is_err() {
            self.release_credit();
        }
        result
    }

    pub fn release_credit(&self) {
        let _ = self.credit_tx.try_send(());
    }

    pub fn send_frame(&self, kind: u8, payload: &[u8]) -> Result<(), FrameError> {
        let mut w = self.writer.lock();
        write_frame(&mut *w, kind, payload)
    }

    /// A reader handle a background thread can loop on with `read_frame`.
    /// Cloning a `TcpStream` shares the same underlying socket, so reads
    /// here do not contend with `send_frame`'s writer lock.
    pub fn reader(&self) -> io::Result<TcpStream> {
        self.reader_source.try_clone()
    }
}

/// Read one frame at a time off `stream` until the peer closes or a frame
/// comes back malformed.
pub fn read_loop(mut stream: TcpStream, mut on_frame: impl FnMut(u8, Vec<u8>) -> bool) {
    loop {
        match read_frame(&mut stream) {
            Ok((kind, payload)) => {
                if !on_frame(kind, payload) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}
