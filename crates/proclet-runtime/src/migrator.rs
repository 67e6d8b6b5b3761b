//! Migrator (§4.3, C9): moves a batch of proclets from this node to a
//! destination the pressure handler already picked, over a dedicated TCP
//! connection separate from the shared request/reply fabric
//! [`proclet_rpc`] uses.
//!
//! In-flight call forwarding (§4.3 "at the moment step 4(d) begins,
//! in-flight RPCs... are re-routed") has no separate code path here: a
//! proclet cannot reach `remove_for_migration` while [`InvocationEngine`]
//! holds its RCU reader guard, and this migrator's writer-sync
//! ([`crate::rcu::RcuLock::sync`]) blocks precisely until that guard is
//! released. A call already in flight always finishes and replies over the
//! connection it arrived on before its proclet's heap is copied anywhere.
//!
//! [`InvocationEngine`]: crate::invocation::InvocationEngine
//!
//! Thread migration mid-call (§4.3 "the thread itself is snapshotted...
//! and sent to the destination") is likewise not a separate path: the
//! same writer-sync guarantee means no thread is ever inside a method body
//! when its proclet starts moving, so there is nothing to snapshot beyond
//! the blocked-thread and timer state already carried by
//! [`crate::blocked_syncer::BlockedSyncer`] and [`crate::clock::LogicalClock`].

use std::io::{self, Cursor, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use proclet_alloc::slab::Slab;
use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_common::MigrationOutcome;
use proclet_wire::{read_frame, write_frame, FrameError, MigrationOpcode};
use thiserror::Error;

use crate::blocked_syncer::BlockReason;
use crate::clock::TimerEntry;
use crate::controller_client::{ControllerCallError, ControllerClient};
use crate::proclet::{Proclet, ProcletManager};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("io error talking to migration destination: {0}")]
    Io(#[from] io::Error),
    #[error("malformed migration frame: {0}")]
    Frame(#[from] FrameError),
    #[error("controller call failed during migration: {0}")]
    Controller(#[from] ControllerCallError),
    #[error("destination sent an unexpected reply opcode {0:#x}")]
    UnexpectedReply(u8),
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn get_u64(cur: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let mut b = [0u8; 8];
    cur.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}
fn get_i64(cur: &mut Cursor<&[u8]>) -> io::Result<i64> {
    let mut b = [0u8; 8];
    cur.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}
fn get_u8(cur: &mut Cursor<&[u8]>) -> io::Result<u8> {
    let mut b = [0u8; 1];
    cur.read_exact(&mut b)?;
    Ok(b[0])
}

/// Header sent once, bracketed by `EnablePoll`/`DisablePoll` frames, ahead
/// of a batch's `CopyProclet`/`SkipProclet` stream (§4.3 step 2).
struct BatchHeader {
    has_mem_pressure: bool,
    count: u32,
}

fn encode_batch_header(h: &BatchHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    put_u8(&mut buf, h.has_mem_pressure as u8);
    buf.extend_from_slice(&h.count.to_le_bytes());
    buf
}

fn decode_batch_header(bytes: &[u8]) -> io::Result<BatchHeader> {
    let mut cur = Cursor::new(bytes);
    let has_mem_pressure = get_u8(&mut cur)? != 0;
    let mut count_buf = [0u8; 4];
    cur.read_exact(&mut count_buf)?;
    Ok(BatchHeader { has_mem_pressure, count: u32::from_le_bytes(count_buf) })
}

/// Everything the destination needs to reconstruct one proclet's runtime
/// control block (§4.3 step 4e).
struct ProcletEntry {
    id: ProcletId,
    segment_shift: u8,
    capacity_bytes: u64,
    used_bytes: u64,
    logical_now_nanos: i64,
    blocked: Vec<(u64, BlockReason)>,
    timers: Vec<TimerEntry>,
}

fn put_block_reason(buf: &mut Vec<u8>, reason: BlockReason) {
    match reason {
        BlockReason::Mutex { resource_id } => {
            put_u8(buf, 0);
            put_u64(buf, resource_id);
        }
        BlockReason::Condvar { resource_id } => {
            put_u8(buf, 1);
            put_u64(buf, resource_id);
        }
        BlockReason::Timer => put_u8(buf, 2),
    }
}

fn get_block_reason(cur: &mut Cursor<&[u8]>) -> io::Result<BlockReason> {
    Ok(match get_u8(cur)? {
        0 => BlockReason::Mutex { resource_id: get_u64(cur)? },
        1 => BlockReason::Condvar { resource_id: get_u64(cur)? },
        2 => BlockReason::Timer,
        other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad block reason tag {other}"))),
    })
}

fn encode_proclet_entry(e: &ProcletEntry) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u64(&mut buf, e.id.0);
    put_u8(&mut buf, e.segment_shift);
    put_u64(&mut buf, e.capacity_bytes);
    put_u64(&mut buf, e.used_bytes);
    put_i64(&mut buf, e.logical_now_nanos);

    buf.extend_from_slice(&(e.blocked.len() as u32).to_le_bytes());
    for (token, reason) in &e.blocked {
        put_u64(&mut buf, *token);
        put_block_reason(&mut buf, *reason);
    }

    buf.extend_from_slice(&(e.timers.len() as u32).to_le_bytes());
    for timer in &e.timers {
        put_i64(&mut buf, timer.logical_deadline_nanos);
        put_u64(&mut buf, timer.thread_token);
    }
    buf
}

fn decode_proclet_entry(bytes: &[u8]) -> io::Result<ProcletEntry> {
    let mut cur = Cursor::new(bytes);
    let id = ProcletId(get_u64(&mut cur)?);
    let segment_shift = get_u8(&mut cur)?;
    let capacity_bytes = get_u64(&mut cur)?;
    let used_bytes = get_u64(&mut cur)?;
    let logical_now_nanos = get_i64(&mut cur)?;

    let mut count_buf = [0u8; 4];
    cur.read_exact(&mut count_buf)?;
    let blocked_count = u32::from_le_bytes(count_buf);
    let mut blocked = Vec::with_capacity(blocked_count as usize);
    for _ in 0..blocked_count {
        let token = get_u64(&mut cur)?;
        let reason = get_block_reason(&mut cur)?;
        blocked.push((token, reason));
    }

    cur.read_exact(&mut count_buf)?;
    let timer_count = u32::from_le_bytes(count_buf);
    let mut timers = Vec::with_capacity(timer_count as usize);
    for _ in 0..timer_count {
        let logical_deadline_nanos = get_i64(&mut cur)?;
        let thread_token = get_u64(&mut cur)?;
        timers.push(TimerEntry { logical_deadline_nanos, thread_token });
    }

    Ok(ProcletEntry { id, segment_shift, capacity_bytes, used_bytes, logical_now_nanos, blocked, timers })
}

fn encode_id(id: ProcletId) -> Vec<u8> {
    id.0.to_le_bytes().to_vec()
}

fn decode_id(bytes: &[u8]) -> io::Result<ProcletId> {
    let mut cur = Cursor::new(bytes);
    Ok(ProcletId(get_u64(&mut cur)?))
}

/// One outcome per proclet the caller asked to move.
pub struct MigrationReport {
    pub outcomes: Vec<(ProcletId, MigrationOutcome)>,
}

impl MigrationReport {
    pub fn moved_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == MigrationOutcome::Moved).count()
    }
}

/// Source-side driver of one migration batch.
pub struct Migrator {
    local_node: NodeId,
    manager: Arc<ProcletManager>,
    controller: Arc<ControllerClient>,
}

impl Migrator {
    pub fn new(local_node: NodeId, manager: Arc<ProcletManager>, controller: Arc<ControllerClient>) -> Self {
        Migrator { local_node, manager, controller }
    }

    /// Executes §4.3 steps 2-6 for one batch already approved by
    /// [`crate::pressure::PressureHandler::acquire_destination`].
    pub fn migrate_batch(
        &self,
        lpid: LpId,
        batch: &[ProcletId],
        dest: NodeId,
        has_mem_pressure: bool,
    ) -> Result<MigrationReport, MigrationError> {
        let mut stream = TcpStream::connect((dest.ip, dest.port))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, MigrationOpcode::EnablePoll as u8, &encode_batch_header(&BatchHeader {
            has_mem_pressure,
            count: batch.len() as u32,
        }))?;

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut denied_trailing = false;

        for &id in batch {
            if denied_trailing {
                // §4.3 step 6: the destination already denied this batch;
                // every remaining entry never got a chance to migrate
                // because of that denial, not because it was independently
                // unresolvable locally, so it gets the same outcome as the
                // entry that triggered it rather than `SkipProclet`.
                outcomes.push((id, MigrationOutcome::DestinationDenied));
                continue;
            }

            let Some(proclet) = self.manager.remove_for_migration(id) else {
                write_frame(&mut stream, MigrationOpcode::SkipProclet as u8, &encode_id(id))?;
                outcomes.push((id, MigrationOutcome::SkipProclet));
                continue;
            };

            // §4.3 step 4b: wait for every in-flight call to detach.
            let _writer = proclet.rcu.sync();

            let entry = ProcletEntry {
                id,
                segment_shift: proclet.segment_shift,
                capacity_bytes: proclet.slab().capacity(),
                used_bytes: proclet.slab().used_bytes(),
                logical_now_nanos: proclet.clock.logical_now_nanos(),
                blocked: proclet.blocked.drain_for_migration(),
                timers: proclet.clock.drain_all_timers(),
            };

            write_frame(&mut stream, MigrationOpcode::CopyProclet as u8, &encode_proclet_entry(&entry))?;
            let (reply_kind, reply_body) = read_frame(&mut stream)?;
            match MigrationOpcode::from_byte(reply_kind) {
                Some(MigrationOpcode::Migrate) => {
                    self.controller.update_location(lpid, id, dest)?;
                    self.manager.cleanup(id);
                    outcomes.push((id, MigrationOutcome::Moved));
                }
                Some(MigrationOpcode::SkipProclet) => {
                    // §4.3 step 6: destination denied under new pressure;
                    // the proclet we pulled out of Present rolls back.
                    let _ = decode_id(&reply_body);
                    proclet.blocked.restore(entry.blocked);
                    for timer in entry.timers {
                        proclet.clock.carry_timer(timer);
                    }
                    self.manager.setup(proclet);
                    outcomes.push((id, MigrationOutcome::DestinationDenied));
                    denied_trailing = true;
                }
                _ => return Err(MigrationError::UnexpectedReply(reply_kind)),
            }
        }

        write_frame(&mut stream, MigrationOpcode::DisablePoll as u8, &[])?;
        Ok(MigrationReport { outcomes })
    }
}

/// Admission check the destination runs per proclet before committing to
/// receive it (§4.3 step 6: "if destination pressure rises during the
/// batch it denies the remaining proclets").
pub trait DestinationAdmission: Send + Sync {
    fn admit(&self, capacity_bytes: u64) -> bool;
}

pub struct AlwaysAdmit;
impl DestinationAdmission for AlwaysAdmit {
    fn admit(&self, _capacity_bytes: u64) -> bool {
        true
    }
}

/// Destination-side receiver: one instance serves one dedicated connection
/// for the lifetime of a batch (§4.3 step 3, 5).
pub struct MigrationReceiver {
    manager: Arc<ProcletManager>,
    admission: Arc<dyn DestinationAdmission>,
}

impl MigrationReceiver {
    pub fn new(manager: Arc<ProcletManager>, admission: Arc<dyn DestinationAdmission>) -> Self {
        MigrationReceiver { manager, admission }
    }

    /// Drive one incoming dedicated connection to completion. Returns once
    /// the peer sends `DisablePoll` or closes the socket.
    pub fn serve(&self, mut stream: TcpStream) -> Result<(), MigrationError> {
        loop {
            let (kind, body) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(_) => return Ok(()),
            };
            match MigrationOpcode::from_byte(kind) {
                Some(MigrationOpcode::EnablePoll) => {
                    let _header = decode_batch_header(&body)
                        .map_err(|e| MigrationError::Frame(FrameError::Io(e)))?;
                }
                Some(MigrationOpcode::CopyProclet) => {
                    let entry = decode_proclet_entry(&body).map_err(|e| MigrationError::Frame(FrameError::Io(e)))?;
                    if self.admission.admit(entry.capacity_bytes) {
                        self.receive_proclet(entry);
                        write_frame(&mut stream, MigrationOpcode::Migrate as u8, &[])?;
                    } else {
                        write_frame(&mut stream, MigrationOpcode::SkipProclet as u8, &encode_id(entry.id))?;
                    }
                }
                Some(MigrationOpcode::SkipProclet) => {
                    // Source itself skipped this id; nothing to do here.
                }
                Some(MigrationOpcode::DisablePoll) => return Ok(()),
                _ => return Ok(()),
            }
        }
    }

    fn receive_proclet(&self, entry: ProcletEntry) {
        let slab = Arc::new(Slab::new(entry.id.0, entry.capacity_bytes, 1));
        let proclet = Arc::new(Proclet::new(entry.id, entry.segment_shift, slab));
        proclet.clock.rebase(entry.logical_now_nanos);
        proclet.blocked.restore(entry.blocked);
        for timer in entry.timers {
            proclet.clock.carry_timer(timer);
        }
        // Broadcasts the status-Present condvar so invocation-engine
        // attach waiters (§4.1 step 1) advance (§4.3 step 5).
        self.manager.setup(proclet);
    }
}

/// Binds a listener for inbound dedicated migration connections and
/// spawns one [`MigrationReceiver::serve`] thread per connection.
pub struct MigrationListener {
    listener: TcpListener,
    manager: Arc<ProcletManager>,
    admission: Arc<dyn DestinationAdmission>,
}

impl MigrationListener {
    pub fn bind(addr: (std::net::IpAddr, u16), manager: Arc<ProcletManager>, admission: Arc<dyn DestinationAdmission>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(MigrationListener { listener, manager, admission })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts connections until the listener is dropped or errors out.
    /// Intended to be spawned on its own thread by the node entry point.
    pub fn run(self: Arc<Self>) {
        for incoming in self.listener.incoming() {
            let Ok(stream) = incoming else { continue };
            let receiver = MigrationReceiver::new(Arc::clone(&self.manager), Arc::clone(&self.admission));
            std::thread::spawn(move || {
                if let Err(err) = receiver.serve(stream) {
                    tracing::warn!(error = %err, "migration connection ended with an error");
                }
            });
        }
    }
}
