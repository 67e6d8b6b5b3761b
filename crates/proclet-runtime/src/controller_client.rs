//! Client stub for the controller service (§4.4): turns each
//! `Controller` method into a `RequestKind`-tagged RPC, plus the
//! location-directory cache every other node keeps so most calls never
//! have to ask the controller at all.

use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::RwLock;
use proclet_common::error::{CallError, ControllerError};
use proclet_common::ids::{LpId, NodeId, ProcletId};
use proclet_common::resource::Resource;
use proclet_ctrl::GlobalView;
use proclet_rpc::RpcClient;
use proclet_wire::RequestKind;
use rustc_hash::FxHashMap;

fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}
fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

fn get_u8(cur: &mut Cursor<&[u8]>) -> u8 {
    let mut b = [0u8; 1];
    cur.read_exact(&mut b).expect("truncated controller rpc payload");
    b[0]
}
fn get_u16(cur: &mut Cursor<&[u8]>) -> u16 {
    let mut b = [0u8; 2];
    cur.read_exact(&mut b).expect("truncated controller rpc payload");
    u16::from_le_bytes(b)
}
fn get_u32(cur: &mut Cursor<&[u8]>) -> u32 {
    let mut b = [0u8; 4];
    cur.read_exact(&mut b).expect("truncated controller rpc payload");
    u32::from_le_bytes(b)
}
fn get_u64(cur: &mut Cursor<&[u8]>) -> u64 {
    let mut b = [0u8; 8];
    cur.read_exact(&mut b).expect("truncated controller rpc payload");
    u64::from_le_bytes(b)
}
fn get_bool(cur: &mut Cursor<&[u8]>) -> bool {
    get_u8(cur) != 0
}

fn put_node(buf: &mut Vec<u8>, node: NodeId) {
    match node.ip {
        IpAddr::V4(a) => {
            put_u8(buf, 4);
            buf.extend_from_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            put_u8(buf, 6);
            buf.extend_from_slice(&a.octets());
        }
    }
    put_u16(buf, node.port);
}

fn get_node(cur: &mut Cursor<&[u8]>) -> NodeId {
    let ip = match get_u8(cur) {
        4 => {
            let mut octets = [0u8; 4];
            cur.read_exact(&mut octets).expect("truncated ipv4");
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            let mut octets = [0u8; 16];
            cur.read_exact(&mut octets).expect("truncated ipv6");
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => panic!("unknown ip tag {other}"),
    };
    let port = get_u16(cur);
    NodeId::new(ip, port)
}

fn put_option_node(buf: &mut Vec<u8>, node: Option<NodeId>) {
    match node {
        Some(n) => {
            put_u8(buf, 1);
            put_node(buf, n);
        }
        None => put_u8(buf, 0),
    }
}

fn get_option_node(cur: &mut Cursor<&[u8]>) -> Option<NodeId> {
    if get_u8(cur) != 0 {
        Some(get_node(cur))
    } else {
        None
    }
}

fn put_lpid(buf: &mut Vec<u8>, lpid: LpId) {
    put_u16(buf, lpid.0);
}
fn get_lpid(cur: &mut Cursor<&[u8]>) -> LpId {
    LpId(get_u16(cur))
}

fn put_proclet_id(buf: &mut Vec<u8>, id: ProcletId) {
    put_u64(buf, id.0);
}
fn get_proclet_id(cur: &mut Cursor<&[u8]>) -> ProcletId {
    ProcletId(get_u64(cur))
}

fn put_resource(buf: &mut Vec<u8>, r: Resource) {
    put_u32(buf, r.cores);
    put_u64(buf, r.mem_mbs);
}
fn get_resource(cur: &mut Cursor<&[u8]>) -> Resource {
    let cores = get_u32(cur);
    let mem_mbs = get_u64(cur);
    Resource::new(cores, mem_mbs)
}

fn put_global_view(buf: &mut Vec<u8>, view: &GlobalView) {
    put_u32(buf, view.len() as u32);
    for (node, resource) in view {
        put_node(buf, *node);
        put_resource(buf, *resource);
    }
}
fn get_global_view(cur: &mut Cursor<&[u8]>) -> GlobalView {
    let len = get_u32(cur);
    (0..len).map(|_| (get_node(cur), get_resource(cur))).collect()
}

fn put_controller_error(buf: &mut Vec<u8>, err: &ControllerError) {
    match err {
        ControllerError::UnknownLp(lpid) => {
            put_u8(buf, 0);
            put_lpid(buf, *lpid);
        }
        ControllerError::LpDestroying(lpid) => {
            put_u8(buf, 1);
            put_lpid(buf, *lpid);
        }
        ControllerError::ImageHashMismatch(node) => {
            put_u8(buf, 2);
            put_node(buf, *node);
        }
        ControllerError::UnknownNode(node, lpid) => {
            put_u8(buf, 3);
            put_node(buf, *node);
            put_lpid(buf, *lpid);
        }
        ControllerError::OutOfSegments(cap) => {
            put_u8(buf, 4);
            put_u64(buf, *cap);
        }
        ControllerError::NodeAlreadyAcquired(node) => {
            put_u8(buf, 5);
            put_node(buf, *node);
        }
        ControllerError::NoEligibleNode(lpid) => {
            put_u8(buf, 6);
            put_lpid(buf, *lpid);
        }
    }
}

fn get_controller_error(cur: &mut Cursor<&[u8]>) -> ControllerError {
    match get_u8(cur) {
        0 => ControllerError::UnknownLp(get_lpid(cur)),
        1 => ControllerError::LpDestroying(get_lpid(cur)),
        2 => ControllerError::ImageHashMismatch(get_node(cur)),
        3 => ControllerError::UnknownNode(get_node(cur), get_lpid(cur)),
        4 => ControllerError::OutOfSegments(get_u64(cur)),
        5 => ControllerError::NodeAlreadyAcquired(get_node(cur)),
        6 => ControllerError::NoEligibleNode(get_lpid(cur)),
        other => panic!("unknown controller error tag {other}"),
    }
}

/// Wraps a reply body as `[1][...ok]` or `[0][...err]`. Used on the
/// server side handling these `RequestKind`s; the client mirrors it here.
pub fn encode_ok(body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = vec![1u8];
    body(&mut buf);
    buf
}

pub fn encode_err(err: &ControllerError) -> Vec<u8> {
    let mut buf = vec![0u8];
    put_controller_error(&mut buf, err);
    buf
}

fn decode_result<T>(bytes: &[u8], read_ok: impl FnOnce(&mut Cursor<&[u8]>) -> T) -> Result<T, ControllerError> {
    let mut cur = Cursor::new(bytes);
    if get_u8(&mut cur) != 0 {
        Ok(read_ok(&mut cur))
    } else {
        Err(get_controller_error(&mut cur))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerCallError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// RPC stub talking to whichever node hosts the controller for this LP,
/// with a location-directory cache so most `resolve_proclet` calls are
/// answered locally instead of round-tripping.
pub struct ControllerClient {
    rpc: Arc<RpcClient>,
    controller_node: NodeId,
    location_cache: RwLock<FxHashMap<ProcletId, NodeId>>,
}

impl ControllerClient {
    pub fn new(rpc: Arc<RpcClient>, controller_node: NodeId) -> Self {
        ControllerClient {
            rpc,
            controller_node,
            location_cache: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn controller_node(&self) -> NodeId {
        self.controller_node
    }

    /// Served from the local cache when present; callers fall back to
    /// [`Self::resolve_proclet`] on a miss or after [`Self::invalidate_location`].
    pub fn cached_location(&self, id: ProcletId) -> Option<NodeId> {
        self.location_cache.read().get(&id).copied()
    }

    /// Update the cache from a migration-commit notification, without a
    /// round trip to the controller.
    pub fn note_location(&self, id: ProcletId, node: NodeId) {
        self.location_cache.write().insert(id, node);
    }

    /// Drop a stale cache entry, typically after a `WrongClient` reply
    /// from the cached node.
    pub fn invalidate_location(&self, id: ProcletId) {
        self.location_cache.write().remove(&id);
    }

    pub fn register_node(
        &self,
        ip: NodeId,
        lpid: LpId,
        image_hash: u64,
        isolated: bool,
    ) -> Result<(LpId, (u64, u64)), ControllerCallError> {
        let mut payload = Vec::new();
        put_node(&mut payload, ip);
        put_lpid(&mut payload, lpid);
        put_u64(&mut payload, image_hash);
        put_bool(&mut payload, isolated);

        let reply = self.rpc.call(self.controller_node, RequestKind::RegisterNode, &payload)?;
        decode_result(&reply, |cur| {
            let lpid = get_lpid(cur);
            let base = get_u64(cur);
            let len = get_u64(cur);
            (lpid, (base, len))
        })
        .map_err(Into::into)
    }

    pub fn allocate_proclet(
        &self,
        lpid: LpId,
        capacity_bytes: u64,
        ip_hint: Option<NodeId>,
    ) -> Result<(ProcletId, NodeId), ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_u64(&mut payload, capacity_bytes);
        put_option_node(&mut payload, ip_hint);

        let reply = self.rpc.call(self.controller_node, RequestKind::AllocateProclet, &payload)?;
        let (proclet_id, node) = decode_result(&reply, |cur| (get_proclet_id(cur), get_node(cur)))?;
        self.note_location(proclet_id, node);
        Ok((proclet_id, node))
    }

    pub fn destroy_proclet(
        &self,
        lpid: LpId,
        proclet_id: ProcletId,
        last_host: NodeId,
    ) -> Result<(), ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_proclet_id(&mut payload, proclet_id);
        put_node(&mut payload, last_host);

        let reply = self.rpc.call(self.controller_node, RequestKind::DestroyProclet, &payload)?;
        decode_result(&reply, |_| ())?;
        self.invalidate_location(proclet_id);
        Ok(())
    }

    pub fn resolve_proclet(&self, lpid: LpId, proclet_id: ProcletId) -> Result<Option<NodeId>, ControllerCallError> {
        if let Some(node) = self.cached_location(proclet_id) {
            return Ok(Some(node));
        }
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_proclet_id(&mut payload, proclet_id);

        let reply = self.rpc.call(self.controller_node, RequestKind::ResolveProclet, &payload)?;
        let found = decode_result(&reply, get_option_node)?;
        if let Some(node) = found {
            self.note_location(proclet_id, node);
        }
        Ok(found)
    }

    pub fn acquire_migration_dest(
        &self,
        lpid: LpId,
        src: NodeId,
        has_mem_pressure: bool,
        need: Resource,
    ) -> Result<Option<(NodeId, GlobalView)>, ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_node(&mut payload, src);
        put_bool(&mut payload, has_mem_pressure);
        put_resource(&mut payload, need);

        let reply = self.rpc.call(self.controller_node, RequestKind::AcquireMigrationDest, &payload)?;
        decode_result(&reply, |cur| {
            if get_u8(cur) == 0 {
                None
            } else {
                let node = get_node(cur);
                let view = get_global_view(cur);
                Some((node, view))
            }
        })
        .map_err(Into::into)
    }

    pub fn acquire_node(&self, lpid: LpId, ip: NodeId) -> Result<bool, ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_node(&mut payload, ip);

        let reply = self.rpc.call(self.controller_node, RequestKind::AcquireNode, &payload)?;
        decode_result(&reply, get_bool).map_err(Into::into)
    }

    pub fn release_node(&self, lpid: LpId, ip: NodeId) -> Result<(), ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_node(&mut payload, ip);

        let reply = self.rpc.call(self.controller_node, RequestKind::ReleaseNode, &payload)?;
        decode_result(&reply, |_| ()).map_err(Into::into)
    }

    pub fn update_location(&self, lpid: LpId, proclet_id: ProcletId, node: NodeId) -> Result<(), ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_proclet_id(&mut payload, proclet_id);
        put_node(&mut payload, node);

        let reply = self.rpc.call(self.controller_node, RequestKind::UpdateLocation, &payload)?;
        decode_result(&reply, |_| ())?;
        self.note_location(proclet_id, node);
        Ok(())
    }

    pub fn report_free_resource(
        &self,
        lpid: LpId,
        ip: NodeId,
        resource: Resource,
    ) -> Result<GlobalView, ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_node(&mut payload, ip);
        put_resource(&mut payload, resource);

        let reply = self.rpc.call(self.controller_node, RequestKind::ReportFreeResource, &payload)?;
        decode_result(&reply, |cur| get_global_view(cur)).map_err(Into::into)
    }

    pub fn destroy_lp(&self, lpid: LpId, requester: NodeId) -> Result<Vec<NodeId>, ControllerCallError> {
        let mut payload = Vec::new();
        put_lpid(&mut payload, lpid);
        put_node(&mut payload, requester);

        let reply = self.rpc.call(self.controller_node, RequestKind::DestroyLp, &payload)?;
        decode_result(&reply, |cur| {
            let len = get_u32(cur);
            (0..len).map(|_| get_node(cur)).collect()
        })
        .map_err(Into::into)
    }
}

/// Encodes the server-side reply for each controller `RequestKind`, kept
/// next to the client's decoders above so the wire layout for each op
/// stays in one file. The node hosting the controller wires this into a
/// [`proclet_rpc::RequestHandler`] alongside a live [`proclet_ctrl::Controller`].
pub mod server_encoding {
    use super::*;

    pub fn register_node_reply(result: Result<(LpId, (u64, u64)), ControllerError>) -> Vec<u8> {
        match result {
            Ok((lpid, (base, len))) => encode_ok(|buf| {
                put_lpid(buf, lpid);
                put_u64(buf, base);
                put_u64(buf, len);
            }),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_register_node_request(bytes: &[u8]) -> (NodeId, LpId, u64, bool) {
        let mut cur = Cursor::new(bytes);
        (get_node(&mut cur), get_lpid(&mut cur), get_u64(&mut cur), get_bool(&mut cur))
    }

    pub fn allocate_proclet_reply(result: Result<(ProcletId, NodeId), ControllerError>) -> Vec<u8> {
        match result {
            Ok((id, node)) => encode_ok(|buf| {
                put_proclet_id(buf, id);
                put_node(buf, node);
            }),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_allocate_proclet_request(bytes: &[u8]) -> (LpId, u64, Option<NodeId>) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_u64(&mut cur), get_option_node(&mut cur))
    }

    pub fn unit_reply(result: Result<(), ControllerError>) -> Vec<u8> {
        match result {
            Ok(()) => encode_ok(|_| {}),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_destroy_proclet_request(bytes: &[u8]) -> (LpId, ProcletId, NodeId) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_proclet_id(&mut cur), get_node(&mut cur))
    }

    pub fn resolve_proclet_reply(result: Option<NodeId>) -> Vec<u8> {
        encode_ok(|buf| put_option_node(buf, result))
    }

    pub fn decode_resolve_proclet_request(bytes: &[u8]) -> (LpId, ProcletId) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_proclet_id(&mut cur))
    }

    pub fn acquire_migration_dest_reply(result: Result<Option<(NodeId, GlobalView)>, ControllerError>) -> Vec<u8> {
        match result {
            Ok(found) => encode_ok(|buf| match found {
                Some((node, view)) => {
                    put_u8(buf, 1);
                    put_node(buf, node);
                    put_global_view(buf, &view);
                }
                None => put_u8(buf, 0),
            }),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_acquire_migration_dest_request(bytes: &[u8]) -> (LpId, NodeId, bool, Resource) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_node(&mut cur), get_bool(&mut cur), get_resource(&mut cur))
    }

    pub fn bool_reply(result: Result<bool, ControllerError>) -> Vec<u8> {
        match result {
            Ok(v) => encode_ok(|buf| put_bool(buf, v)),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_node_lp_request(bytes: &[u8]) -> (LpId, NodeId) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_node(&mut cur))
    }

    pub fn decode_update_location_request(bytes: &[u8]) -> (LpId, ProcletId, NodeId) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_proclet_id(&mut cur), get_node(&mut cur))
    }

    pub fn decode_report_free_resource_request(bytes: &[u8]) -> (LpId, NodeId, Resource) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_node(&mut cur), get_resource(&mut cur))
    }

    pub fn global_view_reply(result: Result<GlobalView, ControllerError>) -> Vec<u8> {
        match result {
            Ok(view) => encode_ok(|buf| put_global_view(buf, &view)),
            Err(e) => encode_err(&e),
        }
    }

    pub fn decode_destroy_lp_request(bytes: &[u8]) -> (LpId, NodeId) {
        let mut cur = Cursor::new(bytes);
        (get_lpid(&mut cur), get_node(&mut cur))
    }

    pub fn node_list_reply(result: Result<Vec<NodeId>, ControllerError>) -> Vec<u8> {
        match result {
            Ok(nodes) => encode_ok(|buf| {
                put_u32(buf, nodes.len() as u32);
                for n in nodes {
                    put_node(buf, n);
                }
            }),
            Err(e) => encode_err(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node(n: u8) -> NodeId {
        NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 9000)
    }

    #[test]
    fn node_roundtrips_v4_and_v6() {
        let mut buf = Vec::new();
        put_node(&mut buf, node(7));
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(get_node(&mut cur), node(7));

        let v6 = NodeId::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1234);
        let mut buf = Vec::new();
        put_node(&mut buf, v6);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(get_node(&mut cur), v6);
    }

    #[test]
    fn controller_error_roundtrips_every_variant() {
        let lpid = LpId(3);
        let errs = vec![
            ControllerError::UnknownLp(lpid),
            ControllerError::LpDestroying(lpid),
            ControllerError::ImageHashMismatch(node(1)),
            ControllerError::UnknownNode(node(1), lpid),
            ControllerError::OutOfSegments(4096),
            ControllerError::NodeAlreadyAcquired(node(2)),
            ControllerError::NoEligibleNode(lpid),
        ];
        for err in errs {
            let mut buf = Vec::new();
            put_controller_error(&mut buf, &err);
            let mut cur = Cursor::new(buf.as_slice());
            assert_eq!(get_controller_error(&mut cur), err);
        }
    }

    #[test]
    fn global_view_roundtrip() {
        let view: GlobalView = vec![(node(1), Resource::new(4, 1024)), (node(2), Resource::new(2, 512))];
        let mut buf = Vec::new();
        put_global_view(&mut buf, &view);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(get_global_view(&mut cur), view);
    }

    #[test]
    fn location_cache_populated_by_allocate_and_cleared_by_destroy() {
        let client = ControllerClient::new(Arc::new(RpcClient::new(std::time::Duration::from_millis(50))), node(9));
        let id = ProcletId(0x1000);
        assert!(client.cached_location(id).is_none());
        client.note_location(id, node(1));
        assert_eq!(client.cached_location(id), Some(node(1)));
        client.invalidate_location(id);
        assert!(client.cached_location(id).is_none());
    }
}
