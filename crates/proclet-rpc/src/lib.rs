//! RPC fabric: framed, credit-bounded connections between node pairs, a
//! blocking client with request/reply correlation, and a threaded server
//! accept loop (§6).

pub mod client;
pub mod connection;
pub mod envelope;
pub mod server;

pub use client::RpcClient;
pub use connection::Connection;
pub use server::{RequestHandler, RpcServer};

#[cfg(test)]
mod tests {
    use super::*;
    use proclet_common::error::WireStatus;
    use proclet_common::ids::NodeId;
    use proclet_wire::RequestKind;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn client_server_roundtrip() {
        let handler = Arc::new(|kind: RequestKind, body: &[u8]| -> (WireStatus, Vec<u8>) {
            assert_eq!(kind, RequestKind::ProcletCall);
            let mut echoed = body.to_vec();
            echoed.push(0xAA);
            (WireStatus::Ok, echoed)
        });

        let server = RpcServer::spawn((IpAddr::V4(Ipv4Addr::LOCALHOST), 0), handler).unwrap();
        let addr = server.local_addr();
        let peer = NodeId::new(addr.ip(), addr.port());

        let client = RpcClient::new(Duration::from_secs(2));
        let reply = client.call(peer, RequestKind::ProcletCall, b"ping").unwrap();
        assert_eq!(reply, vec![b'p', b'i', b'n', b'g', 0xAA]);

        server.shutdown();
    }

    #[test]
    fn wrong_client_status_surfaces_as_error() {
        let handler = Arc::new(|_: RequestKind, _: &[u8]| (WireStatus::WrongClient, Vec::new()));
        let server = RpcServer::spawn((IpAddr::V4(Ipv4Addr::LOCALHOST), 0), handler).unwrap();
        let addr = server.local_addr();
        let peer = NodeId::new(addr.ip(), addr.port());

        let client = RpcClient::new(Duration::from_secs(2));
        let err = client.call(peer, RequestKind::ResolveProclet, b"").unwrap_err();
        assert!(matches!(err, proclet_common::error::CallError::WrongClient(_)));

        server.shutdown();
    }

    #[test]
    fn call_to_nothing_listening_times_out_fast() {
        let client = RpcClient::new(Duration::from_millis(200));
        let dead = NodeId::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let err = client.call(dead, RequestKind::Shutdown, b"").unwrap_err();
        assert!(matches!(err, proclet_common::error::CallError::Timeout(_)));
    }

    #[test]
    fn concurrent_calls_on_one_connection_get_their_own_reply() {
        let handler = Arc::new(|_: RequestKind, body: &[u8]| (WireStatus::Ok, body.to_vec()));
        let server = RpcServer::spawn((IpAddr::V4(Ipv4Addr::LOCALHOST), 0), handler).unwrap();
        let addr = server.local_addr();
        let peer = NodeId::new(addr.ip(), addr.port());
        let client = Arc::new(RpcClient::new(Duration::from_secs(2)));

        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let client = Arc::clone(&client);
                std::thread::spawn(move || {
                    let reply = client.call(peer, RequestKind::ProcletCall, &[i]).unwrap();
                    assert_eq!(reply, vec![i]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        server.shutdown();
    }
}
