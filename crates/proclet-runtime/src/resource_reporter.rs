//! Periodic free-resource reporting to the controller, with a locally
//! cached copy of the last global view so the pressure handler and
//! migrator don't each need their own round trip (§4.4, §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use proclet_common::ids::{LpId, NodeId};
use proclet_common::resource::Resource;
use proclet_ctrl::GlobalView;

use crate::controller_client::ControllerClient;

/// Supplies this node's current free cores/memory. A real deployment
/// samples `/proc` or a cgroup; tests and the CLI entry point hand in a
/// constant or a synthetic generator.
pub trait ResourceSource: Send + Sync {
    fn sample(&self) -> Resource;
}

pub struct ResourceReporter {
    controller: Arc<ControllerClient>,
    source: Arc<dyn ResourceSource>,
    lpid: LpId,
    local_node: NodeId,
    last_view: RwLock<GlobalView>,
    stop: AtomicBool,
}

impl ResourceReporter {
    pub fn new(
        controller: Arc<ControllerClient>,
        source: Arc<dyn ResourceSource>,
        lpid: LpId,
        local_node: NodeId,
    ) -> Self {
        ResourceReporter {
            controller,
            source,
            lpid,
            local_node,
            last_view: RwLock::new(Vec::new()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn cached_view(&self) -> GlobalView {
        self.last_view.read().clone()
    }

    /// One reporting round: sample local free resource, push it to the
    /// controller, cache whatever global view comes back.
    pub fn tick(&self) -> Result<(), crate::controller_client::ControllerCallError> {
        let resource = self.source.sample();
        let view = self.controller.report_free_resource(self.lpid, self.local_node, resource)?;
        *self.last_view.write() = view;
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Runs `tick` on `interval` until [`Self::stop`] is called. Intended
    /// to be spawned on its own thread by the node entry point.
    pub fn run(self: &Arc<Self>, interval: Duration) {
        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.tick() {
                tracing::warn!(error = %err, "resource report failed");
            }
            std::thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proclet_rpc::RpcClient;
    use std::net::{IpAddr, Ipv4Addr};

    struct FixedResource(Resource);
    impl ResourceSource for FixedResource {
        fn sample(&self) -> Resource {
            self.0
        }
    }

    #[test]
    fn tick_against_nothing_listening_times_out_but_does_not_panic() {
        let node = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 9000);
        let controller = Arc::new(ControllerClient::new(
            Arc::new(RpcClient::new(Duration::from_millis(50))),
            node,
        ));
        let reporter = ResourceReporter::new(
            controller,
            Arc::new(FixedResource(Resource::new(4, 1024))),
            LpId(1),
            node,
        );
        assert!(reporter.tick().is_err());
        assert!(reporter.cached_view().is_empty());
    }

    #[test]
    fn stop_flag_halts_run_loop() {
        let node = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 9000);
        let controller = Arc::new(ControllerClient::new(
            Arc::new(RpcClient::new(Duration::from_millis(10))),
            node,
        ));
        let reporter = Arc::new(ResourceReporter::new(
            controller,
            Arc::new(FixedResource(Resource::new(4, 1024))),
            LpId(1),
            node,
        ));
        reporter.stop();
        // `run` must return immediately without blocking the test.
        reporter.run(Duration::from_secs(60));
    }
}
