//! Node entry point (§6 "CLI / environment"): accepts the
//! `{controller_ip, lpid, isolated?}` triple either from flags or a
//! `node.toml` file, then runs this process as either the controller or a
//! regular proclet server node.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use proclet_alloc::AddressPlanParams;
use proclet_common::error::WireStatus;
use proclet_common::ids::{LpId, NodeId};
use proclet_common::resource::Resource;
use proclet_common::status::StatusTable;
use proclet_common::NodeConfig;
use proclet_ctrl::Controller;
use proclet_rpc::{RpcClient, RpcServer};
use proclet_runtime::controller_client::server_encoding;
use proclet_runtime::{
    ControllerClient, InvocationEngine, MethodTable, MigrationListener, Migrator, AlwaysAdmit, PressureHandler,
    PressureParams, ProcletManager, ResourceReporter, ResourceSource,
};
use proclet_stack::{StackCluster, StackManager};
use proclet_wire::RequestKind;

/// Size of one proclet-thread stack (§4.5). Fixed rather than configurable:
/// the address planner carves the stack-cluster region to a multiple of
/// this figure, so it has to match on every node in an LP.
const PROCLET_STACK_BYTES: u64 = 256 * 1024;

#[derive(Parser, Debug)]
#[command(about = "Runs a proclet server node, or the controller for one LP")]
struct Cli {
    /// Load the full `{controller_ip, lpid, isolated?}` triple (plus bind
    /// address) from a TOML file instead of the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    controller_ip: Option<IpAddr>,
    #[arg(long, default_value_t = 9000)]
    controller_port: u16,
    /// 0 = ask the controller to allocate a fresh LP.
    #[arg(long, default_value_t = 0)]
    lpid: u16,
    #[arg(long)]
    isolated: bool,
    #[arg(long)]
    bind_ip: Option<IpAddr>,
    #[arg(long, default_value_t = 9001)]
    bind_port: u16,
    #[arg(long, default_value_t = 0)]
    image_hash: u64,

    /// Run this process as the controller for the LP instead of a server
    /// node. The controller listens on `bind_ip:bind_port`.
    #[arg(long)]
    host_controller: bool,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        if let Some(path) = &self.config {
            return NodeConfig::from_file(path).expect("reading node config file");
        }
        NodeConfig {
            controller_ip: self.controller_ip.expect("--controller-ip or --config is required"),
            controller_port: Some(self.controller_port),
            lpid: self.lpid,
            isolated: self.isolated,
            bind_ip: self.bind_ip.expect("--bind-ip or --config is required"),
            bind_port: Some(self.bind_port),
            image_hash: self.image_hash,
        }
    }
}

/// Crude free-resource sampler: reports a fixed core count and a memory
/// figure that falls as local proclets grow. A production deployment
/// would read `/proc/stat` and a cgroup memory controller; that OS
/// integration is out of scope here (§1).
struct NodeResourceSource {
    total_cores: u32,
    total_mem_mbs: u64,
    manager: Arc<ProcletManager>,
}

impl ResourceSource for NodeResourceSource {
    fn sample(&self) -> Resource {
        let used_mbs: u64 = self
            .manager
            .all_info()
            .into_iter()
            .map(|info| info.capacity_bytes / (1024 * 1024))
            .sum();
        Resource::new(self.total_cores, self.total_mem_mbs.saturating_sub(used_mbs))
    }
}

fn run_controller(cfg: NodeConfig) {
    let controller = Arc::new(Controller::new(AddressPlanParams::default()));
    let handler = {
        let controller = Arc::clone(&controller);
        move |kind: RequestKind, body: &[u8]| -> (WireStatus, Vec<u8>) {
            let reply = match kind {
                RequestKind::RegisterNode => {
                    let (ip, lpid, image_hash, isolated) = server_encoding::decode_register_node_request(body);
                    server_encoding::register_node_reply(controller.register_node(ip, lpid, image_hash, isolated))
                }
                RequestKind::AllocateProclet => {
                    let (lpid, capacity, hint) = server_encoding::decode_allocate_proclet_request(body);
                    server_encoding::allocate_proclet_reply(controller.allocate_proclet(lpid, capacity, hint))
                }
                RequestKind::DestroyProclet => {
                    let (lpid, id, last_host) = server_encoding::decode_destroy_proclet_request(body);
                    server_encoding::unit_reply(controller.destroy_proclet(lpid, id, last_host))
                }
                RequestKind::ResolveProclet => {
                    let (lpid, id) = server_encoding::decode_resolve_proclet_request(body);
                    server_encoding::resolve_proclet_reply(controller.resolve_proclet(lpid, id))
                }
                RequestKind::AcquireMigrationDest => {
                    let (lpid, src, has_mem_pressure, need) = server_encoding::decode_acquire_migration_dest_request(body);
                    server_encoding::acquire_migration_dest_reply(controller.acquire_migration_dest(lpid, src, has_mem_pressure, need))
                }
                RequestKind::AcquireNode => {
                    let (lpid, ip) = server_encoding::decode_node_lp_request(body);
                    server_encoding::bool_reply(controller.acquire_node(lpid, ip))
                }
                RequestKind::ReleaseNode => {
                    let (lpid, ip) = server_encoding::decode_node_lp_request(body);
                    server_encoding::unit_reply(controller.release_node(lpid, ip))
                }
                RequestKind::UpdateLocation => {
                    let (lpid, id, node) = server_encoding::decode_update_location_request(body);
                    server_encoding::unit_reply(controller.update_location(lpid, id, node))
                }
                RequestKind::ReportFreeResource => {
                    let (lpid, ip, resource) = server_encoding::decode_report_free_resource_request(body);
                    server_encoding::global_view_reply(controller.report_free_resource(lpid, ip, resource))
                }
                RequestKind::DestroyLp => {
                    let (lpid, requester) = server_encoding::decode_destroy_lp_request(body);
                    server_encoding::node_list_reply(controller.destroy_lp(lpid, requester))
                }
                _ => return (WireStatus::WrongClient, Vec::new()),
            };
            (WireStatus::Ok, reply)
        }
    };

    let server = RpcServer::spawn((cfg.bind_ip, cfg.bind_port.unwrap_or(0)), Arc::new(handler))
        .expect("binding controller rpc listener");
    tracing::info!(addr = %server.local_addr(), "controller listening");
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn run_server_node(cfg: NodeConfig) {
    let local_node = NodeId::new(cfg.bind_ip, cfg.bind_port.unwrap_or(0));
    let controller_node = NodeId::new(cfg.controller_ip, cfg.controller_port.unwrap_or(9000));

    let rpc = Arc::new(RpcClient::new(Duration::from_secs(5)));
    let controller = Arc::new(ControllerClient::new(Arc::clone(&rpc), controller_node));

    let (lpid, stack_cluster_span) = controller
        .register_node(local_node, LpId(cfg.lpid), cfg.image_hash, cfg.isolated)
        .expect("registering with controller");
    tracing::info!(%lpid, "registered with controller");

    let (stack_cluster_base, stack_cluster_len) = stack_cluster_span;
    let stack = Arc::new(StackManager::new(StackCluster::new(
        local_node,
        stack_cluster_base,
        stack_cluster_len,
        PROCLET_STACK_BYTES,
    )));

    let plan_params = AddressPlanParams::default();
    let status = Arc::new(StatusTable::new(
        plan_params.proclet_heap_base,
        1u64 << plan_params.min_proclet_heap_shift,
        plan_params.proclet_heap_len,
    ));
    let manager = Arc::new(ProcletManager::new(status));

    proclet_wire::install_ref_counter(Box::new(proclet_runtime::ManagerRefCounter::new(
        Arc::clone(&manager),
        Arc::clone(&controller),
        local_node,
        lpid,
    )));

    let methods = Arc::new(MethodTable::new());
    let invocation = Arc::new(InvocationEngine::new(
        local_node,
        lpid,
        Arc::clone(&manager),
        Arc::clone(&controller),
        Arc::clone(&rpc),
        methods,
        stack,
    ));

    let invocation_for_handler = Arc::clone(&invocation);
    let handler = move |kind: RequestKind, body: &[u8]| -> (WireStatus, Vec<u8>) {
        match kind {
            RequestKind::ProcletCall => invocation_for_handler.handle_proclet_call(body),
            _ => (WireStatus::WrongClient, Vec::new()),
        }
    };
    let server = RpcServer::spawn((cfg.bind_ip, cfg.bind_port.unwrap_or(0)), Arc::new(handler))
        .expect("binding node rpc listener");
    tracing::info!(addr = %server.local_addr(), "proclet server node listening");

    let migration_listener = Arc::new(
        MigrationListener::bind((cfg.bind_ip, 0), Arc::clone(&manager), Arc::new(AlwaysAdmit))
            .expect("binding migration listener"),
    );
    tracing::info!(port = migration_listener.local_port().unwrap(), "migration listener bound");
    {
        let migration_listener = Arc::clone(&migration_listener);
        std::thread::spawn(move || migration_listener.run());
    }

    let resource_source = Arc::new(NodeResourceSource {
        total_cores: std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4),
        total_mem_mbs: 4096,
        manager: Arc::clone(&manager),
    });
    let reporter = Arc::new(ResourceReporter::new(
        Arc::clone(&controller),
        Arc::clone(&resource_source) as Arc<dyn ResourceSource>,
        lpid,
        local_node,
    ));
    {
        let reporter = Arc::clone(&reporter);
        std::thread::spawn(move || reporter.run(Duration::from_secs(3)));
    }

    let pressure = Arc::new(PressureHandler::new(Arc::clone(&manager), Arc::clone(&controller), PressureParams::default()));
    let migrator = Arc::new(Migrator::new(local_node, Arc::clone(&manager), Arc::clone(&controller)));
    {
        let pressure = Arc::clone(&pressure);
        let resource_source = Arc::clone(&resource_source) as Arc<dyn ResourceSource>;
        std::thread::spawn(move || {
            pressure.run(
                lpid,
                local_node,
                resource_source,
                Resource::new(1, 512),
                migrator,
                3,
                Duration::from_secs(1),
            )
        });
    }

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let host_controller = cli.host_controller;
    let cfg = cli.into_config();

    if host_controller {
        run_controller(cfg);
    } else {
        run_server_node(cfg);
    }
}
