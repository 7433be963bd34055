//! Stripe Remap Demo - Main Application
//!
//! Runs an in-process cluster with a coordinator, one router and the storage
//! tier, overloads one server and walks it through remapping and back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::{Arg, ArgAction, Command};
use rand::RngCore;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use StripeRemap::remap::{LocalBus, RequestPath, Role};
use StripeRemap::{
    Cluster, CodingScheme, Config, CoordinatorRemapHandler, Error, RemapState, Result,
    RouterRemapHandler, StorageRemapHandler, TransitWorker,
};

const ROUTER_INSTANCE_ID: u16 = 1;
const WAIT_LIMIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Stripe Remap Demo")
        .version("0.1.0")
        .about("Live remapping of overloaded servers in an erasure-coded store")
        .arg(
            Arg::new("nodes")
                .short('n')
                .long("nodes")
                .value_name("COUNT")
                .help("Number of storage nodes")
                .default_value("8"),
        )
        .arg(
            Arg::new("scheme")
                .short('s')
                .long("scheme")
                .value_name("NAME")
                .help("Coding scheme: raid0, raid1, raid5, cauchy, rs, rdp, evenodd")
                .default_value("cauchy"),
        )
        .arg(
            Arg::new("data-chunks")
                .short('k')
                .long("data-chunks")
                .value_name("COUNT")
                .help("Number of data chunks")
                .default_value("6"),
        )
        .arg(
            Arg::new("parity-chunks")
                .short('m')
                .long("parity-chunks")
                .value_name("COUNT")
                .help("Number of parity chunks")
                .default_value("2"),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .value_name("BYTES")
                .help("Size of each chunk")
                .default_value("4096"),
        )
        .arg(
            Arg::new("lists")
                .long("lists")
                .value_name("COUNT")
                .help("Number of stripe lists")
                .default_value("16"),
        )
        .arg(
            Arg::new("overload")
                .long("overload")
                .value_name("INDEX")
                .help("Index of the node to overload")
                .default_value("3"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; overrides the coding options"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter used when RUST_LOG is unset")
                .default_value("info"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress per-key warnings")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let level = matches.get_one::<String>("log-level").map_or("info", String::as_str);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let node_count: usize = parse_arg(&matches, "nodes")?;
    let overload_index: usize = parse_arg(&matches, "overload")?;
    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_json_file(path)?,
        None => {
            let scheme: CodingScheme = parse_arg(&matches, "scheme")?;
            let mut config = Config::new(scheme, parse_arg(&matches, "data-chunks")?, parse_arg(&matches, "parity-chunks")?);
            config.coding.chunk_size = parse_arg(&matches, "chunk-size")?;
            config.stripe.num_lists = parse_arg(&matches, "lists")?;
            config.remap.ack_wait_timeout_ms = 2000;
            config.validate()?;
            config
        }
    };
    let quiet = matches.get_flag("quiet");

    println!("🚀 Stripe Remap Demo Starting...");
    println!(
        "   Coding: {} {}/{} (data/parity chunks), {} byte chunks",
        config.coding.scheme, config.coding.k, config.coding.m, config.coding.chunk_size
    );
    println!("   Nodes: {}, stripe lists: {}", node_count, config.stripe.num_lists);
    println!("   Fault Tolerance: {} node failures", config.max_failures());
    println!();

    let cluster = Arc::new(Cluster::with_nodes(&config, node_count)?);
    let target = *cluster
        .node_addrs()
        .get(overload_index)
        .ok_or_else(|| Error::InvalidConfig(format!("no node with index {}", overload_index)))?;

    let exit = Arc::new(AtomicBool::new(false));
    let bus = Arc::new(LocalBus::new());
    let coordinator = CoordinatorRemapHandler::new(Role::Coordinator.member(0), bus.clone(), config.remap)?;
    for addr in cluster.node_addrs() {
        coordinator.add_alive_server(addr);
    }
    let worker = TransitWorker::new(coordinator.clone(), exit.clone())?;
    let storage = StorageRemapHandler::new(Role::Server.member(0), bus.as_ref())?;
    let router = RouterRemapHandler::new(
        Role::Router.member(ROUTER_INSTANCE_ID),
        ROUTER_INSTANCE_ID,
        bus.clone(),
        cluster.clone(),
        cluster.stripe_list(),
        config.remap,
    )?;
    cluster.attach_router(ROUTER_INSTANCE_ID, router.events());
    let threads: Vec<JoinHandle<()>> = vec![
        coordinator.listen(exit.clone())?,
        router.listen(exit.clone())?,
        router.start_ack_ticker(exit.clone())?,
        storage.listen(exit.clone())?,
    ];

    // Fill one stripe per list, then push some updates through the parity path
    let mut rng = rand::thread_rng();
    for list_id in 0..config.stripe.num_lists as u32 {
        let data: Vec<Vec<u8>> = (0..config.coding.k)
            .map(|_| {
                let mut chunk = vec![0u8; config.coding.chunk_size];
                rng.fill_bytes(&mut chunk);
                chunk
            })
            .collect();
        cluster.write_stripe(list_id, 0, &data)?;
    }
    println!("✓ {} stripes written", config.stripe.num_lists);

    let stripe_list = cluster.stripe_list();
    let keys: Vec<Vec<u8>> = (0..32).map(|i| format!("user:{}", i).into_bytes()).collect();
    for key in &keys {
        let server = *stripe_list.get(key).node;
        let Some(timestamp) = router.next_timestamp(server) else {
            continue;
        };
        cluster.update_chunk(key, 0, 0, key, timestamp)?;
        router.complete_update(server, timestamp)?;
    }
    println!("✓ {} updates applied, {} parity backups held", keys.len(), cluster.stats().backups);

    // Overload
    println!("⚡ Overloading {}...", target);
    cluster.overload_node(target, 50)?;
    coordinator.load_monitor().report_many(router.name(), cluster.latencies());
    let decision = coordinator.check_load()?;
    println!("   Overloaded: {:?}", decision.overloaded);

    let degraded = wait_until(|| {
        coordinator.server_state(target) == Some(RemapState::Degraded)
            && router.server_state(target) == Some(RemapState::Degraded)
    })
    .await;
    println!(
        "📊 {} is {} at the coordinator, {} at {}",
        target,
        state_name(coordinator.server_state(target)),
        state_name(router.server_state(target)),
        router.name()
    );
    if !degraded {
        println!("   ⚠ Remapping did not complete in {:?}", WAIT_LIMIT);
    }

    let mut served = 0;
    let mut rebuilt = 0;
    for key in &keys {
        match router.route_get(key) {
            RequestPath::Degraded { list_id, .. } => {
                let chunk_id = stripe_list.get(key).data_index as u32;
                let chunk = cluster.degraded_read(list_id as u32, 0, chunk_id)?;
                if chunk == cluster.read_chunk(list_id as u32, 0, chunk_id)? {
                    rebuilt += 1;
                } else if !quiet {
                    println!("   ⚠ Rebuilt chunk for {} does not match", String::from_utf8_lossy(key));
                }
            }
            RequestPath::Normal { .. } => served += 1,
        }
    }
    println!("   ✓ {} gets served normally, {} rebuilt around {}", served, rebuilt, target);

    // Restore
    println!("🔧 Restoring {}...", target);
    cluster.recover_node(target)?;
    coordinator.load_monitor().report_many(router.name(), cluster.latencies());
    coordinator.transit_to_normal(&[target], false)?;
    let normal = wait_until(|| {
        coordinator.server_state(target) == Some(RemapState::Normal)
            && router.server_state(target) == Some(RemapState::Normal)
    })
    .await;
    println!(
        "📊 {} is {} at the coordinator, {} at {}",
        target,
        state_name(coordinator.server_state(target)),
        state_name(router.server_state(target)),
        router.name()
    );
    if !normal {
        println!("   ⚠ Restoration did not complete in {:?}", WAIT_LIMIT);
    }

    let stats = cluster.stats();
    println!(
        "📦 {}/{} nodes available, {} chunks ({} bytes), {} parity backups",
        stats.available_nodes, stats.total_nodes, stats.total_chunks, stats.total_bytes, stats.backups
    );

    exit.store(true, Ordering::Relaxed);
    let joined = tokio::task::spawn_blocking(move || {
        for thread in threads {
            if thread.join().is_err() {
                warn!("remap thread panicked");
            }
        }
        if worker.join().is_err() {
            warn!("transit worker panicked");
        }
    })
    .await;
    if let Err(err) = joined {
        warn!(error = %err, "shutdown did not complete");
    }

    println!("🏁 Demo completed");
    Ok(())
}

fn parse_arg<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| Error::InvalidConfig(format!("missing --{}", name)))?
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid value for --{}", name)))
}

fn state_name(state: Option<RemapState>) -> &'static str {
    state.map_or("unknown", |state| state.name())
}

/// Poll `done` until it holds or [`WAIT_LIMIT`] passes
async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT_LIMIT {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}
