//! Deltadisk stack inspector
//!
//! Opens a delta stack, reports per-layer geometry and generation, and
//! optionally issues a full barrier before closing cleanly. Image
//! preparation stays with external tooling.

use clap::{Arg, ArgAction, Command};
use tracing::info;

use deltadisk::core::config;
use deltadisk::{Engine, LayerSpec, StackSpec};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let matches = Command::new("deltadisk")
        .version(deltadisk::VERSION)
        .about("Stackable copy-on-write virtual block device engine")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("raw-base")
                .long("raw-base")
                .help("Treat the first layer as a raw base")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("flush")
                .long("flush")
                .help("Issue a full barrier before closing")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("layers")
                .value_name("FILE")
                .num_args(1..)
                .required(true)
                .help("Stack layers, base first; the last is the writable top"),
        )
        .get_matches();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting deltadisk v{}", deltadisk::VERSION);

    // Load configuration
    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let config = config::load_config_or_default(config_path);

    let raw_base = matches.get_flag("raw-base");
    let layers: Vec<LayerSpec> = matches
        .get_many::<String>("layers")
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, path)| {
            if i == 0 && raw_base {
                LayerSpec::raw_path(path)
            } else {
                LayerSpec::image_path(path)
            }
        })
        .collect();

    let engine = Engine::open(config, StackSpec::new(layers))?;

    for layer in engine.layers() {
        info!(
            "{}: {:?} {} clusters, {}, {}",
            layer.id,
            layer.kind,
            layer.virtual_clusters,
            layer.generation,
            if layer.read_only { "read-only" } else { "writable" }
        );
    }
    info!(
        "virtual disk: {} sectors, cluster shift {}",
        engine.virtual_sectors(),
        engine.cluster_shift()
    );

    if matches.get_flag("flush") {
        engine.flush()?;
        info!("barrier complete");
    }

    engine.close()?;
    info!("Shutdown complete");
    Ok(())
}
