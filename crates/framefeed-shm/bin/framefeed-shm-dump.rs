//! Print the state of a framefeed shared region.
//!
//! Opens the region as a reader (creating it if nobody has yet), copies the
//! header under the lock and prints it, either once or every time the
//! render cache key changes.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use framefeed_shm::{
    Config, FrameMetadata, LayerConfig, Reader, RenderCacheKey, ShmConfig, ShmNames,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "framefeed-shm-dump", version, about = "Inspect a framefeed shared region")]
struct Args {
    /// Reverse-domain product identifier of the region
    #[arg(long, env = framefeed_shm::config::PRODUCT_ID_ENV)]
    product_id: Option<String>,

    /// Build number of the region (defaults to this tool's)
    #[arg(long, env = framefeed_shm::config::BUILD_ENV)]
    build: Option<u32>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Keep polling every N milliseconds, printing each new frame
    #[arg(long, value_name = "MS")]
    watch: Option<u64>,

    /// Unlink the region's OS objects and exit
    #[cfg(target_os = "linux")]
    #[arg(long, conflicts_with_all = ["json", "watch"])]
    remove: bool,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    mapping: &'a str,
    mutex: &'a str,
    attached: bool,
    session_id: u64,
    frame_number: u64,
    gpu_luid: u64,
    feeder_process_id: u32,
    config: Config,
    layers: Vec<LayerConfig>,
}

impl<'a> Report<'a> {
    fn new(names: &'a ShmNames, header: &FrameMetadata) -> Self {
        Self {
            mapping: names.mapping(),
            mutex: names.mutex(),
            attached: header.has_feeder(),
            session_id: header.session_id(),
            frame_number: header.frame_number(),
            gpu_luid: header.gpu_luid(),
            feeder_process_id: header.feeder_process_id(),
            config: *header.config(),
            layers: header.layers().to_vec(),
        }
    }

    fn print_text(&self) {
        println!("mapping:  {}", self.mapping);
        println!("mutex:    {}", self.mutex);
        println!("attached: {}", self.attached);
        println!("session:  {:#018x}", self.session_id);
        println!("frame:    {}", self.frame_number);
        if !self.attached {
            return;
        }
        println!("gpu luid: {:#x}", self.gpu_luid);
        println!("feeder:   pid {}", self.feeder_process_id);
        println!(
            "texture:  {}x{}",
            self.config.texture_size.width, self.config.texture_size.height
        );
        for layer in &self.layers {
            let rect = layer.location_on_texture;
            println!(
                "  layer {:#x}: {}x{} at ({}, {}), opacity {:.2}, flags {:?}",
                layer.layer_id,
                rect.size.width,
                rect.size.height,
                rect.origin.x,
                rect.origin.y,
                layer.opacity,
                layer.layer_flags()
            );
        }
    }
}

fn print(names: &ShmNames, header: &FrameMetadata, json: bool) -> Result<()> {
    let report = Report::new(names, header);
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        report.print_text();
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = ShmConfig::from_env();
    if let Some(product_id) = args.product_id {
        config = config.with_product_id(product_id);
    }
    if let Some(build) = args.build {
        config = config.with_build(build);
    }

    #[cfg(target_os = "linux")]
    {
        if args.remove {
            let names = ShmNames::for_config(&config);
            framefeed_shm::unlink_shared_objects(&names)
                .with_context(|| format!("removing {names}"))?;
            tracing::info!("Removed {names}");
            return Ok(());
        }
    }

    let reader = Reader::open(&config).context("opening shared region")?;
    let mut last_key: Option<RenderCacheKey> = None;
    loop {
        let header = reader.lock().context("locking shared region")?.metadata();
        if last_key != Some(header.render_cache_key()) {
            last_key = Some(header.render_cache_key());
            print(reader.names(), &header, args.json)?;
        }

        let Some(interval) = args.watch else {
            return Ok(());
        };
        thread::sleep(Duration::from_millis(interval));
    }
}
