use clap::Parser;
use failure::Error;
use iqstream::{
    Fault, Handle, PackMode, SimulatedCard, SimulatedTransmitter, SimulatorConfig, Staging,
    StreamAggregator, StreamConfig, TransmitPipeline, TransmitStream, TransmitterConfig, TxBlock,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "iqstream-sim")]
#[command(about = "Stream from simulated cards, checking timestamp continuity and throughput")]
struct Cli {
    /// JSON stream config. Command line options override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated cards
    #[arg(long, default_value = "1")]
    cards: u8,

    /// Receive handles streamed on every card
    #[arg(long, value_delimiter = ',', default_value = "A1", value_parser = parse_handle)]
    handles: Vec<Handle>,

    /// Stop each handle after this many blocks
    #[arg(short = 'b', long)]
    blocks: Option<u64>,

    /// Stop the session after this many seconds
    #[arg(short = 't', long)]
    run_time: Option<u64>,

    /// Fail if the last measured throughput is below this many MB/s
    #[arg(long)]
    target_mbps: Option<f64>,

    /// Fail if any handle sees at least this many timestamp gaps
    #[arg(long)]
    max_gaps: Option<u64>,

    /// Fail if any transmit stream sees at least this many late or underrun completions
    #[arg(long)]
    max_late: Option<u64>,

    /// Use 12-bit packed samples
    #[arg(long)]
    packed: bool,

    /// Stage blocks in each handle's ring buffer before handing them on
    #[arg(long)]
    buffered: bool,

    /// Drop samples before this block on the first handle of every card
    #[arg(long)]
    inject_gap: Option<u64>,

    /// Also transmit this many blocks on handle A1 of card 0
    #[arg(long, default_value = "0")]
    tx_blocks: usize,

    /// Probability that a simulated transmit block completes late
    #[arg(long, default_value = "0")]
    late_probability: f64,

    #[arg(long, default_value = "0")]
    seed: u64,
}

fn parse_handle(s: &str) -> Result<Handle, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn stream_config(cli: &Cli) -> Result<StreamConfig, Error> {
    let mut config = match &cli.config {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };
    if cli.packed {
        config.pack_mode = PackMode::Packed;
    }
    if cli.buffered {
        config.staging = Staging::Buffered;
    }
    if cli.blocks.is_some() {
        config.blocks_per_handle = cli.blocks;
    }
    if cli.run_time.is_some() {
        config.run_time_secs = cli.run_time;
    }
    if cli.target_mbps.is_some() {
        config.thresholds.target_mbps = cli.target_mbps;
    }
    if cli.max_gaps.is_some() {
        config.thresholds.max_gaps = cli.max_gaps;
    }
    if cli.max_late.is_some() {
        config.thresholds.max_late = cli.max_late;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<bool, Error> {
    let config = stream_config(&cli)?;
    if config.blocks_per_handle.is_none() && config.run_time_secs.is_none() {
        log::warn!("neither a block count nor a run time was given, streaming until killed");
    }
    let mut agg = StreamAggregator::new(config.clone())?;

    for card in 0..cli.cards {
        let faults = match cli.inject_gap {
            Some(block) => vec![Fault::Gap {
                handle: cli.handles[0],
                block,
                samples: 1000,
            }],
            None => Vec::new(),
        };
        let sim = SimulatedCard::new(SimulatorConfig {
            handles: cli.handles.clone(),
            pack_mode: config.pack_mode,
            blocks_per_handle: config.blocks_per_handle,
            faults,
            seed: cli.seed.wrapping_add(u64::from(card)),
            ..SimulatorConfig::default()
        })?;
        agg.spawn_card(card, cli.handles.clone(), sim)?;
    }

    if cli.tx_blocks > 0 {
        let tx = SimulatedTransmitter::new(TransmitterConfig {
            late_probability: cli.late_probability,
            seed: cli.seed,
            ..TransmitterConfig::default()
        });
        let pipeline = TransmitPipeline::new(Handle::A1, tx);
        let blocks = vec![TxBlock::new(vec![0; 4 * 1020])];
        let stream = TransmitStream::replay(0, pipeline, blocks, cli.tx_blocks)
            .with_timestamps(0, None);
        agg.spawn_transmitter(stream)?;
    }

    agg.start_monitor()?;
    let report = agg.join();

    for (key, stream) in &report.streams {
        println!(
            "{}: {} blocks, {} bytes, {} gaps ({} backward)",
            key, stream.packets, stream.bytes, stream.gaps, stream.backward_jumps
        );
    }
    for (card, c) in &report.cards {
        if c.overruns > 0 || c.unexpected_blocks > 0 {
            println!(
                "card {}: {} overruns, {} unexpected blocks",
                card, c.overruns, c.unexpected_blocks
            );
        }
    }
    for (key, tx) in &report.transmit {
        println!(
            "{} transmit: {} submitted, {} completed, {} late, {:.0} blocks/s",
            key, tx.submitted, tx.completed, tx.late, tx.completion_rate
        );
    }
    if let Some(peak) = report.peak_throughput_mbps {
        println!("peak throughput: {:.1} MB/s", peak);
    }

    let violations = report.violations(&config.thresholds);
    for violation in &violations {
        log::error!("{}", violation);
    }
    Ok(violations.is_empty())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => log::info!("Success!"),
        Ok(false) => std::process::exit(1),
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    }
}
