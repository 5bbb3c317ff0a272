#[macro_use]
extern crate log;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use gcreplay::*;

fn open_trace(args: &Args, path: &str, config: ParserConfig, resume: Option<&Path>) -> Result<TraceParser> {
    let symbols = args.load_symbols()?;
    let parser = match resume {
        Some(checkpoint) => {
            let symbols = symbols.ok_or_else(|| anyhow::anyhow!("resuming {} needs --symbols", path))?;
            let checkpoint = Checkpoint::from_binpb_zst(checkpoint)?;
            TraceParser::resume_native(path, symbols, checkpoint, config)?
        }
        None => TraceParser::open(path, symbols, config)?,
    };
    Ok(match args.load_features()? {
        Some(features) => parser.with_features(features),
        None => parser,
    })
}

/// Run a parse on a worker thread, logging progress while it runs
fn replay(parser: TraceParser, path: &str) -> Result<ParseOutcome> {
    let handle = parser.spawn();
    let mut last_report = Instant::now();
    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(50));
        if last_report.elapsed() >= Duration::from_secs(5) {
            info!("{}: {:.1}% at offset {}", path, handle.progress() * 100.0, handle.position());
            last_report = Instant::now();
        }
    }
    Ok(handle.join()?)
}

fn parse_traces(args: &Args, parse_args: &ParseArgs) -> Result<()> {
    anyhow::ensure!(
        parse_args.resume.is_none() || args.paths.len() == 1,
        "Can only resume one trace at a time"
    );
    let batch = args.paths.len() > 1;
    let mut rows = vec![];
    let mut errors = 0;
    for path in &args.paths {
        let mut config = args.parser_config();
        if let Some(policy) = parse_args.checkpoint_policy(Path::new(path), batch) {
            config = config.with_checkpoints(policy);
        }
        let outcome = open_trace(args, path, config, parse_args.resume.as_deref()).and_then(|p| replay(p, path));
        match outcome {
            Ok(outcome) => {
                let reachable = sanity_trace(&outcome.graph);
                let live = outcome.statistics.live_total();
                info!(
                    "{}: {} live objects ({}), {} reachable ({})",
                    path,
                    live.memory.objects,
                    human_bytes(live.memory.bytes),
                    reachable.objects,
                    human_bytes(reachable.bytes)
                );
                rows.push(format!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    path,
                    outcome.events,
                    outcome.cycles,
                    live.memory.objects,
                    live.memory.bytes,
                    reachable.objects,
                    reachable.bytes,
                    outcome.report.total()
                ));
            }
            Err(e) => {
                error!("Failed to parse {}: {:#}", path, e);
                errors += 1;
            }
        }
    }
    println!("============================ Tabulate Statistics ============================");
    println!("trace\tevents\tcycles\tobjects\tbytes\treachable_objects\treachable_bytes\tviolations");
    for row in rows {
        println!("{}", row);
    }
    println!("-------------------------- End Tabulate Statistics --------------------------");
    anyhow::ensure!(errors == 0, "{} of {} traces failed", errors, args.paths.len());
    Ok(())
}

fn inspect(args: &Args) -> Result<()> {
    println!("============================ Tabulate Statistics ============================");
    println!("checkpoint\tcycle\toffset\tobjects\tbytes\troots\treachable_objects\tspace\tspace_objects\tspace_bytes");
    for path in &args.paths {
        let checkpoint = Checkpoint::from_binpb_zst(path)?;
        let graph = &checkpoint.graph;
        let reachable = sanity_trace(graph);
        for kind in SpaceKind::ALL {
            let space = &checkpoint.statistics[kind.index()];
            println!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                path,
                checkpoint.cycle,
                checkpoint.offset,
                graph.len(),
                graph.total_bytes(),
                graph.roots().count(),
                reachable.objects,
                kind.name(),
                space.memory.objects,
                space.memory.bytes
            );
        }
    }
    println!("-------------------------- End Tabulate Statistics --------------------------");
    Ok(())
}

fn export(args: &Args, export_args: &ExportArgs) -> Result<()> {
    anyhow::ensure!(args.paths.len() == 1, "Can only export one trace at a time");
    let path = &args.paths[0];
    let outcome = replay(open_trace(args, path, args.parser_config(), None)?, path)?;
    let mut output_file = BufWriter::new(File::create(&export_args.output_path)?);
    let rows = write_edges(&outcome.graph, &mut output_file)?;
    info!("Wrote {} edges to {}", rows, export_args.output_path);
    Ok(())
}

fn histogram(args: &Args, histogram_args: &HistogramArgs) -> Result<()> {
    println!("============================ Tabulate Statistics ============================");
    println!("trace\tbucket\tobjects\tbytes");
    for path in &args.paths {
        let outcome = replay(open_trace(args, path, args.parser_config(), None)?, path)?;
        let classifier = histogram_args.classifier.build(
            outcome.symbols.clone(),
            args.load_features()?,
            args.small_array_threshold,
        )?;
        let start = Instant::now();
        let histogram = Histogram::of(&outcome.graph, classifier.as_ref());
        debug!(
            "Classified {} objects by {} in {} ms",
            outcome.graph.len(),
            classifier.name(),
            start.elapsed().as_millis()
        );
        for (bucket, m) in histogram.sorted().into_iter().take(histogram_args.top) {
            println!("{}\t{}\t{}\t{}", path, bucket, m.objects, m.bytes);
        }
    }
    println!("-------------------------- End Tabulate Statistics --------------------------");
    Ok(())
}

pub fn main() -> Result<()> {
    env_logger::init();
    println!("gcreplay {} ({})", built_info::PKG_VERSION, built_info::PROFILE);
    let args = Args::parse();
    match &args.command {
        None => parse_traces(&args, &ParseArgs::default()),
        Some(Commands::Parse(parse_args)) => parse_traces(&args, parse_args),
        Some(Commands::Inspect) => inspect(&args),
        Some(Commands::Export(export_args)) => export(&args, export_args),
        Some(Commands::Histogram(histogram_args)) => histogram(&args, histogram_args),
    }
}
