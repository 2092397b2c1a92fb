mod cli;

use std::path::Path;

use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use rayon::prelude::*;
use serde_json::json;
use trace_core::decode::DecodeStats;
use trace_core::{
    init_logger, ConnectionTracker, DecodeContext, FlowSummary, SavefileReader, TrackerConfig,
    TrackerError, TrackerMode, TrackerStats,
};

struct FileReport {
    path: String,
    decode: DecodeStats,
    tracker: TrackerStats,
    flows: Vec<FlowSummary>,
}

fn main() {
    let args = cli::Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    init_logger(level, args.log_file.as_deref());

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };
    debug!("tracker config: {:?}", config);

    // 每个文件一个跟踪器, 文件之间并行
    let results: Vec<(String, trace_core::Result<FileReport>)> = args
        .files
        .par_iter()
        .map(|path| (path.display().to_string(), analyze_file(path, &config)))
        .collect();

    let mut failed = false;
    let mut reports = Vec::new();
    for (path, result) in results {
        match result {
            Ok(report) => reports.push(report),
            Err(err) => {
                error!("{}: {}", path, err);
                eprintln!("error: {}: {}", path, err);
                failed = true;
            }
        }
    }

    if args.json {
        print_json(&reports);
    } else {
        for report in &reports {
            print_table(report);
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn load_config(args: &cli::Cli) -> trace_core::Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)?,
        None => TrackerConfig::default(),
    };
    if args.continuous {
        config.mode = TrackerMode::Continuous;
    }
    if args.max_flows.is_some() {
        config.max_flows = args.max_flows;
    }
    config.snapshot_index |= args.snapshot_index;
    config.validate()?;
    Ok(config)
}

fn analyze_file(path: &Path, config: &TrackerConfig) -> trace_core::Result<FileReport> {
    let reader = SavefileReader::open(path)?;
    let mut ctx = DecodeContext::new(reader.linktype());
    let mut tracker = ConnectionTracker::new(config.clone())?;

    for record in reader {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                // 文件尾部损坏时保留已处理的结果
                warn!("{}: stopping early: {}", path.display(), err);
                break;
            }
        };
        let Some(packet) = ctx.decode(record.timestamp, &record.data) else {
            continue;
        };
        match tracker.process(&packet) {
            Ok(_) => {}
            Err(TrackerError::MalformedSegment(_)) => {}
            Err(err) => return Err(err),
        }
    }

    let stats = *tracker.stats();
    info!(
        "{}: {} packets read, {} tcp, {} flows",
        path.display(),
        ctx.stats.packets,
        ctx.stats.tcp_packets,
        stats.flows_created
    );
    Ok(FileReport {
        path: path.display().to_string(),
        decode: ctx.stats.clone(),
        tracker: stats,
        flows: tracker.finish(),
    })
}

fn print_json(reports: &[FileReport]) {
    let value: Vec<_> = reports
        .iter()
        .map(|r| {
            json!({
                "file": r.path,
                "decode": r.decode,
                "tracker": r.tracker,
                "flows": r.flows,
            })
        })
        .collect();
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(err) => eprintln!("error: {}", err),
    }
}

fn fmt_rtt(us: Option<f64>) -> String {
    us.map_or_else(|| "-".to_string(), |us| format!("{:.1}ms", us / 1000.0))
}

fn print_table(report: &FileReport) {
    println!(
        "{}: {} packets, {} tcp, {} flows",
        report.path, report.decode.packets, report.decode.tcp_packets, report.tracker.flows_created
    );
    for flow in &report.flows {
        println!(
            "{:>5}  {} <-> {}  {:.3}s  {} pkts{}{}",
            flow.id,
            flow.a,
            flow.b,
            flow.duration_secs,
            flow.packets,
            if flow.complete { "  complete" } else { "" },
            if flow.reset { "  reset" } else { "" },
        );
        for (name, dir) in [("a2b", &flow.a2b), ("b2a", &flow.b2a)] {
            println!(
                "       {}: {} bytes ({} unique)  rexmit {} pkts / {} bytes  ooo {}  rtt avg {} min {}  acks dup {} amb {}",
                name,
                dir.data_bytes,
                dir.unique_bytes,
                dir.rexmit_packets,
                dir.rexmit_bytes,
                dir.out_of_order,
                fmt_rtt(dir.rtt_avg_us),
                fmt_rtt((dir.rtt.count > 0).then_some(dir.rtt.min_us as f64)),
                dir.acks.duplicate,
                dir.acks.ambiguous,
            );
        }
    }
}
