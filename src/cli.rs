use std::path::PathBuf;

use clap::Parser;

/// seqtrace: per-connection retransmission and RTT analysis of pcap savefiles
#[derive(Parser, Debug)]
#[command(name = "seqtrace", version, about)]
pub struct Cli {
    /// Savefiles to analyze; each is processed independently
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Tracker configuration (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print summaries as JSON instead of a table
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Idle-sweep mode instead of whole-trace batch analysis
    #[arg(long, default_value_t = false)]
    pub continuous: bool,

    /// Cap on resident flow records
    #[arg(short, long)]
    pub max_flows: Option<usize>,

    /// Keep the AVL snapshot index beside the hash table
    #[arg(long, default_value_t = false)]
    pub snapshot_index: bool,

    /// Write log output to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
