use crate::classify::ClassifierChoice;
use crate::config::{CallContextMode, CheckpointPolicy, ParserConfig};
use crate::constants::ARRAY_SIZE_MAX_SMALL;
use crate::symbols::{FeatureMap, Symbols};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(subcommand_precedence_over_arg = true)]
pub struct Args {
    /// Traces (native or HPROF), or checkpoint files for `inspect`. A
    /// subcommand name ends the list.
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Symbols file for native traces
    #[arg(short, long)]
    pub symbols: Option<String>,

    #[arg(short, long, value_enum, default_value_t = CallContextMode::Full)]
    pub call_context: CallContextMode,

    /// Feature definitions used for statistics and classification
    #[arg(short, long)]
    pub features: Option<String>,

    /// Fail on the first heap-graph inconsistency
    #[arg(long, default_value_t = false)]
    pub strict: bool,

    /// Skip malformed records instead of failing
    #[arg(long, default_value_t = false)]
    pub lenient: bool,

    /// Stop decoding at this byte offset
    #[arg(long)]
    pub stop_offset: Option<u64>,

    /// Start of the GC timestamp window
    #[arg(long)]
    pub from: Option<u64>,

    /// End (exclusive) of the GC timestamp window
    #[arg(long)]
    pub to: Option<u64>,

    #[arg(long, default_value_t = ARRAY_SIZE_MAX_SMALL)]
    pub small_array_threshold: u32,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct ParseArgs {
    /// Write checkpoints into this directory
    #[arg(short = 'd', long)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Checkpoint every n-th eligible cycle
    #[arg(short, long, default_value_t = 1)]
    pub every: u32,
    /// Only checkpoint after major collections
    #[arg(short, long, default_value_t = false)]
    pub major_only: bool,
    /// Checkpoint files kept per trace, 0 keeps all
    #[arg(short, long, default_value_t = 4)]
    pub keep: usize,
    /// Continue a native trace from this checkpoint
    #[arg(short, long)]
    pub resume: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    #[arg(short, long)]
    pub output_path: String,
}

#[derive(Parser, Debug, Clone, Copy)]
pub struct HistogramArgs {
    #[arg(short = 'k', long, value_enum, default_value_t = ClassifierChoice::Type)]
    pub classifier: ClassifierChoice,
    /// Rows printed per trace
    #[arg(short = 'n', long, default_value_t = 20)]
    pub top: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay traces and report heap statistics (the default)
    Parse(ParseArgs),
    /// Summarise checkpoint files
    Inspect,
    /// Write the final live pointer graph as CSV
    Export(ExportArgs),
    /// Classify the final live heap
    Histogram(HistogramArgs),
}

impl Args {
    pub fn parser_config(&self) -> ParserConfig {
        let mut config = ParserConfig::default()
            .with_consistency_check(self.strict)
            .with_lenient_decoding(self.lenient)
            .with_call_context(self.call_context)
            .with_small_array_threshold(self.small_array_threshold);
        if self.from.is_some() || self.to.is_some() {
            config = config.with_window(self.from.unwrap_or(0), self.to.unwrap_or(u64::MAX));
        }
        if let Some(offset) = self.stop_offset {
            config = config.with_stop_offset(offset);
        }
        config
    }

    pub fn load_symbols(&self) -> anyhow::Result<Option<Arc<Symbols>>> {
        Ok(match &self.symbols {
            Some(path) => Some(Symbols::shared(path, self.call_context)?),
            None => None,
        })
    }

    pub fn load_features(&self) -> anyhow::Result<Option<Arc<FeatureMap>>> {
        Ok(match &self.features {
            Some(path) => Some(Arc::new(FeatureMap::from_path(path)?)),
            None => None,
        })
    }
}

impl ParseArgs {
    /// Checkpoint policy for one trace; batches get a subdirectory per trace
    pub fn checkpoint_policy(&self, trace: &Path, batch: bool) -> Option<CheckpointPolicy> {
        let directory = self.checkpoint_dir.as_ref()?;
        let directory = match (batch, trace.file_stem()) {
            (true, Some(stem)) => directory.join(stem),
            _ => directory.clone(),
        };
        Some(
            CheckpointPolicy::new(directory)
                .every(self.every)
                .major_only(self.major_only)
                .keep(self.keep),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeWindow;

    #[test]
    fn test_global_flags() {
        let args = Args::try_parse_from([
            "gcreplay",
            "--strict",
            "--to",
            "500",
            "-c",
            "none",
            "a.trace",
            "b.trace",
        ])
        .unwrap();
        assert_eq!(args.paths, vec!["a.trace", "b.trace"]);
        assert!(args.command.is_none());
        let config = args.parser_config();
        assert!(config.consistency_check);
        assert_eq!(config.call_context, CallContextMode::None);
        assert_eq!(config.window, Some(TimeWindow::new(0, 500)));
        assert_eq!(config.small_array_threshold, ARRAY_SIZE_MAX_SMALL);
    }

    #[test]
    fn test_parse_subcommand_policy() {
        let args = Args::try_parse_from([
            "gcreplay", "app.trace", "parse", "-d", "/tmp/cp", "--every", "3", "--major-only",
        ])
        .unwrap();
        let Some(Commands::Parse(parse_args)) = args.command else {
            panic!("expected the parse subcommand");
        };
        let single = parse_args.checkpoint_policy(Path::new("app.trace"), false).unwrap();
        assert_eq!(single.directory, PathBuf::from("/tmp/cp"));
        assert_eq!(single.every_n_cycles, 3);
        assert!(single.major_only);
        let batch = parse_args.checkpoint_policy(Path::new("runs/app.trace"), true).unwrap();
        assert_eq!(batch.directory, PathBuf::from("/tmp/cp/app"));
        assert!(ParseArgs::default().checkpoint_policy(Path::new("x"), false).is_none());
    }

    #[test]
    fn test_histogram_subcommand() {
        let args = Args::try_parse_from(["gcreplay", "heap.hprof", "histogram", "-k", "Site", "-n", "5"]).unwrap();
        match args.command {
            Some(Commands::Histogram(h)) => {
                assert_eq!(h.classifier, ClassifierChoice::Site);
                assert_eq!(h.top, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_ends_path_list() {
        let args = Args::try_parse_from(["gcreplay", "a.ckpt", "b.ckpt", "inspect"]).unwrap();
        assert_eq!(args.paths, vec!["a.ckpt", "b.ckpt"]);
        assert!(matches!(args.command, Some(Commands::Inspect)));

        let args = Args::try_parse_from(["gcreplay", "a.trace", "parse", "-k", "0", "-r", "c.ckpt"]).unwrap();
        assert_eq!(args.paths, vec!["a.trace"]);
        match args.command {
            Some(Commands::Parse(p)) => {
                assert_eq!(p.keep, 0);
                assert_eq!(p.resume, Some(PathBuf::from("c.ckpt")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
