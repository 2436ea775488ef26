use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rayon::ThreadPoolBuilder;
use serde_json::Value;
use sftpack::corpus::{self, DiscoveryOptions};
use sftpack::{
    ChatTemplate, HfTokenizer, PackedBlock, PackingSummary, PreprocessConfig, Preprocessor,
    ProcessedDataset, ProportionalBudget, SpecialTokens, Stage, TemplateConfig, TokenizerHandle,
    UnpackedRecord, IGNORE_INDEX,
};

const DEFAULT_ENCODED_OUTPUT: &str = "encoded.jsonl";
const DEFAULT_PACKED_OUTPUT: &str = "packed.jsonl";

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-turn SFT preprocessing and packing", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short = 'q', long, global = true, action = ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encode records one example per record
    Encode(EncodeArgs),
    /// Encode records and pack them into fixed-capacity blocks
    Pack(PackArgs),
    /// Decode a row of an encoded or packed output file
    Inspect(InspectArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StageArg {
    Pretrain,
    Supervised,
}

impl From<StageArg> for Stage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::Pretrain => Stage::Pretrain,
            StageArg::Supervised => Stage::Supervised,
        }
    }
}

#[derive(Args, Debug)]
struct TokenizerArgs {
    /// Tokenizer JSON to load
    #[arg(short = 'm', long, value_name = "PATH")]
    tokenizer: PathBuf,

    /// Begin-of-sequence token
    #[arg(long, value_name = "TOKEN", default_value = "<s>")]
    bos_token: String,

    /// End-of-sequence token
    #[arg(long, value_name = "TOKEN", default_value = "</s>")]
    eos_token: String,

    /// Padding token (defaults to the end-of-sequence token)
    #[arg(long, value_name = "TOKEN")]
    pad_token: Option<String>,
}

impl TokenizerArgs {
    fn load(&self) -> Result<HfTokenizer> {
        let specials = SpecialTokens {
            bos: Some(self.bos_token.clone()),
            eos: Some(self.eos_token.clone()),
            pad: self.pad_token.clone(),
        };
        HfTokenizer::from_file(&self.tokenizer, &specials)
            .with_context(|| format!("failed to load tokenizer {}", self.tokenizer.display()))
    }
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Record files or directories (.jsonl / .json)
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    tokenizer: TokenizerArgs,

    /// Template description (JSON)
    #[arg(long, value_name = "PATH")]
    template: Option<PathBuf>,

    /// Preprocessing configuration (JSON); flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Token budget per example or block
    #[arg(long, value_name = "LEN")]
    cutoff_len: Option<usize>,

    /// Keep prompt spans trainable
    #[arg(long)]
    train_on_prompt: bool,

    /// Train on the last turn only
    #[arg(long)]
    mask_history: bool,

    /// Seed for shuffling and placement
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Number of passes over the records (whole number)
    #[arg(long, value_name = "COUNT")]
    num_epochs: Option<f64>,

    /// Records per batch
    #[arg(long, value_name = "COUNT")]
    batch_size: Option<usize>,

    /// Training stage reported when nothing survives filtering
    #[arg(long, value_enum)]
    stage: Option<StageArg>,

    /// Disable progress spinner and per-batch logging
    #[arg(long)]
    no_progress: bool,

    /// Limit Rayon worker threads
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Disable recursive directory traversal
    #[arg(long)]
    no_recursive: bool,

    /// Follow symlinks during traversal
    #[arg(long)]
    follow_symlinks: bool,
}

impl CommonArgs {
    fn config(&self) -> Result<PreprocessConfig> {
        let mut cfg = match &self.config {
            Some(path) => PreprocessConfig::from_json_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => PreprocessConfig::default(),
        };
        if let Some(cutoff_len) = self.cutoff_len {
            cfg.cutoff_len = cutoff_len;
        }
        if self.train_on_prompt {
            cfg.train_on_prompt = true;
        }
        if self.mask_history {
            cfg.mask_history = true;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
        }
        if let Some(num_epochs) = self.num_epochs {
            cfg.num_epochs = num_epochs;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if let Some(stage) = self.stage {
            cfg.stage = stage.into();
        }
        cfg.show_progress = !self.no_progress;
        Ok(cfg)
    }

    fn template(&self) -> Result<ChatTemplate> {
        let template_cfg = match &self.template {
            Some(path) => TemplateConfig::from_json_file(path)
                .with_context(|| format!("failed to load template {}", path.display()))?,
            None => TemplateConfig::default(),
        };
        Ok(ChatTemplate::new(template_cfg)?)
    }

    fn discovery(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            recursive: !self.no_recursive,
            follow_symlinks: self.follow_symlinks,
        }
    }
}

#[derive(Args, Debug)]
struct EncodeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output path for encoded records (JSONL)
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_ENCODED_OUTPUT)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct PackArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output path for packed blocks (JSONL)
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_PACKED_OUTPUT)]
    output: PathBuf,

    /// Tag each packed example with its own attention group
    #[arg(long)]
    neat: bool,

    /// Shortest example used to top up an overflowing block
    #[arg(long, value_name = "LEN")]
    min_fragment_len: Option<usize>,

    /// Disable the first-slot placement bias
    #[arg(long)]
    no_placement_bias: bool,

    /// Print the packing summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Encoded or packed JSONL file
    file: PathBuf,

    #[command(flatten)]
    tokenizer: TokenizerArgs,

    /// Zero-based row to decode
    #[arg(long, value_name = "N", default_value_t = 0)]
    index: usize,

    /// Keep special tokens in decoded text
    #[arg(long)]
    keep_special_tokens: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Encode(args) => run_encode(args),
        Commands::Pack(args) => run_pack(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    use log::LevelFilter;

    let level = match (quiet, verbose) {
        (0, 0) => LevelFilter::Info,
        (0, 1) => LevelFilter::Debug,
        (0, _) => LevelFilter::Trace,
        (1, _) => LevelFilter::Warn,
        _ => LevelFilter::Error,
    };

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.filter_level(level);
    let _ = builder.try_init();
}

fn configure_threads(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("unable to configure Rayon thread pool")?;
    }
    Ok(())
}

fn spinner(enabled: bool, message: &'static str) -> Result<Option<ProgressBar>> {
    if !enabled {
        return Ok(None);
    }
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner} {msg} {elapsed}")
        .context("invalid progress template")?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pb.set_style(style);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(Some(pb))
}

fn process(common: &CommonArgs, cfg: PreprocessConfig) -> Result<sftpack::PreprocessOutput> {
    configure_threads(common.threads)?;
    let tokenizer = common.tokenizer.load()?;
    let template = common.template()?;
    let records = corpus::load_records(&common.inputs, common.discovery())
        .context("failed to load records")?;
    info!("loaded {} records", records.len());

    let progress = spinner(!common.no_progress, "preprocessing records...")?;
    let preprocessor = Preprocessor::new(cfg, &template, &tokenizer, &ProportionalBudget)?;
    let start = Instant::now();
    let output = preprocessor.run(&records);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let output = output?;
    info!(
        "preprocessed {} records in {:.2?}",
        output.stats.records,
        start.elapsed()
    );
    Ok(output)
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    let mut cfg = args.common.config()?;
    cfg.packing = false;
    cfg.neat_packing = false;
    cfg.validate()?;

    let output = process(&args.common, cfg)?;
    let ProcessedDataset::Unpacked(rows) = &output.dataset else {
        bail!("expected unpacked output from encode");
    };
    corpus::write_jsonl_file(&args.output, rows)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    println!(
        "✅ wrote {} records to {}",
        rows.len(),
        args.output.display()
    );
    print!("{}", output.stats);
    Ok(())
}

fn run_pack(args: PackArgs) -> Result<()> {
    let mut cfg = args.common.config()?;
    cfg.packing = true;
    if args.neat {
        cfg.neat_packing = true;
    }
    if let Some(min_fragment_len) = args.min_fragment_len {
        cfg.min_fragment_len = min_fragment_len;
    }
    if args.no_placement_bias {
        cfg.placement_bias = false;
    }
    cfg.validate()?;
    let cutoff_len = cfg.cutoff_len;

    let output = process(&args.common, cfg)?;
    let ProcessedDataset::Packed(blocks) = &output.dataset else {
        bail!("expected packed output from pack");
    };
    corpus::write_jsonl_file(&args.output, blocks)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    let summary = PackingSummary::new(cutoff_len, blocks, output.stats.clone());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "✅ wrote {} blocks of {} tokens to {}",
            summary.blocks,
            cutoff_len,
            args.output.display()
        );
        println!(
            "   fill {:.2}% | trainable {} | dropped {}",
            summary.fill_ratio * 100.0,
            summary.trainable_tokens,
            summary.stats.dropped()
        );
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let tokenizer = args.tokenizer.load()?;
    let rows: Vec<Value> = corpus::read_jsonl(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let row = rows.into_iter().nth(args.index).ok_or_else(|| {
        anyhow!(
            "{} has no row at index {}",
            args.file.display(),
            args.index
        )
    })?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if row.get("group_ids").is_some() {
        let block: PackedBlock = serde_json::from_value(row).context("invalid packed block")?;
        writeln!(out, "Kind      : packed block ({} tokens)", block.len())?;
        writeln!(out, "Trainable : {}", block.trainable_tokens())?;
        for (group, start, end) in block.group_spans() {
            let text =
                tokenizer.decode(&block.input_ids()[start..end], !args.keep_special_tokens)?;
            writeln!(out, "[group {group}] {start}..{end}: {text:?}")?;
        }
        write_ids(&mut out, block.input_ids(), block.labels())?;
    } else {
        let record: UnpackedRecord =
            serde_json::from_value(row).context("invalid encoded record")?;
        writeln!(out, "Kind      : record ({} tokens)", record.input_ids.len())?;
        let text = tokenizer.decode(&record.input_ids, !args.keep_special_tokens)?;
        writeln!(out, "Text      : {text:?}")?;
        let trainable: Vec<u32> = record
            .input_ids
            .iter()
            .zip(&record.labels)
            .filter(|(_, label)| **label != IGNORE_INDEX)
            .map(|(&id, _)| id)
            .collect();
        let target = tokenizer.decode(&trainable, !args.keep_special_tokens)?;
        writeln!(out, "Trainable : {target:?}")?;
        write_ids(&mut out, &record.input_ids, &record.labels)?;
    }
    Ok(())
}

fn write_ids(out: &mut impl Write, ids: &[u32], labels: &[i64]) -> Result<()> {
    writeln!(out, "input_ids : {ids:?}")?;
    writeln!(out, "labels    : {labels:?}")?;
    Ok(())
}
