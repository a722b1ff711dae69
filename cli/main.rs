#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::Array2;
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use cardiocascade::config::{AngioOrEcg, CascadeConfig, SplitMethod, ThresholdMethod};
use cardiocascade::data::{CsvSetTagSource, LoadOptions, load_patient_table};
use cardiocascade::network::{CascadeNetwork, ExecutionContext};
use cardiocascade::progress::BootProgressObserver;
use cardiocascade::{
    BootstrapSettings, BootstrapTrainer, CascadeEvaluator, RidgeLogisticSettings,
    RidgeLogisticTrainer,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum ThresholdMethodCli {
    Tpr,
    Tprn,
    Youden,
}

impl From<ThresholdMethodCli> for ThresholdMethod {
    fn from(value: ThresholdMethodCli) -> Self {
        match value {
            ThresholdMethodCli::Tpr => ThresholdMethod::Tpr,
            ThresholdMethodCli::Tprn => ThresholdMethod::Tprn,
            ThresholdMethodCli::Youden => ThresholdMethod::Youden,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SplitMethodCli {
    Cv,
    Fixed,
}

impl From<SplitMethodCli> for SplitMethod {
    fn from(value: SplitMethodCli) -> Self {
        match value {
            SplitMethodCli::Cv => SplitMethod::Cv,
            SplitMethodCli::Fixed => SplitMethod::Fixed,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum AngioOrEcgCli {
    Angio,
    Ecg,
    None,
    Both,
}

impl From<AngioOrEcgCli> for AngioOrEcg {
    fn from(value: AngioOrEcgCli) -> Self {
        match value {
            AngioOrEcgCli::Angio => AngioOrEcg::Angio,
            AngioOrEcgCli::Ecg => AngioOrEcg::Ecg,
            AngioOrEcgCli::None => AngioOrEcg::None,
            AngioOrEcgCli::Both => AngioOrEcg::Both,
        }
    }
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Directory holding `data_raw_trop6_phys_{boot}.csv`; boot 0 is the base table
    #[arg(long)]
    data_dir: PathBuf,

    /// TOML configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "adjudicatorDiagnosis")]
    label_name: String,

    #[arg(long, value_enum, default_value_t = ThresholdMethodCli::Tprn)]
    threshold_method: ThresholdMethodCli,

    /// Target true-positive rate of level 1
    #[arg(long, default_value_t = 0.99)]
    tpr1: f64,

    /// Target true-positive rate of level 2
    #[arg(long, default_value_t = 0.99)]
    tpr2: f64,

    #[arg(long)]
    train_on_normal_and_chronic_only: bool,

    #[arg(long)]
    test_on_normal_and_chronic_only: bool,

    #[arg(long, value_enum, default_value_t = SplitMethodCli::Cv)]
    split_method: SplitMethodCli,

    #[arg(long, value_enum, default_value_t = AngioOrEcgCli::Ecg)]
    angio_or_ecg: AngioOrEcgCli,

    #[arg(long, default_value_t = 50)]
    n_boots: usize,

    /// Dataset key used for the exclusion and ECG feature lists
    #[arg(long, default_value = "data3")]
    dataset: String,

    /// Run boots on the rayon thread pool
    #[arg(long)]
    parallel: bool,

    /// Where out-of-bag tables and `summary.toml` are written
    #[arg(long, default_value = "cascade_output")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 10)]
    folds: usize,

    #[arg(long, default_value_t = 1)]
    repeats: usize,

    #[arg(long, default_value_t = 20201216)]
    seed: u64,

    /// Ridge penalty of the reference classifier
    #[arg(long, default_value_t = 1.0)]
    lambda: f64,
}

#[derive(Args)]
pub struct NetworkSummaryArgs {
    /// TOML configuration file with a `[network]` section
    #[arg(long)]
    config: PathBuf,

    /// Rows in the zero batch pushed through the network
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
}

#[derive(Parser)]
#[command(
    name = "cardiocascade",
    about = "Bootstrap validation of a two-level troponin cascade",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train, threshold and evaluate the cascade over every bootstrap split
    Validate(ValidateArgs),
    /// Build the multi-head network from its configuration and report its shape
    NetworkSummary(NetworkSummaryArgs),
}

/// Draws one tick per finished boot on stderr.
struct BootProgressBar {
    bar: ProgressBar,
}

impl BootProgressBar {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} boots ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl BootProgressObserver for BootProgressBar {
    fn on_run_start(&self, total_boots: usize) {
        self.bar.set_length(total_boots as u64);
        self.bar.set_message("training");
    }

    fn on_boot_finish(&self, boot: usize) {
        self.bar.set_message(format!("boot {boot} done"));
        self.bar.inc(1);
    }

    fn on_run_finish(&self) {
        self.bar.finish_with_message("all boots trained");
    }
}

fn load_config(path: Option<&Path>) -> Result<CascadeConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(CascadeConfig::load(path)?),
        None => {
            log::info!("No configuration file given; using built-in defaults.");
            Ok(CascadeConfig::default())
        }
    }
}

fn run_validate(args: ValidateArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;
    let options = LoadOptions {
        dataset: args.dataset.clone(),
        label_name: args.label_name.clone(),
        angio_or_ecg: args.angio_or_ecg.into(),
    };

    let tags = CsvSetTagSource::new(&args.data_dir);
    let base = load_patient_table(&tags.path_for(0), &config, &options)?;

    let trainer = RidgeLogisticTrainer::new(RidgeLogisticSettings {
        lambda: args.lambda,
        n_folds: args.folds,
        n_repeats: args.repeats,
        seed: args.seed,
        ..RidgeLogisticSettings::default()
    });
    let settings = BootstrapSettings {
        n_boots: args.n_boots,
        tpr1: args.tpr1,
        tpr2: args.tpr2,
        threshold_method: args.threshold_method.into(),
        split_method: args.split_method.into(),
        train_on_normal_and_chronic_only: args.train_on_normal_and_chronic_only,
        test_on_normal_and_chronic_only: args.test_on_normal_and_chronic_only,
        parallel: args.parallel,
    };

    let bootstrap = BootstrapTrainer::new(&base, &config.labels, &trainer, &tags, settings);
    let artifacts = bootstrap.run(&BootProgressBar::new())?;

    fs::create_dir_all(&args.out_dir)?;
    let report = CascadeEvaluator::new(&config.labels)
        .with_output_dir(&args.out_dir)
        .evaluate(&artifacts)?;
    report.log_summary();

    let summary_path = args.out_dir.join("summary.toml");
    report.write_toml(&summary_path)?;
    println!("Summary written to '{}'", summary_path.display());
    Ok(())
}

fn run_network_summary(args: NetworkSummaryArgs) -> Result<(), Box<dyn Error>> {
    let config = CascadeConfig::load(&args.config)?;
    let section = config.network.as_ref().ok_or_else(|| {
        format!(
            "configuration '{}' has no [network] section",
            args.config.display()
        )
    })?;
    let network = CascadeNetwork::from_section(section)?;

    for group in network.layout().groups() {
        log::info!("group {:<8} columns {}..{}", group.name, group.start, group.end);
    }
    for (name, width) in network.encoder_widths() {
        println!("{name}: input width {width}");
    }
    println!("parameters: {}", network.parameter_count());

    let batch = Array2::<f64>::zeros((args.batch_size, network.layout().total_width()));
    let output = network.forward(batch.view(), &mut ExecutionContext::eval())?;
    for (kind, logits) in &output.classification {
        println!("{kind}: {} x {}", logits.nrows(), logits.ncols());
    }
    if let Some(binary) = &output.binary {
        println!("binary: {} x {}", binary.nrows(), binary.ncols());
    }
    if let Some(regression) = &output.regression {
        println!("regression: {} x {}", regression.nrows(), regression.ncols());
    }
    if let Some(curve) = &output.curve {
        println!("curve: {} x {}", curve.values.nrows(), curve.values.ncols());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Validate(args) => run_validate(args),
        Commands::NetworkSummary(args) => run_network_summary(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
