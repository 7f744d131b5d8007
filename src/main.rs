//! gpfl CLI: graph path feature learning.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use gpfl::config::Config;
use gpfl::engine::{Miner, Phases, RunSummary};
use gpfl::evaluation::{DirectionScores, ScoreReport};
use gpfl::persist::format_number;
use gpfl::persist::rule_file::read_rule_file;

#[derive(Parser)]
#[command(name = "gpfl", version, about = "Learn and apply path rules on knowledge graphs")]
struct Cli {
    /// TOML config file; defaults apply to everything it leaves out.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Override `data.home`.
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Override `data.out`.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    /// Override `learn.threads`.
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Learn only these relations (repeatable); overrides `data.targets`.
    #[arg(long = "target", global = true)]
    targets: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn rules for every target and write them under `out/`.
    Learn,

    /// Apply previously learned rules and write ranked predictions.
    Apply,

    /// Learn, then apply, then score.
    Run,

    /// Score the prediction file of the output directory.
    Score,

    /// Summarize a flat rule file.
    Inspect {
        /// Path to a rule file under `out/rules/`.
        file: PathBuf,

        /// Number of best rules to list.
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Write a config file holding every default.
    InitConfig {
        /// Destination path.
        #[arg(default_value = "gpfl.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(home) = &self.home {
            config.data.home = home.clone();
        }
        if let Some(out) = &self.out {
            config.data.out = out.clone();
        }
        if let Some(threads) = self.threads {
            config.learn.threads = threads;
        }
        if !self.targets.is_empty() {
            config.data.targets = self.targets.clone();
        }
        Ok(config)
    }
}

fn print_scores(label: &str, scores: &DirectionScores) {
    for (direction, hits) in [
        ("head", &scores.head),
        ("tail", &scores.tail),
        ("both", &scores.both),
    ] {
        println!(
            "{label:<24} {direction:<5} n={:<6} hits@1={:<8} hits@3={:<8} hits@10={:<8} mrr={}",
            hits.queries,
            format_number(hits.hits_at_1),
            format_number(hits.hits_at_3),
            format_number(hits.hits_at_10),
            format_number(hits.mrr),
        );
    }
}

fn print_report(report: &ScoreReport) {
    for (relation, scores) in &report.relations {
        print_scores(relation, scores);
    }
    print_scores("overall", &report.overall);
    if report.skipped > 0 {
        println!("skipped: {}", report.skipped);
    }
}

fn print_summary(summary: &RunSummary) {
    for target in &summary.targets {
        println!(
            "{}: templates={} instantiated={} rules={} queries={} unresolved={}",
            target.relation,
            target.templates,
            target.instantiated,
            target.rules,
            target.queries,
            target.unresolved
        );
    }
    if let Some(report) = &summary.scores {
        print_report(report);
    }
    println!("elapsed: {:.1}s", summary.elapsed.as_secs_f64());
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Learn => {
            let config = cli.load_config()?;
            let miner = Miner::load(&config)?;
            print_summary(&miner.run(Phases::LEARN)?);
        }

        Commands::Apply => {
            let config = cli.load_config()?;
            let miner = Miner::load(&config)?;
            print_summary(&miner.run(Phases::APPLY)?);
        }

        Commands::Run => {
            let config = cli.load_config()?;
            let miner = Miner::load(&config)?;
            print_summary(&miner.run(Phases::ALL)?);
        }

        Commands::Score => {
            let config = cli.load_config()?;
            let miner = Miner::load(&config)?;
            let report = miner.score()?;
            print_report(&report);
            println!("wrote {}", config.data.scores_path().display());
        }

        Commands::Inspect { file, top } => {
            let rules = read_rule_file(file)?;
            println!("rules: {}", rules.lines.len());
            let by_tag: Vec<String> = rules
                .counts_by_tag()
                .into_iter()
                .map(|(tag, n)| format!("{tag}: {n}"))
                .collect();
            println!("{}", by_tag.join(" | "));
            let by_length: Vec<String> = rules
                .counts_by_length()
                .into_iter()
                .map(|(len, n)| format!("len={len}: {n}"))
                .collect();
            println!("{}", by_length.join(" | "));
            if rules.skipped > 0 {
                println!("skipped: {}", rules.skipped);
            }
            for line in rules.top(*top) {
                println!(
                    "{}\t{}\t{}\tsupport={}",
                    format_number(line.quality),
                    line.tag,
                    line.rule,
                    line.support
                );
            }
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                return Err(miette::miette!(
                    help = "Pass --force to overwrite it.",
                    "{} already exists",
                    path.display()
                ));
            }
            let config = cli.load_config()?;
            config.validate()?;
            config.save(path)?;
            let written = std::fs::metadata(path).into_diagnostic()?.len();
            println!("wrote {} ({written} bytes)", path.display());
        }
    }

    Ok(())
}
