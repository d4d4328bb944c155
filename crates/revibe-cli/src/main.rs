use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use revibe_contracts::requests::{ApiEnvelope, DesignRequest};
use revibe_contracts::sessions::Session;
use revibe_engine::{PipelineMode, RealProductsPipeline, StandardPipeline, VisionAnalyzer};

#[derive(Debug, Parser)]
#[command(name = "revibe", version, about = "AI room redesign pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze a room photo without generating a design.
    Analyze(AnalyzeArgs),
    /// Real-products pathway: analyze, shop, composite, overlay.
    Generate(GenerateArgs),
    /// Standard pathway: analyze and restyle with AI-imagined products.
    Standard(GenerateArgs),
    /// Delete old sessions from the output directory.
    Prune(PruneArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    image: PathBuf,
    #[arg(long, default_value = "modern")]
    style: String,
    #[arg(long, default_value = "")]
    instructions: String,
    #[arg(long, default_value = "interior redesign")]
    design_type: String,
    #[arg(long)]
    fast: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    image: PathBuf,
    #[arg(long, default_value = "modern")]
    style: String,
    #[arg(long, default_value = "")]
    instructions: String,
    #[arg(long, default_value = "interior redesign")]
    design_type: String,
    #[arg(long)]
    fast: bool,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long, default_value = "output")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct PruneArgs {
    #[arg(long, default_value = "output")]
    out: PathBuf,
    #[arg(long, default_value_t = 30)]
    max_age_days: u64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("revibe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Generate(args) => run_generate(args, Pathway::RealProducts),
        Command::Standard(args) => run_generate(args, Pathway::Standard),
        Command::Prune(args) => run_prune(args),
    }
}

enum Pathway {
    RealProducts,
    Standard,
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let mode = PipelineMode::from_fast_flag(args.fast);
    let analyzer = match VisionAnalyzer::new(mode) {
        Ok(analyzer) => analyzer,
        Err(err) => return print_failure("analysis could not start", err),
    };
    match analyzer.analyze(&args.image, &args.style, &args.instructions, &args.design_type) {
        Ok(analysis) => {
            let envelope =
                ApiEnvelope::ok("image analyzed", serde_json::to_value(&analysis)?);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(0)
        }
        Err(err) => print_failure("image analysis failed", err),
    }
}

fn run_generate(args: GenerateArgs, pathway: Pathway) -> Result<i32> {
    let mode = PipelineMode::from_fast_flag(args.fast);
    let mut request = DesignRequest::new(args.image);
    request.design_style = args.style;
    request.custom_instructions = args.instructions;
    request.design_type = args.design_type;
    request.session_id = args.session_id;
    request.output_dir = args.out;

    let outcome = match pathway {
        Pathway::RealProducts => {
            RealProductsPipeline::new(mode).and_then(|pipeline| pipeline.generate(&request))
        }
        Pathway::Standard => {
            StandardPipeline::new(mode).and_then(|pipeline| pipeline.generate(&request))
        }
    };
    match outcome {
        Ok(outcome) => {
            let envelope =
                ApiEnvelope::ok("design generated", serde_json::to_value(&outcome)?);
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(0)
        }
        Err(err) => print_failure("design generation failed", err),
    }
}

fn run_prune(args: PruneArgs) -> Result<i32> {
    let removed = Session::prune_older_than(&args.out, args.max_age_days)?;
    let envelope = ApiEnvelope::ok(
        "old sessions pruned",
        json!({"removed": removed, "max_age_days": args.max_age_days}),
    );
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(0)
}

fn print_failure(message: &str, err: anyhow::Error) -> Result<i32> {
    let envelope = ApiEnvelope::failure(message, format!("{err:#}"));
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(1)
}
