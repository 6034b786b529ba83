use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

mod cli;
mod compiler;
mod config;
mod diagnostics;
mod discovery;
mod environment;
mod gate;
mod interrupt;
mod pipeline;
mod process;
mod refdata;
mod repository;
mod shelf;
mod spec;
mod util;
mod validation;

use cli::RootArgs;
use diagnostics::Diagnostics;
use pipeline::Pipeline;
use spec::SpecStore;

fn main() -> ExitCode {
    let args = RootArgs::parse();
    init_logging(&args);
    interrupt::install();

    let start = Instant::now();
    let mut diag = Diagnostics::new();
    let ok = match run(&args, &mut diag, start) {
        Ok(ok) => ok,
        Err(err) => {
            if args.debug {
                eprintln!("error: {err:?}");
            }
            diag.exception("Failed", &err)
        }
    };
    if interrupt::requested() {
        diag.error("Operation cancelled by user");
    }
    tracing::info!(summary = %diag.summary(), elapsed_ms = start.elapsed().as_millis(), "run finished");
    if ok && !diag.has_failures() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_logging(args: &RootArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &RootArgs, diag: &mut Diagnostics, start: Instant) -> Result<bool> {
    let config = args.to_config()?;
    tracing::debug!(?config, "resolved configuration");
    for tool in config.missing_tools() {
        tracing::warn!(tool = %tool, "command not found on PATH; steps using it will fail");
    }

    let spec_path = spec::resolve_spec_location(&args.spec, &config)
        .with_context(|| format!("resolve spec location {}", args.spec))?;
    tracing::info!(path = %spec_path.display(), "loading and validating spec");
    let mut spec = SpecStore::load(&spec_path)?;
    if !spec.validate(diag) {
        diag.error(format!("Spec {} did not validate.", spec_path.display()));
        return Ok(false);
    }
    if !spec.check_integrity(config.ignore_spec_hash, diag) {
        diag.error(format!(
            "Spec {} failed its integrity check; use --ignore-spec-hash to proceed anyway.",
            spec_path.display()
        ));
        return Ok(false);
    }

    let workflow = args.workflow();
    let mut pipeline = Pipeline::new(&config, spec);
    if args.status {
        let verdicts = pipeline.status();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&verdicts)?);
        } else {
            print!("{}", pipeline::format_status(&verdicts));
        }
        return Ok(true);
    }

    let steps = args.steps();
    if workflow == pipeline::Workflow::Explicit && steps.is_empty() {
        diag.warning("No workflow or steps selected; nothing to do.");
    }
    let ok = pipeline.run(workflow, &steps, diag);
    let summary = pipeline.summary(workflow, ok, diag, start);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} {} workflow for {}: {}",
            if ok { "Completed" } else { "FAILED" },
            workflow,
            pipeline.spec().moniker(),
            diag.summary()
        );
    }
    Ok(ok)
}
