use anyhow::{bail, Context, Result};
use bare_vmm::{RunOutcome, Vmm, VmmConfig};
use log::{info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut args = std::env::args_os().skip(1);
    let Some(image_path) = args.next().map(PathBuf::from) else {
        bail!("usage: bare-vmm <image.elf> [config.json]");
    };

    let config = match args.next().map(PathBuf::from) {
        Some(path) => VmmConfig::load(&path)?,
        None => VmmConfig::default(),
    };

    info!(
        "bare-vmm starting: image {}, {} regions, max {} runs",
        image_path.display(),
        config.regions.len(),
        config.max_runs
    );

    let image = File::open(&image_path)
        .with_context(|| format!("Failed to open {}", image_path.display()))?;

    let report = Vmm::boot(config, BufReader::new(image)).context("Boot failed")?;

    match report.run.outcome {
        RunOutcome::BudgetExhausted => warn!(
            "Guest did not finish within {} runs",
            report.run.iterations
        ),
        outcome => info!("Guest finished: {:?}", outcome),
    }

    println!("{}", report.text());
    Ok(())
}
