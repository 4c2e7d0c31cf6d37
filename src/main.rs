use args::Args;
use getopts::Occur;
use glob::glob;
use latalloc::{Format, ReportConfig, Snapshot};

const PROGRAM_DESC: &str = "Print latalloc latency profiles";
const PROGRAM_NAME: &str = "lat_print";

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores target profiles",
        "DIR",
        Occur::Req,
        None,
    );
    args.option(
        "f",
        "format",
        "Percentile table format: csv or classic",
        "FORMAT",
        Occur::Optional,
        Some(String::from("csv")),
    );
    args.option(
        "t",
        "ticks",
        "Percentile steps per half-distance to 100%",
        "TICKS",
        Occur::Optional,
        Some(String::from("10")),
    );

    args.parse_from_cli()?;

    let dir: String = args.value_of("dir")?;
    let format: String = args.value_of("format")?;
    let ticks: u32 = args.value_of("ticks")?;
    if ticks == 0 {
        anyhow::bail!("--ticks must be positive");
    }
    let config = ReportConfig {
        format: format.parse::<Format>()?,
        ticks_per_half_distance: ticks,
        ..ReportConfig::default()
    };

    let wildcard = format!("{}/latalloc.*.yaml", dir);

    // Aggregate per-process profiles.
    let mut aggregate_profile: Option<Snapshot> = None;

    for path in glob(wildcard.as_str())? {
        let path = path?;
        eprintln!("found profile in {}", path.display());
        let profile = Snapshot::load(&path)?;
        match aggregate_profile.as_mut() {
            None => aggregate_profile = Some(profile),
            Some(aggregate) => aggregate.merge(&profile)?,
        }
    }

    match aggregate_profile {
        None => anyhow::bail!("no profiles found in {}", dir),
        Some(profile) => println!("{}", profile.report(&config)),
    }

    Ok(())
}
