use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser};

/// Flight price tracker. Command-line values override `config.toml`.
#[derive(Debug, Parser)]
#[command(name = "flight-price-tracker", version)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Run the scrape job once and exit instead of entering the schedule loop
    #[arg(long, alias = "run_once")]
    pub run_once: bool,

    /// Run the daily analysis report once and exit
    #[arg(long, alias = "report_only", conflicts_with = "run_once")]
    pub report_only: bool,

    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
}

/// Per-run values that win over the `[flight]` section.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Departure city, e.g. 北京
    #[arg(long, alias = "dep_city")]
    pub dep_city: Option<String>,

    /// Arrival city, e.g. 上海
    #[arg(long, alias = "arr_city")]
    pub arr_city: Option<String>,

    /// Departure date (YYYY-MM-DD)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Alert when a fare is below this price
    #[arg(long)]
    pub threshold: Option<u32>,

    /// Only keep flights whose number contains this, e.g. CA1234
    #[arg(long, alias = "flight_no")]
    pub flight_no: Option<String>,
}
