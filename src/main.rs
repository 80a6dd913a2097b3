use chrono::Local;
use clap::Parser;
use color_eyre::Result;
use log::info;
use strum::VariantArray;

mod analysis;
mod cli;
mod config;
mod logging;
mod notifier;
mod schedule;
mod scraper;
mod storage;
mod tracker;

use crate::config::Settings;
use crate::notifier::{Notifier, SmtpMailer};
use crate::schedule::{Job, Scheduler, Trigger};
use crate::scraper::FliggyScraper;
use crate::storage::CsvStore;
use crate::tracker::{ReportPaths, Tracker};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    let settings = Settings::load(&cli.config)?;
    logging::init(&settings.paths.log)?;

    let store = CsvStore::new(&settings.paths.history);
    let reports = ReportPaths {
        history: store.path().to_path_buf(),
        chart: settings.paths.chart.clone(),
    };
    let tracker = Tracker::new(
        FliggyScraper::new(settings.browser.clone()),
        store,
        Notifier::new(
            SmtpMailer::new(settings.email.clone()),
            settings.alerts.recipient_email.clone(),
        ),
        settings.flight.clone(),
        cli.overrides,
        reports,
    )
    .reload_from(cli.config.clone());

    if cli.run_once {
        tracker.run(Job::Scrape).await;
        return Ok(());
    }
    if cli.report_only {
        tracker.run(Job::Report).await;
        return Ok(());
    }

    info!("Starting in scheduled mode");
    let now = Local::now().naive_local();
    let scheduler = Scheduler::default()
        .every(
            Trigger::Hourly {
                minute: settings.schedule.scrape_minute,
            },
            Job::Scrape,
            now,
        )
        .every(
            Trigger::Daily {
                at: settings.schedule.report_time,
            },
            Job::Report,
            now,
        );
    for &job in Job::VARIANTS {
        if let Some(at) = scheduler.next_run(job) {
            info!("First {job} run at {at}");
        }
    }
    tracker.run_scheduled(scheduler).await;
    Ok(())
}
