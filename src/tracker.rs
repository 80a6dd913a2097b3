use std::cell::RefCell;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use color_eyre::Result;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::analysis::{self, log_skipped};
use crate::cli::Overrides;
use crate::config::{FlightSettings, RunConfig, Settings};
use crate::notifier::{Mailer, Notifier};
use crate::schedule::{Job, Scheduler};
use crate::scraper::PriceSource;
use crate::storage::ObservationStore;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Files the daily report reads and writes.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub history: PathBuf,
    pub chart: PathBuf,
}

/// Everything a job needs, handed in rather than looked up.
pub struct Tracker<P, S, M> {
    source: P,
    store: S,
    notifier: Notifier<M>,
    flight: RefCell<FlightSettings>,
    overrides: Overrides,
    reports: ReportPaths,
    config_path: Option<PathBuf>,
}

impl<P: PriceSource, S: ObservationStore, M: Mailer> Tracker<P, S, M> {
    pub fn new(
        source: P,
        store: S,
        notifier: Notifier<M>,
        flight: FlightSettings,
        overrides: Overrides,
        reports: ReportPaths,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            flight: RefCell::new(flight),
            overrides,
            reports,
            config_path: None,
        }
    }

    /// Re-reads `[flight]` and the alert recipient from `path` before every job.
    pub fn reload_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// On failure the previous settings stay in effect and an error report goes out.
    async fn reload_settings(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match Settings::load(path) {
            Ok(settings) => {
                debug!("Reloaded settings from {}", path.display());
                *self.flight.borrow_mut() = settings.flight;
                self.notifier.set_recipient(settings.alerts.recipient_email);
            }
            Err(e) => {
                error!("Config reload failed, keeping previous settings: {e:?}");
                self.notifier
                    .error_report(&format!("config reload from {} failed: {e:#}", path.display()))
                    .await;
            }
        }
    }

    pub async fn run(&self, job: Job) {
        match job {
            Job::Scrape => self.scrape_job().await,
            Job::Report => self.report_job().await,
        }
    }

    /// Scrapes, stores and alerts. Failures are logged and mailed, never returned.
    pub async fn scrape_job(&self) {
        info!("--- Scrape job started ---");
        self.reload_settings().await;
        let run = RunConfig::resolve(&self.overrides, &self.flight.borrow());
        info!(
            "Route {} -> {} on {}, alert threshold ¥{}",
            run.route.departure_city,
            run.route.arrival_city,
            run.route.departure_date,
            run.price_threshold
        );
        if let Some(flight_no) = &run.locked_flight {
            info!("Locked to flight {flight_no}");
        }

        match self.scrape_and_alert(&run).await {
            Ok(alerts) => info!("{alerts} price alerts sent"),
            Err(e) => {
                error!("Scrape job failed: {e:?}");
                self.notifier.error_report(&format!("{e:#}")).await;
            }
        }
        info!("--- Scrape job finished ---");
    }

    async fn scrape_and_alert(&self, run: &RunConfig) -> Result<usize> {
        let mut flights = self.source.fetch(&run.route).await?;
        if flights.is_empty() {
            warn!("Scraper returned no flights");
        }

        if let Some(flight_no) = &run.locked_flight {
            flights.retain(|f| f.flight_number.contains(flight_no.as_str()));
            info!("{} flights match {flight_no}", flights.len());
        }

        self.store.append(&flights)?;

        let mut alerts = 0;
        for flight in flights.iter().filter(|f| f.price < run.price_threshold) {
            info!(
                "Cheap fare: {} at ¥{}, below ¥{}",
                flight.flight_number, flight.price, run.price_threshold
            );
            if self.notifier.price_alert(run, flight).await {
                alerts += 1;
            }
        }
        Ok(alerts)
    }

    /// Analyzes the history and mails the summary when there is enough data.
    pub async fn report_job(&self) {
        info!("--- Daily report job started ---");
        self.reload_settings().await;
        match analysis::analyze(&self.reports.history, &self.reports.chart) {
            Ok(summary) => {
                self.notifier.daily_summary(&summary).await;
            }
            Err(e) => log_skipped(&e),
        }
        info!("--- Daily report job finished ---");
    }

    pub async fn run_pending(&self, scheduler: &mut Scheduler, now: NaiveDateTime) {
        for job in scheduler.due(now) {
            self.run(job).await;
        }
    }

    /// Polls the schedule forever.
    pub async fn run_scheduled(&self, mut scheduler: Scheduler) {
        info!("All jobs scheduled, entering poll loop");
        loop {
            self.run_pending(&mut scheduler, Local::now().naive_local()).await;
            sleep(POLL_INTERVAL).await;
        }
    }
}
