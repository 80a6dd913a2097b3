use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime};
use color_eyre::{Result, eyre::Context, eyre::ensure};
use serde::{Deserialize, Deserializer};
use strum_macros::Display;

use crate::cli::Overrides;

const ENV_PREFIX: &str = "FLIGHT_TRACKER_";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub flight: FlightSettings,
    pub email: EmailSettings,
    pub alerts: AlertSettings,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlightSettings {
    pub departure_city: String,
    pub arrival_city: String,
    pub departure_date: NaiveDate,
    pub price_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    pub sender_email: String,
    pub smtp_server: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertSettings {
    pub recipient_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Edge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default)]
    pub kind: BrowserKind,
    #[serde(default = "default_headless")]
    pub headless: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            kind: BrowserKind::default(),
            headless: default_headless(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".into()
}

const fn default_headless() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_history_path")]
    pub history: PathBuf,
    #[serde(default = "default_chart_path")]
    pub chart: PathBuf,
    #[serde(default = "default_log_path")]
    pub log: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            history: default_history_path(),
            chart: default_chart_path(),
            log: default_log_path(),
        }
    }
}

fn default_history_path() -> PathBuf {
    "data/flight_prices.csv".into()
}

fn default_chart_path() -> PathBuf {
    "price_trend_analysis.png".into()
}

fn default_log_path() -> PathBuf {
    "error.log".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_scrape_minute")]
    pub scrape_minute: u32,
    #[serde(
        default = "default_report_time",
        deserialize_with = "deserialize_time_of_day"
    )]
    pub report_time: NaiveTime,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            scrape_minute: default_scrape_minute(),
            report_time: default_report_time(),
        }
    }
}

const fn default_scrape_minute() -> u32 {
    1
}

fn default_report_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("09:00 is a valid time")
}

fn deserialize_time_of_day<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
    let raw = String::deserialize(de)?;
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
        .map_err(serde::de::Error::custom)
}

/// Secrets that may live in the environment (or `.env`) instead of the file.
#[derive(Debug, Default, Deserialize)]
pub struct EnvOverrides {
    pub smtp_password: Option<String>,
    pub recipient_email: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .wrap_err("failed to read FLIGHT_TRACKER_* environment")
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config from {}", path.display()))?;
        let settings = Self::parse(&raw)?.with_env(EnvOverrides::from_env()?);
        Ok(settings)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).wrap_err("failed to parse config")?;
        ensure!(
            settings.schedule.scrape_minute < 60,
            "schedule.scrape_minute must be below 60, got {}",
            settings.schedule.scrape_minute
        );
        Ok(settings)
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        if let Some(password) = env.smtp_password {
            self.email.password = password;
        }
        if let Some(recipient) = env.recipient_email {
            self.alerts.recipient_email = recipient;
        }
        self
    }
}

/// Where and when to search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub departure_city: String,
    pub arrival_city: String,
    pub departure_date: NaiveDate,
}

/// Effective parameters for one scrape job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub route: Route,
    pub price_threshold: u32,
    pub locked_flight: Option<String>,
}

impl RunConfig {
    pub fn resolve(overrides: &Overrides, file: &FlightSettings) -> Self {
        Self {
            route: Route {
                departure_city: overrides
                    .dep_city
                    .clone()
                    .unwrap_or_else(|| file.departure_city.clone()),
                arrival_city: overrides
                    .arr_city
                    .clone()
                    .unwrap_or_else(|| file.arrival_city.clone()),
                departure_date: overrides.date.unwrap_or(file.departure_date),
            },
            price_threshold: overrides.threshold.unwrap_or(file.price_threshold),
            locked_flight: overrides.flight_no.clone().filter(|no| !no.is_empty()),
        }
    }
}
