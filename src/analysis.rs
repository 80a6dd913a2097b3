use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use plotters::prelude::*;
use plotters::style::register_font;

use crate::storage::{Observation, load_history};

const CHART_SIZE: (u32, u32) = (1600, 900);
const MIN_ROWS: usize = 2;
const CHART_FONT_FAMILY: &str = "sans-serif";

static CHART_FONT: Lazy<Result<(), &'static str>> = Lazy::new(|| {
    register_font(
        CHART_FONT_FAMILY,
        FontStyle::Normal,
        include_bytes!("../assets/DejaVuSans.ttf"),
    )
    .map_err(|_| "bundled chart font is not a valid TrueType file")
});

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("need at least two observations for a trend, have {rows}")]
    InsufficientData { rows: usize },
    #[error("failed to read price history: {0}")]
    History(#[from] csv::Error),
    #[error("failed to render chart: {0}")]
    Render(String),
    #[error("failed to write chart to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Lowest observed fare and the chart drawn from the full history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub min_price: u32,
    pub flight_number: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub departure_port: String,
    pub arrival_port: String,
    pub captured_at: NaiveDateTime,
    pub chart_path: PathBuf,
}

pub fn analyze(history: &Path, chart_path: &Path) -> Result<AnalysisSummary, AnalysisError> {
    info!("Analyzing price history in {}", history.display());
    let mut observations = match load_history(history) {
        Ok(rows) => rows,
        Err(e) if matches!(e.kind(), csv::ErrorKind::Io(inner) if inner.kind() == io::ErrorKind::NotFound) => {
            return Err(AnalysisError::InsufficientData { rows: 0 });
        }
        Err(e) => return Err(e.into()),
    };
    if observations.len() < MIN_ROWS {
        return Err(AnalysisError::InsufficientData {
            rows: observations.len(),
        });
    }

    // stable, so equal timestamps keep file order
    observations.sort_by_key(|o| o.scrape_timestamp);

    let cheapest = lowest_fare(&observations)
        .ok_or(AnalysisError::InsufficientData { rows: 0 })?
        .clone();
    info!(
        "Lowest fare so far: ¥{} on {}",
        cheapest.price, cheapest.flight_number
    );

    let png = render_trend_chart(&observations).map_err(|e| AnalysisError::Render(e.to_string()))?;
    write_chart(chart_path, &png)?;
    info!("Price trend chart saved to {}", chart_path.display());

    Ok(AnalysisSummary {
        min_price: cheapest.price,
        flight_number: cheapest.flight_number,
        departure_time: cheapest.departure_time,
        arrival_time: cheapest.arrival_time,
        departure_port: cheapest.departure_port,
        arrival_port: cheapest.arrival_port,
        captured_at: cheapest.scrape_timestamp,
        chart_path: chart_path.to_path_buf(),
    })
}

/// First observation carrying the minimum price.
fn lowest_fare(observations: &[Observation]) -> Option<&Observation> {
    observations.iter().min_by_key(|o| o.price)
}

fn write_chart(path: &Path, png: &[u8]) -> Result<(), AnalysisError> {
    let write_err = |source| AnalysisError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(write_err)?;
    }
    fs::write(path, png).map_err(write_err)
}

fn as_utc(ts: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&ts)
}

/// Price points per flight number, in timestamp order.
fn series_by_flight(observations: &[Observation]) -> BTreeMap<&str, Vec<(DateTime<Utc>, u64)>> {
    let mut series: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    for o in observations {
        series
            .entry(o.flight_number.as_str())
            .or_default()
            .push((as_utc(o.scrape_timestamp), u64::from(o.price)));
    }
    series
}

/// Draws one line per flight number; expects observations sorted by time.
fn render_trend_chart(observations: &[Observation]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let (Some(first), Some(last)) = (observations.first(), observations.last()) else {
        return Err("no observations to plot".into());
    };
    (*CHART_FONT)?;

    // prices are plotted as u64 so the padded axis can extend past u32::MAX
    let lo = observations.iter().map(|o| u64::from(o.price)).min().unwrap_or(0);
    let hi = observations.iter().map(|o| u64::from(o.price)).max().unwrap_or(0);
    let pad = ((hi - lo) / 10).max(10);

    let mut start = as_utc(first.scrape_timestamp);
    let mut end = as_utc(last.scrape_timestamp);
    if start == end {
        start -= Duration::hours(1);
        end += Duration::hours(1);
    }

    let title = format!(
        "Flight price trend ({} - {})",
        first.scrape_timestamp.date(),
        last.scrape_timestamp.date()
    );

    let (width, height) = CHART_SIZE;
    let mut pixels = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut pixels, CHART_SIZE).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(title, (CHART_FONT_FAMILY, 32))
            .margin(20)
            .x_label_area_size(60)
            .y_label_area_size(80)
            .build_cartesian_2d(start..end, lo.saturating_sub(pad)..hi + pad)?;

        chart
            .configure_mesh()
            .label_style((CHART_FONT_FAMILY, 16))
            .x_desc("Captured at")
            .y_desc("Price (¥)")
            .x_label_formatter(&|t: &DateTime<Utc>| t.format("%m-%d %H:%M").to_string())
            .draw()?;

        for (idx, (flight, points)) in series_by_flight(observations).into_iter().enumerate() {
            let color = Palette99::pick(idx).mix(0.9);
            chart
                .draw_series(LineSeries::new(points.iter().copied(), color.stroke_width(2)))?
                .label(flight)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
            chart.draw_series(points.iter().map(|&p| Circle::new(p, 4, color.filled())))?;
        }

        chart
            .configure_series_labels()
            .label_font((CHART_FONT_FAMILY, 16))
            .position(SeriesLabelPosition::UpperRight)
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()?;

        root.present()?;
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png).write_image(&pixels, width, height, ColorType::Rgb8)?;
    Ok(png)
}

/// Logs why a report could not be produced; insufficient data is routine.
pub fn log_skipped(err: &AnalysisError) {
    match err {
        AnalysisError::InsufficientData { .. } => warn!("Skipping daily report: {err}"),
        other => error!("Daily analysis failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::TempDir;

    use super::*;
    use crate::scraper::FlightRecord;
    use crate::storage::CsvStore;

    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    fn flight(number: &str, price: u32) -> FlightRecord {
        FlightRecord {
            flight_number: number.into(),
            departure_time: "07:30".into(),
            arrival_time: "09:45".into(),
            departure_port: "PEK".into(),
            arrival_port: "SHA".into(),
            price,
            source_website: "Fliggy".into(),
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, day)
            .unwrap()
            .and_hms_opt(hour, 1, 0)
            .unwrap()
    }

    struct Fixture {
        dir: TempDir,
        store: CsvStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = CsvStore::new(dir.path().join("prices.csv"));
            Self { dir, store }
        }

        fn chart(&self) -> PathBuf {
            self.dir.path().join("trend.png")
        }

        fn run(&self) -> Result<AnalysisSummary, AnalysisError> {
            analyze(self.store.path(), &self.chart())
        }
    }

    #[test]
    fn missing_history_is_insufficient() {
        let fx = Fixture::new();

        assert!(matches!(fx.run(), Err(AnalysisError::InsufficientData { rows: 0 })));
        assert!(!fx.chart().exists());
    }

    #[test]
    fn single_row_is_insufficient_and_draws_nothing() {
        let fx = Fixture::new();
        fx.store.append_at(&[flight("CA1234", 900)], at(13, 5)).unwrap();

        assert!(matches!(fx.run(), Err(AnalysisError::InsufficientData { rows: 1 })));
        assert!(!fx.chart().exists());
    }

    #[test]
    fn reports_true_minimum_and_writes_chart() {
        let fx = Fixture::new();
        fx.store
            .append_at(&[flight("CA1234", 980), flight("MU5101", 1020)], at(13, 5))
            .unwrap();
        fx.store
            .append_at(&[flight("CA1234", 760), flight("MU5101", 990)], at(13, 6))
            .unwrap();
        fx.store
            .append_at(&[flight("CA1234", 810), flight("MU5101", 870)], at(14, 5))
            .unwrap();

        let summary = fx.run().unwrap();

        assert_eq!(summary.min_price, 760);
        assert_eq!(summary.flight_number, "CA1234");
        assert_eq!(summary.captured_at, at(13, 6));
        assert_eq!(summary.chart_path, fx.chart());
        let png = fs::read(fx.chart()).unwrap();
        assert!(png.starts_with(PNG_SIGNATURE));
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), CHART_SIZE);
    }

    #[test]
    fn ties_resolve_to_earliest_observation() {
        let fx = Fixture::new();
        fx.store.append_at(&[flight("MU5101", 700)], at(14, 5)).unwrap();
        fx.store.append_at(&[flight("CA1234", 700)], at(13, 5)).unwrap();
        fx.store.append_at(&[flight("HU7605", 700)], at(13, 5)).unwrap();

        let summary = fx.run().unwrap();

        assert_eq!(summary.flight_number, "CA1234");
        assert_eq!(summary.captured_at, at(13, 5));
    }

    #[test]
    fn single_batch_still_charts() {
        let fx = Fixture::new();
        fx.store
            .append_at(&[flight("CA1234", 980), flight("MU5101", 1020)], at(13, 5))
            .unwrap();

        let summary = fx.run().unwrap();

        assert_eq!(summary.min_price, 980);
        assert!(fx.chart().exists());
    }

    #[test]
    fn corrupt_timestamp_fails_without_chart() {
        let fx = Fixture::new();
        fx.store
            .append_at(&[flight("CA1234", 980), flight("MU5101", 1020)], at(13, 5))
            .unwrap();
        let raw = fs::read_to_string(fx.store.path()).unwrap();
        fs::write(fx.store.path(), raw.replace("2025-07-13 05:01:00", "yesterday")).unwrap();

        assert!(matches!(fx.run(), Err(AnalysisError::History(_))));
        assert!(!fx.chart().exists());
    }

    #[test]
    fn rerun_overwrites_chart() {
        let fx = Fixture::new();
        fs::write(fx.chart(), "stale").unwrap();
        fx.store
            .append_at(&[flight("CA1234", 980), flight("MU5101", 1020)], at(13, 5))
            .unwrap();

        fx.run().unwrap();

        assert!(fs::read(fx.chart()).unwrap().starts_with(PNG_SIGNATURE));
    }

    #[test]
    fn extreme_prices_do_not_overflow_axis() {
        let fx = Fixture::new();
        fx.store
            .append_at(&[flight("CA1234", u32::MAX - 1), flight("MU5101", 5)], at(13, 5))
            .unwrap();

        let summary = fx.run().unwrap();

        assert_eq!(summary.min_price, 5);
        assert!(fs::read(fx.chart()).unwrap().starts_with(PNG_SIGNATURE));
    }
}
