use std::time::Duration;

use fantoccini::elements::Element;
use fantoccini::error::{CmdError, NewSessionError};
use fantoccini::wd::{Capabilities, WebDriverCompatibleCommand};
use fantoccini::{Client, ClientBuilder, Locator};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Instant, sleep};
use url::Url;

use crate::config::{BrowserKind, BrowserSettings, Route};

/// Upper bound for every wait on a single page element.
pub const ELEMENT_WAIT: Duration = Duration::from_secs(20);
/// Time given to the results list to fill in after its container shows up.
pub const RESULTS_SETTLE: Duration = Duration::from_secs(5);
const TYPING_PAUSE: Duration = Duration::from_secs(1);
const FOCUS_PAUSE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const SOURCE_WEBSITE: &str = "Fliggy";
const SEARCH_URL: &str = "https://sjipiao.fliggy.com/flight_search_result.htm";

const DEP_CITY_INPUT: &str = r#"input[name="depCityName"]"#;
const ARR_CITY_INPUT: &str = r#"input[name="arrCityName"]"#;
const CITY_SUGGESTION: &str = "div.J_AcItem";
const SEARCH_BUTTON: &str = "input.pi-btn-primary";
const FLIGHT_LIST: &str = "div.flight-list";

const HIDE_WEBDRIVER_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined })";

static FLIGHT_CARD: Lazy<Selector> = Lazy::new(|| Selector::parse("div.flight-list-item").unwrap());
static FLIGHT_NUMBER: Lazy<Selector> = Lazy::new(|| Selector::parse("span.J_line").unwrap());
static DEP_TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("p.flight-time-deptime").unwrap());
static ARR_TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("span.s-time").unwrap());
static PRICE: Lazy<Selector> = Lazy::new(|| Selector::parse("span.J_FlightListPrice").unwrap());
static DEP_PORT: Lazy<Selector> = Lazy::new(|| Selector::parse("p.port-dep").unwrap());
static ARR_PORT: Lazy<Selector> = Lazy::new(|| Selector::parse("p.port-arr").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("`{selector}` was not ready within {timeout:?}")]
    ElementTimeout {
        selector: &'static str,
        timeout: Duration,
    },
    #[error("no city suggestions found for `{0}`")]
    NoSuggestions(String),
    #[error("no visible city suggestion for `{0}`")]
    NoVisibleSuggestion(String),
    #[error("could not start browser session: {0}")]
    Session(#[from] NewSessionError),
    #[error("webdriver command failed: {0}")]
    Command(#[from] CmdError),
    #[error("invalid search url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum CardError {
    #[error("missing element: {0}")]
    Missing(&'static str),
    #[error("unparseable price `{0}`")]
    Price(String),
}

/// One flight as listed on the results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub flight_number: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub departure_port: String,
    pub arrival_port: String,
    pub price: u32,
    pub source_website: String,
}

/// The site-specific interaction steps of one search.
pub trait SearchPage {
    async fn set_departure_city(&mut self, city: &str) -> Result<(), ExtractionError>;
    async fn set_arrival_city(&mut self, city: &str) -> Result<(), ExtractionError>;
    async fn submit(&mut self) -> Result<(), ExtractionError>;
    async fn list_results(&mut self) -> Result<Vec<FlightRecord>, ExtractionError>;
    async fn close(self);
}

/// Anything that can produce the current listings for a route.
pub trait PriceSource {
    async fn fetch(&self, route: &Route) -> Result<Vec<FlightRecord>, ExtractionError>;
}

/// Runs the fixed search sequence and closes the page whatever the outcome.
pub async fn run_search<P: SearchPage>(
    mut page: P,
    route: &Route,
) -> Result<Vec<FlightRecord>, ExtractionError> {
    let result = search(&mut page, route).await;
    page.close().await;
    info!("Browser session closed");
    result
}

async fn search<P: SearchPage>(
    page: &mut P,
    route: &Route,
) -> Result<Vec<FlightRecord>, ExtractionError> {
    page.set_departure_city(&route.departure_city).await?;
    page.set_arrival_city(&route.arrival_city).await?;
    page.submit().await?;
    let flights = page.list_results().await?;
    if flights.is_empty() {
        warn!("No flights listed on the results page");
    } else {
        info!("Parsed {} flights", flights.len());
    }
    Ok(flights)
}

fn select_one<'a>(card: &ElementRef<'a>, selector: &Selector, name: &'static str) -> Result<ElementRef<'a>, CardError> {
    card.select(selector).next().ok_or(CardError::Missing(name))
}

/// First non-empty text node, so nested badges or hidden spans are not glued on.
fn select_text(card: &ElementRef, selector: &Selector, name: &'static str) -> Result<String, CardError> {
    let el = select_one(card, selector, name)?;
    Ok(el
        .text()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
        .to_string())
}

/// Whole text of a price cell; currency marks and suffixes are split across nodes.
fn select_price(card: &ElementRef, name: &'static str) -> Result<u32, CardError> {
    let text: String = select_one(card, &PRICE, name)?.text().collect();
    parse_price(&text)
}

/// Keeps only the digits of a displayed price, so `¥1,234元` becomes 1234.
pub fn parse_price(text: &str) -> Result<u32, CardError> {
    text.chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .map_err(|_| CardError::Price(text.to_string()))
}

fn parse_flight_card(card: ElementRef) -> Result<FlightRecord, CardError> {
    Ok(FlightRecord {
        flight_number: select_text(&card, &FLIGHT_NUMBER, "flight number")?,
        departure_time: select_text(&card, &DEP_TIME, "departure time")?,
        arrival_time: select_text(&card, &ARR_TIME, "arrival time")?,
        departure_port: select_text(&card, &DEP_PORT, "departure port")?,
        arrival_port: select_text(&card, &ARR_PORT, "arrival port")?,
        price: select_price(&card, "price")?,
        source_website: SOURCE_WEBSITE.to_string(),
    })
}

/// Parses every flight card on a rendered results page. Broken cards are skipped.
pub fn parse_results(page_source: &str) -> Vec<FlightRecord> {
    let document = Html::parse_document(page_source);
    let cards: Vec<_> = document.select(&FLIGHT_CARD).collect();
    debug!("Found {} flight cards", cards.len());

    cards
        .into_iter()
        .filter_map(|card| match parse_flight_card(card) {
            Ok(flight) => Some(flight),
            Err(e) => {
                warn!("Skipping flight card: {e}");
                None
            }
        })
        .collect()
}

fn search_url(route: &Route) -> Result<Url, url::ParseError> {
    Url::parse_with_params(
        SEARCH_URL,
        &[
            ("tripType", "0".to_string()),
            ("depDate", route.departure_date.format("%Y-%m-%d").to_string()),
        ],
    )
}

impl BrowserKind {
    const fn options_key(self) -> &'static str {
        match self {
            Self::Chrome => "goog:chromeOptions",
            Self::Edge => "ms:edgeOptions",
        }
    }

    const fn cdp_endpoint(self) -> &'static str {
        match self {
            Self::Chrome => "goog/cdp/execute",
            Self::Edge => "ms/cdp/execute",
        }
    }
}

fn capabilities(settings: &BrowserSettings) -> Capabilities {
    let mut args = vec![
        "--disable-gpu",
        "--no-sandbox",
        "--window-size=1920,1080",
        "blink-settings=imagesEnabled=false",
        "--log-level=3",
    ];
    if settings.headless {
        args.insert(0, "--headless");
    }

    let mut caps = Capabilities::new();
    caps.insert(
        settings.kind.options_key().to_string(),
        json!({
            "args": args,
            "excludeSwitches": ["enable-automation", "enable-logging"],
            "useAutomationExtension": false,
        }),
    );
    caps
}

/// Chromium vendor command that runs a CDP method in the current session.
#[derive(Debug)]
struct ExecuteCdp {
    endpoint: &'static str,
    body: serde_json::Value,
}

impl WebDriverCompatibleCommand for ExecuteCdp {
    fn endpoint(&self, base_url: &Url, session_id: Option<&str>) -> Result<Url, url::ParseError> {
        let session = session_id.ok_or(url::ParseError::EmptyHost)?;
        base_url.join(&format!("session/{session}/{}", self.endpoint))
    }

    fn method_and_body(&self, _request_url: &Url) -> (http::Method, Option<String>) {
        (http::Method::POST, Some(self.body.to_string()))
    }
}

/// The Fliggy search page driven through WebDriver.
pub struct FliggyPage {
    client: Client,
}

impl FliggyPage {
    pub async fn open(settings: &BrowserSettings, route: &Route) -> Result<Self, ExtractionError> {
        let mut builder = ClientBuilder::rustls();
        builder.capabilities(capabilities(settings));
        let client = builder.connect(&settings.webdriver_url).await?;
        let page = Self { client };

        let prepared = page.prepare(settings.kind, route).await;
        match prepared {
            Ok(()) => Ok(page),
            Err(e) => {
                page.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, kind: BrowserKind, route: &Route) -> Result<(), ExtractionError> {
        self.client
            .issue_cmd(ExecuteCdp {
                endpoint: kind.cdp_endpoint(),
                body: json!({
                    "cmd": "Page.addScriptToEvaluateOnNewDocument",
                    "params": { "source": HIDE_WEBDRIVER_SCRIPT },
                }),
            })
            .await?;
        debug!("Injected webdriver masking script");

        let url = search_url(route)?;
        info!("Opening {url}");
        self.client.goto(url.as_str()).await?;
        Ok(())
    }

    async fn wait_present(&self, selector: &'static str) -> Result<Element, ExtractionError> {
        self.client
            .wait()
            .at_most(ELEMENT_WAIT)
            .for_element(Locator::Css(selector))
            .await
            .map_err(|e| match e {
                CmdError::WaitTimeout => ExtractionError::ElementTimeout {
                    selector,
                    timeout: ELEMENT_WAIT,
                },
                other => other.into(),
            })
    }

    /// First element matching `selector` that is both displayed and enabled.
    async fn wait_clickable(&self, selector: &'static str) -> Result<Element, ExtractionError> {
        let deadline = Instant::now() + ELEMENT_WAIT;
        loop {
            for element in self.client.find_all(Locator::Css(selector)).await? {
                if element.is_displayed().await.unwrap_or(false)
                    && element.is_enabled().await.unwrap_or(false)
                {
                    return Ok(element);
                }
            }
            if Instant::now() >= deadline {
                return Err(ExtractionError::ElementTimeout {
                    selector,
                    timeout: ELEMENT_WAIT,
                });
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

impl SearchPage for FliggyPage {
    async fn set_departure_city(&mut self, city: &str) -> Result<(), ExtractionError> {
        let input = self.wait_clickable(DEP_CITY_INPUT).await?;
        input.click().await?;
        sleep(FOCUS_PAUSE).await;
        input.clear().await?;
        input.send_keys(city).await?;
        debug!("Typed departure city {city}");
        sleep(TYPING_PAUSE).await;

        self.wait_clickable(CITY_SUGGESTION).await?.click().await?;
        info!("Selected departure city {city}");
        sleep(TYPING_PAUSE).await;
        Ok(())
    }

    async fn set_arrival_city(&mut self, city: &str) -> Result<(), ExtractionError> {
        let input = self.wait_clickable(ARR_CITY_INPUT).await?;
        input.click().await?;
        input.send_keys(city).await?;
        debug!("Typed arrival city {city}");
        sleep(TYPING_PAUSE).await;

        // several suggestion lists live in the DOM, only one is rendered
        self.wait_present(CITY_SUGGESTION).await?;
        let suggestions = self.client.find_all(Locator::Css(CITY_SUGGESTION)).await?;
        if suggestions.is_empty() {
            return Err(ExtractionError::NoSuggestions(city.to_string()));
        }
        debug!("Found {} arrival suggestions", suggestions.len());

        for suggestion in suggestions {
            if suggestion.is_displayed().await? {
                suggestion.click().await?;
                info!("Selected arrival city {city}");
                return Ok(());
            }
        }
        Err(ExtractionError::NoVisibleSuggestion(city.to_string()))
    }

    async fn submit(&mut self) -> Result<(), ExtractionError> {
        self.wait_clickable(SEARCH_BUTTON).await?.click().await?;
        info!("Search submitted, waiting for results");
        self.wait_present(FLIGHT_LIST).await?;
        sleep(RESULTS_SETTLE).await;
        Ok(())
    }

    async fn list_results(&mut self) -> Result<Vec<FlightRecord>, ExtractionError> {
        let source = self.client.source().await?;
        Ok(parse_results(&source))
    }

    async fn close(self) {
        if let Err(e) = self.client.close().await {
            warn!("Failed to close browser session: {e}");
        }
    }
}

/// Scrapes Fliggy with a fresh browser session per fetch.
pub struct FliggyScraper {
    settings: BrowserSettings,
}

impl FliggyScraper {
    pub const fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

impl PriceSource for FliggyScraper {
    async fn fetch(&self, route: &Route) -> Result<Vec<FlightRecord>, ExtractionError> {
        info!(
            "Scraping Fliggy: {} -> {} ({}) via {}",
            route.departure_city, route.arrival_city, route.departure_date, self.settings.kind
        );
        let page = FliggyPage::open(&self.settings, route).await?;
        run_search(page, route).await
    }
}
