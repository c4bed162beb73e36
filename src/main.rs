use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::{Host, Url};

#[derive(Parser)]
#[command(name = "phishprobe")]
#[command(about = "A Rust CLI tool that classifies URLs as phishing or legitimate via heuristic feature extraction")]
struct Cli {
    /// URL to check
    url: String,

    /// Print the feature vector and verdict as JSON
    #[arg(long)]
    json: bool,

    /// Skip all network probes; network-derived features resolve to their fallback values
    #[arg(long)]
    offline: bool,

    /// HTTP timeout in seconds for page and ranking lookups
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Skip the post-classification reachability report
    #[arg(long)]
    skip_accessibility: bool,
}

/// Feature schema shared with the classifier artifact. The index layout is
/// frozen: the model was trained on exactly this ordering, so any reorder is
/// a silent correctness bug. Bump `SCHEMA_VERSION` if the layout ever changes.
mod idx {
    pub const HAVE_IP: usize = 0;
    pub const HAS_AT: usize = 1;
    pub const URL_LENGTH: usize = 2;
    pub const URL_DEPTH: usize = 3;
    pub const REDIRECTION: usize = 4;
    pub const HTTPS_IN_HOST: usize = 5;
    pub const SHORTENER: usize = 6;
    pub const HYPHEN_IN_HOST: usize = 7;
    pub const DNS_RECORD: usize = 8;
    pub const WEB_TRAFFIC: usize = 9;
    pub const DOMAIN_AGE: usize = 10;
    pub const DOMAIN_END: usize = 11;
    pub const IFRAME: usize = 12;
    pub const MOUSE_OVER: usize = 13;
    pub const RIGHT_CLICK: usize = 14;
    pub const WEB_FORWARD: usize = 15;
    pub const COUNT: usize = 16;
}

const SCHEMA_VERSION: u32 = 1;

const FEATURE_NAMES: [&str; idx::COUNT] = [
    "have_ip",
    "has_at",
    "url_length",
    "url_depth",
    "redirection",
    "https_in_host",
    "shortener",
    "hyphen_in_host",
    "dns_record",
    "web_traffic",
    "domain_age",
    "domain_end",
    "iframe",
    "mouse_over",
    "right_click",
    "web_forward",
];

/// Value substituted when a probe cannot complete. The first eight features
/// are pure string checks and never consult this table. Network-derived
/// features default to 1: for most of them that is the phishing-leaning
/// value, but for the four page-content checks 1 is the benign encoding, an
/// asymmetry inherited from the reference heuristics and kept as observed.
const FALLBACKS: [i64; idx::COUNT] = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

// Known URL-shortening services. The list and its case-sensitive spelling
// are frozen together with the feature schema.
static SHORTENER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"bit\.ly|goo\.gl|shorte\.st|go2l\.ink|x\.co|ow\.ly|t\.co|tinyurl|tr\.im|is\.gd|cli\.gs|",
        r"yfrog\.com|migre\.me|ff\.im|tiny\.cc|url4\.eu|twit\.ac|su\.pr|twurl\.nl|snipurl\.com|",
        r"short\.to|BudURL\.com|ping\.fm|post\.ly|Just\.as|bkite\.com|snipr\.com|fic\.kr|loopt\.us|",
        r"doiop\.com|short\.ie|kl\.am|wp\.me|rubyurl\.com|om\.ly|to\.ly|bit\.do|t\.co|lnkd\.in|db\.tt|",
        r"qr\.ae|adf\.ly|goo\.gl|bitly\.com|cur\.lv|tinyurl\.com|ow\.ly|bit\.ly|ity\.im|q\.gs|is\.gd|",
        r"po\.st|bc\.vc|twitthis\.com|u\.to|j\.mp|buzurl\.com|cutt\.us|u\.bb|yourls\.org|x\.co|",
        r"prettylinkpro\.com|scrnch\.me|filoops\.info|vzturl\.com|qr\.net|1url\.com|tweez\.me|v\.gd|",
        r"tr\.im|link\.zip\.net"
    ))
    .unwrap()
});

static IFRAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<iframe>|<frameBorder>").unwrap());

static RANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"REACH[^>]*RANK="(\d+)""#).unwrap());

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for the remote service")]
    Timeout,
    #[error("no registration record found")]
    NoRecord,
    #[error("URL has no host component")]
    NoHost,
    #[error("unparseable service response")]
    Malformed,
    #[error("network probes disabled")]
    Disabled,
}

/// Outcome of a single probe before it becomes a feature value. Collapsing
/// through `FALLBACKS` keeps the failure bias of every feature in one
/// auditable place instead of scattered through error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeResult {
    Ok(i64),
    Unavailable(&'static str),
}

impl ProbeResult {
    fn collapse(self, index: usize) -> i64 {
        match self {
            ProbeResult::Ok(value) => value,
            ProbeResult::Unavailable(reason) => {
                debug!(
                    "{} unavailable ({}), using fallback {}",
                    FEATURE_NAMES[index], reason, FALLBACKS[index]
                );
                FALLBACKS[index]
            }
        }
    }
}

/// Ordered feature values in schema layout. Built fresh per URL, handed to
/// the classifier, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FeatureVector([i64; idx::COUNT]);

impl FeatureVector {
    fn values(&self) -> &[i64; idx::COUNT] {
        &self.0
    }
}

/// Registration metadata pulled out of a WHOIS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DomainRecord {
    created: Option<NaiveDateTime>,
    expires: Option<NaiveDateTime>,
}

/// Status and body captured by the single page fetch, reused by all four
/// content checks.
#[derive(Debug, Clone)]
struct PageSnapshot {
    status: u16,
    body: String,
}

/// Raw probe outcomes gathered ahead of assembly. Keeping the network
/// results separate from the vector makes assembly a pure, replayable
/// function.
struct ProbeInputs {
    whois: Result<DomainRecord, ProbeError>,
    rank: Result<u64, ProbeError>,
    page: Result<PageSnapshot, ProbeError>,
}

impl ProbeInputs {
    fn disabled() -> Self {
        ProbeInputs {
            whois: Err(ProbeError::Disabled),
            rank: Err(ProbeError::Disabled),
            page: Err(ProbeError::Disabled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Verdict {
    Legitimate,
    Phishing,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Legitimate => write!(f, "legitimate"),
            Verdict::Phishing => write!(f, "phishing"),
        }
    }
}

trait Classifier {
    fn predict(&self, vector: &FeatureVector) -> Verdict;
}

/// Stand-in for the externally trained model artifact. A real deployment
/// swaps this for a wrapper around the frozen classifier; the contract is
/// only the trait and the feature schema. Weights mirror the usual polarity
/// of each signal; `web_traffic` carries no weight because its encoding is
/// ambiguous in the inherited schema (the failure fallback and the
/// popular-site value are both 1).
struct WeightedClassifier {
    threshold: i64,
}

impl Default for WeightedClassifier {
    fn default() -> Self {
        WeightedClassifier { threshold: 5 }
    }
}

impl Classifier for WeightedClassifier {
    fn predict(&self, vector: &FeatureVector) -> Verdict {
        let x = vector.values();
        let mut score = 0i64;
        score += 2 * x[idx::HAVE_IP];
        score += 2 * x[idx::HAS_AT];
        score += x[idx::URL_LENGTH];
        score += i64::from(x[idx::URL_DEPTH] > 3);
        score += x[idx::REDIRECTION];
        score += 2 * x[idx::HTTPS_IN_HOST];
        score += 2 * x[idx::SHORTENER];
        score += x[idx::HYPHEN_IN_HOST];
        score += 2 * x[idx::DNS_RECORD];
        score += x[idx::DOMAIN_AGE];
        score += x[idx::DOMAIN_END];
        // iframe uses an inverted encoding: 0 means a frame was found
        score += 2 * (1 - x[idx::IFRAME]);
        score += x[idx::MOUSE_OVER];
        score += x[idx::RIGHT_CLICK];
        score += x[idx::WEB_FORWARD];
        debug!("classifier score {} (threshold {})", score, self.threshold);
        if score >= self.threshold {
            Verdict::Phishing
        } else {
            Verdict::Legitimate
        }
    }
}

// --- URL syntax analyzer -------------------------------------------------
// Pure functions of the URL string; no I/O and no failure path. The IP parse
// is expected to fail for ordinary hostnames, which simply yields 0.

fn have_ip(raw: &str, parsed: Option<&Url>) -> bool {
    if raw.trim().parse::<IpAddr>().is_ok() {
        return true;
    }
    matches!(
        parsed.and_then(|u| u.host()),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_))
    )
}

fn url_depth(parsed: Option<&Url>) -> i64 {
    parsed
        .map(|u| u.path().split('/').filter(|s| !s.is_empty()).count() as i64)
        .unwrap_or(0)
}

fn has_redirection(raw: &str) -> bool {
    // a "//" past offset 7 cannot be the scheme separator
    raw.rfind("//").map_or(false, |pos| pos > 7)
}

fn host_of<'a>(parsed: Option<&'a Url>) -> &'a str {
    parsed.and_then(|u| u.host_str()).unwrap_or("")
}

fn syntax_features(raw: &str, parsed: Option<&Url>) -> [i64; 8] {
    let host = host_of(parsed);
    [
        i64::from(have_ip(raw, parsed)),
        i64::from(raw.contains('@')),
        i64::from(raw.chars().count() >= 54),
        url_depth(parsed),
        i64::from(has_redirection(raw)),
        i64::from(host.contains("https")),
        i64::from(SHORTENER_RE.is_match(raw)),
        i64::from(host.contains('-')),
    ]
}

// --- Domain intelligence probe -------------------------------------------
// WHOIS over TCP port 43. Never propagates an error past the assembler; any
// failure collapses to the fallback column of the schema.

fn whois_server(tld: &str) -> &'static str {
    match tld {
        "com" | "net" => "whois.verisign-grs.com:43",
        "org" => "whois.pir.org:43",
        "info" => "whois.afilias.net:43",
        "biz" => "whois.neulevel.biz:43",
        "us" => "whois.nic.us:43",
        "co" => "whois.nic.co:43",
        "io" => "whois.nic.io:43",
        "me" => "whois.nic.me:43",
        "uk" => "whois.nic.uk:43",
        "ca" => "whois.cira.ca:43",
        "de" => "whois.denic.de:43",
        "fr" => "whois.afnic.fr:43",
        "ru" => "whois.tcinet.ru:43",
        "cn" => "whois.cnnic.net.cn:43",
        "jp" => "whois.jprs.jp:43",
        "au" => "whois.auda.org.au:43",
        "br" => "whois.registro.br:43",
        "tk" => "whois.dot.tk:43",
        "ml" => "whois.dot.ml:43",
        "ga" => "whois.dot.ga:43",
        "cf" => "whois.dot.cf:43",
        "app" | "dev" => "whois.nic.google:43",
        "tech" => "whois.nic.tech:43",
        _ => "whois.iana.org:43",
    }
}

async fn whois_lookup(host: &str) -> Result<DomainRecord, ProbeError> {
    let tld = host.rsplit('.').next().unwrap_or("");
    let server = whois_server(tld);
    debug!("querying {} for {}", server, host);

    let mut stream = timeout(Duration::from_secs(10), TcpStream::connect(server))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    let query = format!("{}\r\n", host);
    timeout(Duration::from_secs(5), stream.write_all(query.as_bytes()))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    let mut response = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout)??;

    parse_whois_record(&String::from_utf8_lossy(&response))
}

fn parse_whois_record(text: &str) -> Result<DomainRecord, ProbeError> {
    if text.trim().is_empty() {
        return Err(ProbeError::Malformed);
    }

    let lower = text.to_lowercase();
    let no_record_markers = [
        "no match",
        "not found",
        "no entries found",
        "domain not found",
        "no data found",
        "domain status: available",
    ];
    if no_record_markers.iter().any(|m| lower.contains(m)) {
        return Err(ProbeError::NoRecord);
    }

    Ok(DomainRecord {
        created: field_date(
            text,
            &["creation date:", "created on:", "created:", "registered:"],
        ),
        expires: field_date(
            text,
            &[
                "registry expiry date:",
                "registrar registration expiration date:",
                "expiration date:",
                "expiry date:",
                "expires:",
                "paid-till:",
            ],
        ),
    })
}

/// First line carrying one of the given keys wins, mirroring the reference
/// behavior of taking the head of a multi-valued WHOIS field.
fn field_date(text: &str, keys: &[&str]) -> Option<NaiveDateTime> {
    for line in text.lines() {
        if !line.is_ascii() {
            continue;
        }
        let lower = line.to_lowercase();
        for key in keys {
            if let Some(pos) = lower.find(key) {
                if let Some(date) = parse_whois_date(&line[pos + key.len()..]) {
                    return Some(date);
                }
            }
        }
    }
    None
}

fn parse_whois_date(raw: &str) -> Option<NaiveDateTime> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(dt);
        }
    }

    let token = cleaned.split_whitespace().next()?;
    for fmt in ["%Y-%m-%d", "%d-%b-%Y", "%Y.%m.%d", "%Y/%m/%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(token, fmt) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Derives the DNS-record flag and the two registration-window features.
/// A failed lookup marks the record missing and pushes both date features to
/// their suspicious fallback; a record missing one of its dates only
/// degrades the features that need it.
fn domain_features(
    lookup: &Result<DomainRecord, ProbeError>,
    now: NaiveDateTime,
) -> (ProbeResult, ProbeResult, ProbeResult) {
    let record = match lookup {
        Ok(record) => record,
        Err(_) => {
            return (
                ProbeResult::Unavailable("registration lookup failed"),
                ProbeResult::Unavailable("registration lookup failed"),
                ProbeResult::Unavailable("registration lookup failed"),
            );
        }
    };

    let age = match (record.created, record.expires) {
        (Some(created), Some(expires)) => {
            let days = (expires - created).num_days().abs() as f64;
            ProbeResult::Ok(i64::from(days / 30.0 < 6.0))
        }
        _ => ProbeResult::Unavailable("record missing creation or expiry date"),
    };

    let end = match record.expires {
        Some(expires) => {
            let days = (expires - now).num_days().abs() as f64;
            ProbeResult::Ok(i64::from(days / 30.0 < 6.0))
        }
        None => ProbeResult::Unavailable("record missing expiry date"),
    };

    (ProbeResult::Ok(0), age, end)
}

// --- Traffic rank probe --------------------------------------------------

async fn traffic_rank(client: &reqwest::Client, raw: &str) -> Result<u64, ProbeError> {
    let response = client
        .get("http://data.alexa.com/data")
        .query(&[("cli", "10"), ("dat", "s"), ("url", raw)])
        .send()
        .await?;
    let body = response.text().await?;
    RANK_RE
        .captures(&body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or(ProbeError::Malformed)
}

fn rank_feature(rank: &Result<u64, ProbeError>) -> ProbeResult {
    match rank {
        Ok(rank) => ProbeResult::Ok(i64::from(*rank < 100_000)),
        Err(_) => ProbeResult::Unavailable("rank lookup failed"),
    }
}

// --- Live page prober ----------------------------------------------------
// One fetch; the four content checks share the snapshot. The reference
// fetched the page once per check, which is semantically identical for a
// static body and four times the traffic.

async fn fetch_page(client: &reqwest::Client, raw: &str) -> Result<PageSnapshot, ProbeError> {
    let response = client.get(raw).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok(PageSnapshot { status, body })
}

/// iframe, mouse-over, right-click and web-forward checks, in schema order.
/// The iframe check only trusts a 200 body and reports benign otherwise; the
/// substring checks inspect whatever body came back regardless of status.
fn content_features(page: &Result<PageSnapshot, ProbeError>) -> [ProbeResult; 4] {
    let snapshot = match page {
        Ok(snapshot) => snapshot,
        Err(_) => return [ProbeResult::Unavailable("page fetch failed"); 4],
    };

    let iframe = if snapshot.status != 200 {
        ProbeResult::Ok(1)
    } else if IFRAME_RE.is_match(&snapshot.body) {
        ProbeResult::Ok(0)
    } else {
        ProbeResult::Ok(1)
    };

    [
        iframe,
        ProbeResult::Ok(i64::from(snapshot.body.contains("onmouseover"))),
        ProbeResult::Ok(i64::from(snapshot.body.contains("contextmenu"))),
        ProbeResult::Ok(i64::from(snapshot.body.contains("forward"))),
    ]
}

// --- Assembler -----------------------------------------------------------

/// Runs the network probes sequentially, each bounded by its own timeout.
/// No retries: a failed fetch resolves through the fallback table.
async fn gather_probes(raw: &str, client: &reqwest::Client, offline: bool) -> ProbeInputs {
    if offline {
        info!("offline mode, skipping network probes");
        return ProbeInputs::disabled();
    }

    let host = Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    let whois = match &host {
        Some(host) => whois_lookup(host).await,
        None => Err(ProbeError::NoHost),
    };
    if let Err(err) = &whois {
        warn!("registration lookup failed: {}", err);
    }

    let rank = traffic_rank(client, raw).await;
    if let Err(err) = &rank {
        warn!("traffic rank lookup failed: {}", err);
    }

    let page = fetch_page(client, raw).await;
    if let Err(err) = &page {
        warn!("page fetch failed: {}", err);
    }

    ProbeInputs { whois, rank, page }
}

/// Pure assembly of the fixed-order vector from the raw URL and the gathered
/// probe outcomes. Identical inputs always yield an identical vector.
fn assemble(raw: &str, inputs: &ProbeInputs, now: NaiveDateTime) -> FeatureVector {
    let parsed = Url::parse(raw).ok();
    let mut values = [0i64; idx::COUNT];

    let syntax = syntax_features(raw, parsed.as_ref());
    values[..8].copy_from_slice(&syntax);

    let (dns, age, end) = domain_features(&inputs.whois, now);
    values[idx::DNS_RECORD] = dns.collapse(idx::DNS_RECORD);
    values[idx::WEB_TRAFFIC] = rank_feature(&inputs.rank).collapse(idx::WEB_TRAFFIC);
    values[idx::DOMAIN_AGE] = age.collapse(idx::DOMAIN_AGE);
    values[idx::DOMAIN_END] = end.collapse(idx::DOMAIN_END);

    let content = content_features(&inputs.page);
    values[idx::IFRAME] = content[0].collapse(idx::IFRAME);
    values[idx::MOUSE_OVER] = content[1].collapse(idx::MOUSE_OVER);
    values[idx::RIGHT_CLICK] = content[2].collapse(idx::RIGHT_CLICK);
    values[idx::WEB_FORWARD] = content[3].collapse(idx::WEB_FORWARD);

    for (name, value) in FEATURE_NAMES.iter().zip(values.iter()) {
        info!("feature {:<14} = {}", name, value);
    }

    FeatureVector(values)
}

// --- Reachability report -------------------------------------------------

async fn check_accessibility(client: &reqwest::Client, raw: &str) -> (bool, String) {
    match client.get(raw).send().await {
        Ok(response) if response.status().is_success() => {
            let body = response.text().await.unwrap_or_default();
            let title = TITLE_RE
                .captures(&body)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "no title found".to_string());
            (true, format!("website is reachable, title: '{}'", title))
        }
        Ok(response) => (
            false,
            format!(
                "website returned status code {}",
                response.status().as_u16()
            ),
        ),
        Err(err) => (false, format!("website is not reachable: {}", err)),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if cli.url.trim().is_empty() {
        eprintln!("please enter a URL to check");
        std::process::exit(2);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.timeout))
        .user_agent(BROWSER_UA)
        .build()
        .unwrap_or_default();

    info!("extracting features for {}", cli.url);
    let inputs = gather_probes(&cli.url, &client, cli.offline).await;
    let vector = assemble(&cli.url, &inputs, Utc::now().naive_utc());

    let verdict = WeightedClassifier::default().predict(&vector);

    let accessibility = if cli.offline || cli.skip_accessibility {
        None
    } else {
        Some(check_accessibility(&client, &cli.url).await)
    };

    if cli.json {
        let report = json!({
            "url": cli.url,
            "schema_version": SCHEMA_VERSION,
            "feature_names": FEATURE_NAMES,
            "vector": vector,
            "verdict": verdict,
            "accessible": accessibility.as_ref().map(|(reachable, _)| *reachable),
            "accessibility": accessibility.as_ref().map(|(_, detail)| detail.clone()),
        });
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{}", out),
            Err(err) => eprintln!("failed to serialize report: {}", err),
        }
    } else {
        println!("{} -> {}", cli.url, verdict);
        if let Some((_, detail)) = &accessibility {
            println!("{}", detail);
        }
        println!("disclaimer: heuristic model with limited accuracy; results are advisory");
    }
}
