use std::{
    fs::OpenOptions,
    io::Write,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use explorer::{
    AntiJoinPolicy, UnreviewedStrategy,
    deadline::QueryDeadline,
    review::{ReviewQuery, ReviewStatusResolver},
};
use filter::{compile, compile_review_filters};
use schema::{Dataset, FilterRequest, Intent, ReviewLogEntry, ReviewMode, Row};
use store::InMemoryStore;

const BENCH_EPOCH: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchmarkProfile {
    Smoke,
    Standard,
    Large,
}

impl BenchmarkProfile {
    fn from_arg(raw: &str) -> Option<Self> {
        match raw {
            "smoke" => Some(Self::Smoke),
            "standard" | "default" => Some(Self::Standard),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    fn fixture_size(self) -> usize {
        match self {
            Self::Smoke => 5_000,
            Self::Standard => 50_000,
            Self::Large => 200_000,
        }
    }

    fn default_iterations(self) -> usize {
        match self {
            Self::Smoke => 20,
            Self::Standard => 10,
            Self::Large => 5,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Smoke => "smoke",
            Self::Standard => "standard",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone)]
struct BenchmarkConfig {
    profile: BenchmarkProfile,
    iterations: Option<usize>,
    /// Percentage of base rows that receive a review.
    reviewed_pct: usize,
    history_out: Option<String>,
}

#[derive(Debug, Clone)]
struct StrategyTiming {
    strategy: UnreviewedStrategy,
    intent: Intent,
    rows: usize,
    avg_ms: f64,
}

#[derive(Debug, Clone)]
struct BenchmarkSummary {
    run_epoch_secs: u64,
    profile: BenchmarkProfile,
    fixture_size: usize,
    reviewed_rows: usize,
    iterations: usize,
    timings: Vec<StrategyTiming>,
}

fn main() {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Benchmark failed: unable to start runtime ({err}).");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(&config)) {
        Ok(summary) => {
            print_summary(&summary);
            if let Some(path) = config.history_out.as_deref()
                && let Err(err) = append_history(path, &summary)
            {
                eprintln!("Benchmark failed: unable to append history ({err}).");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Benchmark failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(config: &BenchmarkConfig) -> Result<BenchmarkSummary, String> {
    let fixture_size = config.profile.fixture_size();
    let iterations = config
        .iterations
        .unwrap_or_else(|| config.profile.default_iterations());
    let dataset = Dataset::MissingDateOfBirth;
    let store = Arc::new(InMemoryStore::new());
    let reviewed_rows = seed_fixture(&store, dataset, fixture_size, config.reviewed_pct)?;

    let resolver = ReviewStatusResolver::new(
        store,
        AntiJoinPolicy::FetchThenSubtract,
        QueryDeadline::disabled(),
    );
    let layout = dataset.layout();
    let tables = dataset.tables(BENCH_EPOCH);
    let mut req = FilterRequest::new(dataset.as_str(), BENCH_EPOCH);
    req.languages_or = Some(vec!["en".to_string(), "de".to_string()]);

    let mut timings = Vec::new();
    for intent in [Intent::Display, Intent::Export] {
        let mut reference: Option<Vec<Row>> = None;
        for strategy in [
            UnreviewedStrategy::FetchThenSubtract,
            UnreviewedStrategy::NativeAntiJoin,
        ] {
            let query = || ReviewQuery {
                layout,
                tables: &tables,
                predicate: compile(&req, layout),
                review_filters: compile_review_filters(&req, layout),
                mode: ReviewMode::Unreviewed,
                intent,
            };
            let start = Instant::now();
            let mut rows = Vec::new();
            for _ in 0..iterations {
                rows = resolver
                    .resolve_unreviewed(strategy, query())
                    .await
                    .map_err(|err| format!("{} failed: {err}", strategy.as_str()))?;
            }
            let avg_ms = start.elapsed().as_secs_f64() * 1000.0 / iterations as f64;

            match &reference {
                None => reference = Some(rows.clone()),
                Some(expected) if *expected != rows => {
                    return Err(format!(
                        "strategies disagree for intent {intent:?}: {} rows vs {} rows",
                        expected.len(),
                        rows.len()
                    ));
                }
                Some(_) => {}
            }
            timings.push(StrategyTiming {
                strategy,
                intent,
                rows: rows.len(),
                avg_ms,
            });
        }
    }

    Ok(BenchmarkSummary {
        run_epoch_secs: now_epoch_secs(),
        profile: config.profile,
        fixture_size,
        reviewed_rows,
        iterations,
        timings,
    })
}

fn parse_args<I>(args: I) -> Result<BenchmarkConfig, String>
where
    I: Iterator<Item = String>,
{
    let mut profile = BenchmarkProfile::Standard;
    let mut iterations = None;
    let mut reviewed_pct = env_or_default_usize("EXPLORER_BENCH_REVIEWED_PCT", 30);
    let mut history_out = std::env::var("EXPLORER_BENCH_HISTORY_OUT").ok();

    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--smoke" => profile = BenchmarkProfile::Smoke,
            "--profile" => {
                let raw = args
                    .next()
                    .ok_or_else(|| "Missing value for --profile".to_string())?;
                profile = BenchmarkProfile::from_arg(&raw)
                    .ok_or_else(|| format!("Unknown profile '{raw}'"))?;
            }
            "--iterations" => {
                iterations = Some(parse_positive_usize_arg(args.next(), "--iterations")?);
            }
            "--reviewed-pct" => {
                reviewed_pct = parse_positive_usize_arg(args.next(), "--reviewed-pct")?;
            }
            "--history-out" => {
                history_out = Some(
                    args.next()
                        .ok_or_else(|| "Missing value for --history-out".to_string())?,
                );
            }
            "-h" | "--help" => return Err(usage_text().to_string()),
            other => return Err(format!("Unknown argument '{other}'\n{}", usage_text())),
        }
    }
    if reviewed_pct > 100 {
        return Err("--reviewed-pct must be <= 100".to_string());
    }

    Ok(BenchmarkConfig {
        profile,
        iterations,
        reviewed_pct,
        history_out,
    })
}

fn env_or_default_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_positive_usize_arg(value: Option<String>, flag: &str) -> Result<usize, String> {
    let raw = value.ok_or_else(|| format!("Missing value for {flag}"))?;
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("Invalid value '{raw}' for {flag}"))?;
    if parsed == 0 {
        return Err(format!("{flag} must be > 0"));
    }
    Ok(parsed)
}

fn usage_text() -> &'static str {
    "Usage: cargo run -p benchmark-smoke -- [--smoke] [--profile smoke|standard|large] [--iterations N] [--reviewed-pct N] [--history-out PATH]"
}

fn seed_fixture(
    store: &InMemoryStore,
    dataset: Dataset,
    count: usize,
    reviewed_pct: usize,
) -> Result<usize, String> {
    let languages = ["en", "de", "en,de", "fr", "en,fr"];
    let tables = dataset.tables(BENCH_EPOCH);
    store
        .add_dataset(dataset.as_str(), &[BENCH_EPOCH])
        .map_err(|err| err.to_string())?;
    store
        .insert_rows(
            &tables.base,
            (0..count).map(|i| {
                Row::missing_value(
                    &format!("Q{i}"),
                    "P569",
                    &format!("https://example.org/{i}"),
                    languages[i % languages.len()],
                )
            }),
        )
        .map_err(|err| err.to_string())?;

    // Spread reviews across the table so both strategies see them early and late.
    let reviewed: Vec<usize> = (0..count).filter(|i| i * 7 % 100 < reviewed_pct).collect();
    let reviewed_rows = reviewed.len();
    store
        .insert_log_entries(
            &tables.log,
            reviewed.into_iter().map(|i| {
                ReviewLogEntry::missing_value(
                    &format!("Q{i}"),
                    "bench",
                    if i % 2 == 0 { "accept" } else { "reject" },
                    "2024-01-01 00:00:00",
                )
            }),
        )
        .map_err(|err| err.to_string())?;
    Ok(reviewed_rows)
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn intent_label(intent: Intent) -> &'static str {
    if intent.is_display() { "display" } else { "export" }
}

fn print_summary(summary: &BenchmarkSummary) {
    println!("Benchmark profile: {}", summary.profile.as_str());
    println!("Benchmark fixture size: {}", summary.fixture_size);
    println!("Reviewed rows: {}", summary.reviewed_rows);
    println!("Iterations: {}", summary.iterations);
    for timing in &summary.timings {
        println!(
            "{} [{}] rows={} avg latency (ms): {:.4}",
            timing.strategy.as_str(),
            intent_label(timing.intent),
            timing.rows,
            timing.avg_ms
        );
    }
    println!("Strategies agree: true");
}

fn append_history(path: &str, summary: &BenchmarkSummary) -> Result<(), std::io::Error> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for timing in &summary.timings {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{:.4}",
            summary.run_epoch_secs,
            summary.profile.as_str(),
            summary.fixture_size,
            summary.reviewed_rows,
            timing.strategy.as_str(),
            intent_label(timing.intent),
            timing.rows,
            timing.avg_ms
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_accepts_profile_and_overrides() {
        let config = parse_args(
            ["--profile", "large", "--iterations", "3", "--reviewed-pct", "50"]
                .into_iter()
                .map(str::to_string),
        )
        .unwrap();
        assert_eq!(config.profile, BenchmarkProfile::Large);
        assert_eq!(config.iterations, Some(3));
        assert_eq!(config.reviewed_pct, 50);
    }

    #[test]
    fn parse_args_rejects_unknown_flags() {
        assert!(parse_args(["--bogus".to_string()].into_iter()).is_err());
        assert!(parse_args(["--reviewed-pct".to_string(), "101".to_string()].into_iter()).is_err());
    }

    #[test]
    fn smoke_run_reports_matching_strategies() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let config = BenchmarkConfig {
            profile: BenchmarkProfile::Smoke,
            iterations: Some(1),
            reviewed_pct: 30,
            history_out: None,
        };
        let summary = runtime.block_on(run(&config)).unwrap();
        assert_eq!(summary.timings.len(), 4);
        assert!(summary.timings.iter().all(|timing| timing.rows > 0));
    }
}
