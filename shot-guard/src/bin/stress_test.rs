use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use rand::Rng;
use shot_guard::AdmissionPipeline;
use shot_guard::GuardConfig;
use shot_guard::RequestDescriptor;
use shot_guard::StatusClassifier;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Drive an admission pipeline with a burst of concurrent requests
#[derive(Parser, Debug)]
#[command(name = "stress_test", version)]
struct Args {
    /// TOML configuration; every stage with defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total requests to send
    #[arg(short, long, default_value_t = 50_000)]
    requests: usize,

    /// Distinct client addresses the requests are spread across
    #[arg(long, default_value_t = 100)]
    clients: usize,

    /// Distinct endpoints the requests are spread across
    #[arg(long, default_value_t = 4)]
    endpoints: usize,

    /// Simulated downstream latency in milliseconds
    #[arg(short, long, default_value_t = 50)]
    latency_ms: u64,

    /// Probability that the downstream answers 503
    #[arg(short, long, default_value_t = 0.05)]
    failure_rate: f64,
}

// Simulate real-world work with an occasional server error
async fn mock_downstream(latency: Duration, failure_rate: f64) -> u16 {
    sleep(latency).await;
    if rand::rng().random::<f64>() < failure_rate {
        503
    } else {
        200
    }
}

enum Verdict {
    Served { status: u16, admit: Duration, total: Duration },
    Rejected { reason: &'static str },
}

async fn run_load_test(
    pipeline: AdmissionPipeline,
    classifier: Arc<StatusClassifier>,
    args: &Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut hist_admit = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)?;
    let mut hist_total = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut rejections: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();

    let latency = Duration::from_millis(args.latency_ms);
    let barrier = Arc::new(Barrier::new(args.requests));
    let mut tasks = JoinSet::new();
    let start = Instant::now();

    for i in 0..args.requests {
        let pipeline = pipeline.clone();
        let classifier = Arc::clone(&classifier);
        let bar = Arc::clone(&barrier);
        let failure_rate = args.failure_rate;
        let client = i % args.clients.max(1);
        let request =
            RequestDescriptor::new("GET", format!("/endpoint/{}", i % args.endpoints.max(1)))
                .with_real_ip(format!("10.{}.{}.{}", client / 65_536 % 256, client / 256 % 256, client % 256));

        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            match pipeline.try_admit(&request).await.into_result() {
                Ok(permit) => {
                    let admit = req_start.elapsed();
                    let status = mock_downstream(latency, failure_rate).await;
                    permit.release(classifier.classify(status));
                    Verdict::Served {
                        status,
                        admit,
                        total: req_start.elapsed(),
                    }
                }
                Err(rejection) => Verdict::Rejected {
                    reason: rejection.reason(),
                },
            }
        });
    }

    let mut served = 0;
    while let Some(task) = tasks.join_next().await {
        match task? {
            Verdict::Served {
                status,
                admit,
                total,
            } => {
                served += 1;
                *statuses.entry(status).or_default() += 1;
                hist_admit.record(admit.as_nanos() as u64)?;
                hist_total.record(total.as_micros() as u64)?;
            }
            Verdict::Rejected { reason } => {
                *rejections.entry(reason).or_default() += 1;
            }
        }
    }

    let total_duration = start.elapsed();
    let throughput = args.requests as f64 / total_duration.as_secs_f64();
    let goodput = served as f64 / total_duration.as_secs_f64();

    println!("--- Admission pipeline {:?} ---", pipeline.order());
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Served/Total:    {}/{}", served, args.requests);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Served Rate:     {:.2} req/sec (Goodput)", goodput);

    if served > 0 {
        println!("P50 (Elapsed):   {}µs", hist_total.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", hist_total.value_at_quantile(0.99));
        println!("P50 (Admit):     {}ns", hist_admit.value_at_quantile(0.5));
        println!("P99 (Admit):     {}ns", hist_admit.value_at_quantile(0.99));
        for (status, count) in &statuses {
            println!("  └─ {}:       {}", status, count);
        }
    }

    let total_rejections: usize = rejections.values().sum();
    println!("Rejections:      {}", total_rejections);
    for (reason, count) in &rejections {
        println!("  └─ {:<20} {}", reason, count);
    }
    println!("Still in flight: {}", pipeline.in_flight());
    println!();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shot_guard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => GuardConfig::load(path)?,
        None => GuardConfig::all_stages(),
    };
    tracing::info!(?config, "starting stress test");

    let classifier = Arc::new(
        config
            .circuit_breaker
            .as_ref()
            .map(StatusClassifier::from_config)
            .unwrap_or_default(),
    );
    let pipeline = AdmissionPipeline::from_config(&config)?;
    let sweeper = pipeline.spawn_sweeper(pipeline.sweep_interval())?;

    run_load_test(pipeline, classifier, &args).await?;

    sweeper.abort();
    Ok(())
}
