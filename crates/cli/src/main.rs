use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tanjun_core::{stop_pair, ObjectKey, ObjectSource, SourceError, StopSignal};
use tanjun_informer::{HandlerFuncs, Health, Informer, InformerConfig};
use tanjun_kubehub::{KubeSource, MemorySource, Tanjunchen, TanjunchenSpec};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tanjunctl", version, about = "Mirror Tanjunchen objects and log their changes")]
struct Cli {
    /// Output format for the synced table
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig (default: $HOME/.kube/config, then in-cluster)
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// API server address; overrides the kubeconfig
    #[arg(long = "master")]
    master: Option<String>,

    #[arg(long = "namespace", short = 'n', default_value = "test")]
    namespace: String,

    /// Resync period in seconds (0 disables); overrides TANJUN_RESYNC_SECS
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,

    /// Run against an in-process source with simulated churn
    #[arg(long = "demo", action = ArgAction::SetTrue)]
    demo: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

fn init_tracing() {
    let env = std::env::var("TANJUN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TANJUN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TANJUN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn kube_client(kubeconfig: Option<PathBuf>, master: Option<&str>) -> Result<Client> {
    let path = kubeconfig.or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".kube").join("config")));
    let mut config = match path.filter(|p| p.exists()) {
        Some(p) => {
            info!(path = %p.display(), "loading kubeconfig");
            let raw = Kubeconfig::read_from(&p).with_context(|| format!("reading kubeconfig {}", p.display()))?;
            kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?
        }
        None => kube::Config::infer().await.context("inferring client config")?,
    };
    if let Some(master) = master {
        config.cluster_url = master.parse().with_context(|| format!("invalid --master {}", master))?;
    }
    Client::try_from(config).context("creating kube client")
}

#[derive(Serialize)]
struct Row {
    namespace: String,
    name: String,
    spec_name: String,
    age: i32,
    location: String,
    occupations: String,
    created: String,
}

impl From<&Tanjunchen> for Row {
    fn from(t: &Tanjunchen) -> Self {
        let created = t.metadata.creation_timestamp.as_ref().map(|ts| ts.0.timestamp()).unwrap_or(0);
        Self {
            namespace: t.namespace().unwrap_or_default(),
            name: t.name_any(),
            spec_name: t.spec.name.clone(),
            age: t.spec.age,
            location: t.spec.location.clone(),
            occupations: t.spec.occupations.clone(),
            created: render_age(created),
        }
    }
}

fn print_rows(rows: &[Row], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<16} {:>4} {:<16} {:<16} {}", "NAME", "SPEC-NAME", "AGE", "LOCATION", "OCCUPATIONS", "CREATED");
            for r in rows {
                println!(
                    "{:<20} {:<16} {:>4} {:<16} {:<16} {}",
                    r.name, r.spec_name, r.age, r.location, r.occupations, r.created
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

fn logging_handler() -> HandlerFuncs<Tanjunchen> {
    HandlerFuncs::new()
        .on_add(|t: &Tanjunchen| {
            info!(key = %format!("{}/{}", t.namespace().unwrap_or_default(), t.name_any()), name = %t.spec.name, age = t.spec.age, "add");
            Ok(())
        })
        .on_update(|old: &Tanjunchen, new: &Tanjunchen| {
            if old.resource_version() == new.resource_version() {
                info!(name = %new.name_any(), "resync");
            } else {
                info!(
                    name = %new.name_any(),
                    from = ?old.resource_version(),
                    to = ?new.resource_version(),
                    age = new.spec.age,
                    location = %new.spec.location,
                    "update"
                );
            }
            Ok(())
        })
        .on_delete(|t: &Tanjunchen| {
            info!(name = %t.name_any(), "delete");
            Ok(())
        })
}

fn seed(namespace: &str, name: &str, age: i32, location: &str, occupations: &str) -> Tanjunchen {
    Tanjunchen::namespaced(
        namespace,
        name,
        TanjunchenSpec { name: name.to_string(), location: location.to_string(), age, occupations: occupations.to_string() },
    )
}

/// Keep the in-process source changing so handlers have something to report.
async fn churn(source: Arc<MemorySource<Tanjunchen>>, namespace: String, stop: StopSignal) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    ticker.tick().await;
    let mut round: i32 = 0;
    loop {
        tokio::select! {
            _ = stop.stopped() => return,
            _ = ticker.tick() => {}
        }
        round += 1;
        source.apply(seed(&namespace, "tanjunchen", 27 + round, "shenzhen", "engineer"));
        if round % 4 == 0 {
            let key = ObjectKey::namespaced(&namespace, "visitor");
            if source.delete(&key).is_none() {
                source.apply(seed(&namespace, "visitor", round, "beijing", "student"));
            }
        }
        if round % 10 == 0 {
            info!("demo: expiring watches");
            source.expire_watches();
        }
    }
}

fn demo_source(namespace: &str) -> Arc<MemorySource<Tanjunchen>> {
    let source = Arc::new(MemorySource::<Tanjunchen>::new());
    for (name, age, location, occupations) in
        [("tanjunchen", 27, "shenzhen", "engineer"), ("chenjun", 31, "hangzhou", "designer")]
    {
        source.apply(seed(namespace, name, age, location, occupations));
    }
    source
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = InformerConfig::from_env();
    config.namespace = Some(cli.namespace.clone());
    if let Some(secs) = cli.resync_secs {
        config.resync_secs = secs;
    }
    config.validate().context("invalid informer config")?;
    let selector = config.selector()?;

    let (stop, stop_signal) = stop_pair();
    let mut demo = None;
    let source: Arc<dyn ObjectSource<Tanjunchen>> = if cli.demo {
        let mem = demo_source(&cli.namespace);
        demo = Some(Arc::clone(&mem));
        mem
    } else {
        let client = kube_client(cli.kubeconfig.clone(), cli.master.as_deref()).await?;
        Arc::new(KubeSource::new(client).with_watch_timeout(config.watch_timeout_secs))
    };

    // One direct list before the informer starts, as a connectivity check.
    match source.list(&selector).await {
        Ok(list) => {
            info!(ns = %cli.namespace, items = list.items.len(), rv = %list.resource_version, "direct list");
            for t in &list.items {
                info!(name = %t.name_any(), spec_name = %t.spec.name, age = t.spec.age, "listed");
            }
        }
        Err(e) => warn!(error = %e, "direct list failed; the informer will keep retrying"),
    }

    let informer = Informer::new(Arc::clone(&source), config)?.with_error_hook(Arc::new(|err: &SourceError| {
        error!(kind = err.kind(), error = %err, "list/watch error");
    }));
    informer.add_handler(logging_handler());

    let mut health = informer.health();
    tokio::spawn(async move {
        while health.changed().await.is_ok() {
            let h = health.borrow_and_update().clone();
            match h {
                Health::Unreachable { .. } | Health::Denied { .. } => warn!(health = ?h, "informer health"),
                _ => info!(health = ?h, "informer health"),
            }
        }
    });

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C; shutting down"),
        }
        stop.stop();
    });

    if let Some(mem) = demo {
        tokio::spawn(churn(mem, cli.namespace.clone(), stop_signal.clone()));
    }

    let run = informer.start(stop_signal.clone())?;
    if informer.wait_for_sync(&stop_signal).await {
        let lister = informer.lister();
        let rows: Vec<Row> = lister.list(Some(&cli.namespace)).iter().map(|t| Row::from(t.as_ref())).collect();
        info!(objects = rows.len(), "cache synced");
        print_rows(&rows, cli.output)?;
    } else {
        warn!("stopped before the cache synced");
    }

    run.join().await?;
    info!("informer stopped");
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
