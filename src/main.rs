// ██████╗  ██████╗  ██████╗██╗  ██╗███████╗████████╗
// ██╔══██╗██╔═══██╗██╔════╝██║ ██╔╝██╔════╝╚══██╔══╝
// ██║  ██║██║   ██║██║     █████╔╝ █████╗     ██║
// ██║  ██║██║   ██║██║     ██╔═██╗ ██╔══╝     ██║
// ██████╔╝╚██████╔╝╚██████╗██║  ██╗███████╗   ██║
// ╚═════╝  ╚═════╝  ╚═════╝╚═╝  ╚═╝╚══════╝   ╚═╝
//
// ███████╗███████╗███╗   ██╗████████╗██╗███╗   ██╗███████╗██╗
// ██╔════╝██╔════╝████╗  ██║╚══██╔══╝██║████╗  ██║██╔════╝██║
// ███████╗█████╗  ██╔██╗ ██║   ██║   ██║██╔██╗ ██║█████╗  ██║
// ╚════██║██╔══╝  ██║╚██╗██║   ██║   ██║██║╚██╗██║██╔══╝  ██║
// ███████║███████╗██║ ╚████║   ██║   ██║██║ ╚████║███████╗███████╗
// ╚══════╝╚══════╝╚═╝  ╚═══╝   ╚═╝   ╚═╝╚═╝  ╚═══╝╚══════╝╚══════╝
//
// E N G I N E
//
// The most overkill docket monitoring engine ever conceived.
// Rust + Tokio + Crossbeam + Bloom Filters + SIMD + budget iron dome.
// All to find out a judge ruled on your motion before opposing counsel does.

mod accounts;
mod channels;
mod classifier;
mod config;
mod cost;
mod dedup;
mod detector;
mod dispatcher;
mod error;
mod gateway;
mod metrics;
mod models;
mod monitor;
mod scheduler;
mod store;

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::accounts::{AccountPool, SelectionStrategy};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::cost::{BudgetService, HourlyLedger};
use crate::dedup::ChangeDedup;
use crate::dispatcher::{Dispatcher, RuleRegistry};
use crate::gateway::HttpRecordsGateway;
use crate::metrics::MetricsCollector;
use crate::models::{
    Account, ChangeDetection, MonitoringRule, NotificationChannel, PollFrequency,
};
use crate::monitor::{AddCaseRequest, CaseMonitor, CaseRegistry};
use crate::scheduler::{CheckContext, Scheduler};
use crate::store::MemoryStore;

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════════════╗
    ║                                                                  ║
    ║   ██████╗  ██████╗  ██████╗██╗  ██╗███████╗████████╗             ║
    ║   ██╔══██╗██╔═══██╗██╔════╝██║ ██╔╝██╔════╝╚══██╔══╝             ║
    ║   ██║  ██║██║   ██║██║     █████╔╝ █████╗     ██║                ║
    ║   ██║  ██║██║   ██║██║     ██╔═██╗ ██╔══╝     ██║                ║
    ║   ██████╔╝╚██████╔╝╚██████╗██║  ██╗███████╗   ██║                ║
    ║   ╚═════╝  ╚═════╝  ╚═════╝╚═╝  ╚═╝╚══════╝   ╚═╝                ║
    ║                                                                  ║
    ║   ███████╗███████╗███╗   ██╗████████╗██╗███╗   ██╗███████╗██╗    ║
    ║   ██╔════╝██╔════╝████╗  ██║╚══██╔══╝██║████╗  ██║██╔════╝██║    ║
    ║   ███████╗█████╗  ██╔██╗ ██║   ██║   ██║██╔██╗ ██║█████╗  ██║    ║
    ║   ╚════██║██╔══╝  ██║╚██╗██║   ██║   ██║██║╚██╗██║██╔══╝  ██║    ║
    ║   ███████║███████╗██║ ╚████║   ██║   ██║██║ ╚████║███████╗███████╗
    ║   ╚══════╝╚══════╝╚═╝  ╚═══╝   ╚═╝   ╚═╝╚═╝  ╚═══╝╚══════╝╚══════╝
    ║                                                                  ║
    ║        ⚖️  COURT DOCKET SURVEILLANCE ENGINE ⚖️                    ║
    ║                                                                  ║
    ║   Scheduler:  Priority Min-Heap + Bounded Worker Pool            ║
    ║   Detection:  SHA-256 Snapshots + Aho-Corasick Classification    ║
    ║   Budget:     Pre-Check Admission Control + Quarterly Exemption  ║
    ║   Dedup:      Bloom Filter + LRU Cache Hybrid                    ║
    ║   Alerts:     7 Channels, Batched, Rate-Limited, Retried         ║
    ║                                                                  ║
    ║   "When a judge rules, we know before opposing counsel."         ║
    ║                                                                  ║
    ╚══════════════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

/// Parse the credential pool from DOCKET_SENTINEL_ACCOUNTS:
/// "label:daily_cents:monthly_cents:rate_per_hour" entries, comma-separated.
/// A missing or mangled entry falls back to one default credential, because
/// an engine with zero credentials is a very quiet engine.
fn accounts_from_env() -> Vec<Account> {
    let raw = std::env::var("DOCKET_SENTINEL_ACCOUNTS")
        .unwrap_or_else(|_| "primary:10000:100000:60".to_string());
    let mut accounts = Vec::new();
    for spec in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 4 {
            warn!(spec, "Malformed account spec — expected label:daily:monthly:rate");
            continue;
        }
        let mut account = Account::new(parts[0]);
        account.daily_limit_cents = parts[1].parse().unwrap_or(10_000);
        account.monthly_limit_cents = parts[2].parse().unwrap_or(100_000);
        account.rate_limit_per_hour = parts[3].parse().unwrap_or(60);
        accounts.push(account);
    }
    if accounts.is_empty() {
        warn!("No valid accounts configured — adding one default credential");
        accounts.push(Account::new("primary"));
    }
    accounts
}

/// Parse boot-time case registrations from DOCKET_SENTINEL_CASES:
/// "case_number@source:frequency:priority" entries, comma-separated.
/// The '@' split happens first so case numbers may contain colons
/// ("2:24-cv-01337@pacer:15m:2" is one entry).
fn case_specs_from_env() -> Vec<AddCaseRequest> {
    let raw = std::env::var("DOCKET_SENTINEL_CASES").unwrap_or_default();
    let mut requests = Vec::new();
    for spec in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((case_number, rest)) = spec.split_once('@') else {
            warn!(spec, "Malformed case spec — expected case@source:frequency:priority");
            continue;
        };
        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() != 3 {
            warn!(spec, "Malformed case spec — expected case@source:frequency:priority");
            continue;
        }
        let Some(frequency) = PollFrequency::parse(parts[1]) else {
            warn!(spec, frequency = parts[1], "Unknown poll frequency");
            continue;
        };
        let priority: u8 = parts[2].parse().unwrap_or(3);
        requests.push(AddCaseRequest::new(case_number, parts[0], frequency, priority));
    }
    requests
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    print_banner();

    info!("⚖️  DOCKET SENTINEL ENGINE initializing...");

    let config = Arc::new(Config::from_env());
    info!(
        portal = %config.portal_base_url,
        max_concurrent_checks = config.max_concurrent_checks,
        hourly_cap_cents = config.cost_limit_per_hour_cents,
        "✅ Configuration loaded"
    );

    // Shared state, leaf-first.
    let metrics = Arc::new(MetricsCollector::new());
    let registry = CaseRegistry::new();
    let rules = RuleRegistry::new();
    let store = Arc::new(MemoryStore::new());

    let pool = AccountPool::new(
        SelectionStrategy::parse(&config.account_strategy),
        config.max_concurrent_sessions,
    );
    for account in accounts_from_env() {
        pool.add_account(account);
    }
    let budget = Arc::new(BudgetService::new(&config, pool.clone()));
    let hourly = Arc::new(HourlyLedger::new(config.cost_limit_per_hour_cents));
    info!("✅ Admission control armed — no check runs unbudgeted");

    let classifier = Arc::new(Classifier::from_config(&config)?);
    info!("✅ Keyword automatons compiled");

    let dedup = Arc::new(ChangeDedup::new(
        config.bloom_expected_items,
        config.bloom_false_positive_rate,
        config.lru_cache_size,
        config.bloom_rotation_interval.as_secs(),
    ));
    info!("✅ Alert dedup engine online");

    let gateway = Arc::new(HttpRecordsGateway::new(&config)?);
    info!("✅ Records gateway ready");

    // The conveyor belt between check workers and the dispatcher.
    let (change_tx, change_rx) = crossbeam_channel::bounded::<ChangeDetection>(10_000);
    info!("✅ Lock-free change channel created (capacity: 10,000)");

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ═══════════════════════════════════════════
    // SPAWN THE SCHEDULER
    // ═══════════════════════════════════════════
    let ctx = CheckContext {
        gateway: gateway.clone(),
        pool: pool.clone(),
        budget: budget.clone(),
        hourly: hourly.clone(),
        classifier,
        dedup,
        registry: registry.clone(),
        change_tx,
        metrics: metrics.clone(),
        check_timeout: config.check_timeout,
    };
    let (scheduler, scheduler_handle) = Scheduler::new(&config, ctx);
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move {
        info!("🗓️  Scheduler: ONLINE");
        scheduler.run(scheduler_shutdown).await;
        info!("🗓️  Scheduler: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // SPAWN THE DISPATCHER
    // ═══════════════════════════════════════════
    let channel_registry = channels::build_registry(&config);
    let dispatcher = Dispatcher::new(
        &config,
        change_rx,
        registry.clone(),
        rules.clone(),
        store.clone(),
        channel_registry,
        metrics.clone(),
    )?;
    let dispatcher_shutdown = shutdown_rx.clone();
    let dispatcher_task = tokio::spawn(async move {
        info!("📣 Dispatcher: ONLINE");
        if let Err(e) = dispatcher.run(dispatcher_shutdown).await {
            error!(error = %e, "📣 Dispatcher error");
        }
        info!("📣 Dispatcher: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // THE ORCHESTRATOR + MAINTENANCE LOOP
    // ═══════════════════════════════════════════
    let monitor = Arc::new(CaseMonitor::new(
        &config,
        registry,
        rules,
        gateway,
        store,
        pool,
        budget,
        hourly,
        scheduler_handle,
        metrics.clone(),
    ));
    let maintenance_shutdown = shutdown_rx.clone();
    let maintenance_task = tokio::spawn({
        let monitor = monitor.clone();
        async move {
            info!("🧹 Maintenance loop: ONLINE");
            monitor.run_maintenance(maintenance_shutdown).await;
            info!("🧹 Maintenance loop: OFFLINE");
        }
    });

    // ═══════════════════════════════════════════
    // SPAWN METRICS HTTP SERVER
    // ═══════════════════════════════════════════
    let metrics_for_server = metrics.clone();
    let metrics_port = config.metrics_port;
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_task = tokio::spawn(async move {
        metrics::run_metrics_server(metrics_for_server, metrics_port, &mut metrics_shutdown).await;
    });

    // ═══════════════════════════════════════════
    // SEED BOOT-TIME CASES
    // ═══════════════════════════════════════════
    let boot_cases = case_specs_from_env();
    if !boot_cases.is_empty() {
        // Every boot-seeded case gets the default in-app rule so alerts
        // have somewhere to go before anyone configures real routing.
        let mut default_rule =
            MonitoringRule::new("default-in-app", vec![NotificationChannel::InApp]);
        default_rule.recipients = vec!["dashboard".to_string()];
        let default_rule_id = default_rule.rule_id;
        monitor.upsert_rule(default_rule).await;

        for mut request in boot_cases {
            request.rule_ids = vec![default_rule_id];
            let label = format!("{}@{}", request.case_number, request.source_id);
            match monitor.add_case(request).await {
                Ok(case) => info!(
                    monitor_id = %case.monitor_id,
                    case = %label,
                    "✅ Boot case registered"
                ),
                Err(e) => warn!(case = %label, error = %e, "Boot case registration failed"),
            }
        }
    }

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 ALL SYSTEMS ONLINE - DOCKET SENTINEL ACTIVE");
    info!("  🗓️  Scheduler tick: {:?}", config.scheduler_tick);
    info!("  💰 Hourly cost cap: {}¢", config.cost_limit_per_hour_cents);
    info!("  📊 Metrics at http://0.0.0.0:{}/metrics", config.metrics_port);
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            warn!("🛑 Shutdown signal received!");
            let _ = shutdown_tx.send(true);
        }
        Err(err) => {
            error!(error = %err, "❌ Signal listener error");
            let _ = shutdown_tx.send(true);
        }
    }

    info!("⏳ Waiting for tasks to complete (timeout: 10s)...");
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        let _ = tokio::join!(
            scheduler_task,
            dispatcher_task,
            maintenance_task,
            metrics_task,
        );
    })
    .await;

    info!("⚖️  DOCKET SENTINEL ENGINE: OFFLINE");
    Ok(())
}
