use clap::Parser;
use mediator_core::CallReturn;
use mediator_daemon::{Application, DaemonConfig, Exit, Supervisor, Tick};
use mediator_worker::{HandlerRegistry, Mediator, TimeoutAction, TracingHook};
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mediatord")]
#[command(about = "Process-based background worker daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mediatord.yaml")]
    config: String,

    /// Supervisor tick interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Worker processes per pool
    #[arg(short, long)]
    workers: Option<usize>,

    /// Reattach to IPC resources left by a previous run
    #[arg(long)]
    recover_workers: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Log every protocol step at debug level
    #[arg(long)]
    trace_protocol: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.daemon.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    loop {
        tracing::info!("Starting mediatord with config: {:?}", config);

        let mut supervisor = Supervisor::new(config.daemon.clone());
        for pool_config in config.resolved_pools() {
            let mut pool = Mediator::new(pool_config.clone(), demo_handlers()?)?;
            if args.trace_protocol {
                pool = pool.with_hook(Box::new(TracingHook::new(pool_config.alias.clone())));
            }
            pool.on_return(|call| match &call.ret {
                Some(Ok(value)) => tracing::info!("Call {} to `{}` returned {}", call.id, call.method, value),
                Some(Err(e)) => tracing::warn!("Call {} to `{}` failed: {}", call.id, call.method, e),
                None => {}
            });
            pool.on_timeout(|call| {
                tracing::warn!("Call {} to `{}` timed out; retrying", call.id, call.method);
                if call.retries < 2 {
                    TimeoutAction::Retry
                } else {
                    TimeoutAction::Ignore
                }
            });
            supervisor.add_pool(pool);
        }

        let mut app = DemoApp::default();
        match supervisor.run(&mut app)? {
            Exit::Shutdown => break,
            Exit::Restart => {
                drop(supervisor);
                config = load_config(&args)?;
                config.daemon.recover_workers = true;
            }
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = if std::path::Path::new(&args.config).exists() {
        DaemonConfig::from_file(&args.config)?
    } else {
        DaemonConfig::default()
    };

    // Override with CLI args
    if let Some(interval_ms) = args.interval_ms {
        config.daemon.loop_interval_ms = interval_ms;
    }
    if let Some(workers) = args.workers {
        for pool in &mut config.pools {
            pool.workers = workers;
        }
    }
    if args.recover_workers {
        config.daemon.recover_workers = true;
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level = level.clone();
    }

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn demo_handlers() -> anyhow::Result<HandlerRegistry> {
    let registry = HandlerRegistry::new()
        .with("square", |args: &[Value]| -> CallReturn {
            let n = args
                .first()
                .and_then(Value::as_i64)
                .ok_or("square expects an integer")?;
            Ok(json!(n * n))
        })?
        .with("sleep", |args: &[Value]| -> CallReturn {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "slept_ms": ms }))
        })?
        .with("fail", |args: &[Value]| -> CallReturn {
            let reason = args.first().and_then(Value::as_str).unwrap_or("requested failure");
            Err(reason.to_string())
        })?;

    tracing::info!("Registered methods: {:?}", registry.methods());
    Ok(registry)
}

/// Keeps every pool busy with a square call per free worker
#[derive(Default)]
struct DemoApp {
    next: i64,
}

impl Application for DemoApp {
    fn execute(&mut self, pools: &mut [Mediator]) -> anyhow::Result<Tick> {
        for pool in pools.iter_mut() {
            if pool.is_idle() && pool.queued_count() == 0 {
                self.next += 1;
                if let Err(e) = pool.invoke("square", vec![json!(self.next)]) {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    tracing::error!("Pool '{}': {}", pool.alias(), e);
                }
            }
        }
        Ok(Tick::Continue)
    }
}
