use std::{ops::ControlFlow, process, sync::Arc, time::Duration};

use serde_json::Value;
use tiercache::{
    cache::{BackgroundTask, CacheConfig, CacheKey, CacheSystem, EventQueue, KeyFactory, KeyOptions},
    config::{self, Command, KeyCommand, KeyFormatArgs},
    error::AppError,
    telemetry,
};
use tracing::{Dispatch, Level, debug, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const EVENT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_DRAIN_BATCH: usize = 256;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    match cli_args.command {
        Some(Command::Key(args)) => run_key(&settings, args.command),
        Some(Command::Run(_)) | None => {
            telemetry::init(&settings.logging)?;
            run_engine(&settings).await
        }
    }
}

async fn run_engine(settings: &config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(settings);
    let system = CacheSystem::<Value>::build(&cache_config)?;

    let drain = spawn_event_drain(system.events().clone());

    info!(
        layers = ?system.manager().get_layers().iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
        "tiercache running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    drain.stop().await;
    system.shutdown().await;
    Ok(())
}

/// Log and discard queued cache events so the queue never saturates.
fn spawn_event_drain(events: Arc<EventQueue>) -> BackgroundTask {
    BackgroundTask::spawn("event-drain", EVENT_DRAIN_INTERVAL, move || {
        let events = events.clone();
        async move {
            for event in events.drain(EVENT_DRAIN_BATCH) {
                debug!(event = %event.to_json(), "Cache event");
            }
            ControlFlow::Continue(())
        }
    })
}

fn run_key(settings: &config::Settings, command: KeyCommand) -> Result<(), AppError> {
    let factory = KeyFactory::new(
        settings.keys.default_namespace.clone(),
        settings.keys.default_version.clone(),
    )?;

    match command {
        KeyCommand::Format(args) => println!("{}", format_key(&factory, args)?),
        KeyCommand::Parse(args) => {
            let key: CacheKey = factory.parse(&args.input)?;
            let json = serde_json::to_string_pretty(&key)
                .map_err(|err| AppError::unexpected(format!("failed to encode key: {err}")))?;
            println!("{json}");
        }
    }
    Ok(())
}

fn format_key(factory: &KeyFactory, args: KeyFormatArgs) -> Result<String, AppError> {
    let name = args.key.clone();
    let key = factory.create(&name, key_options(args))?;
    Ok(factory.format(&key))
}

fn key_options(args: KeyFormatArgs) -> KeyOptions {
    let mut options = KeyOptions::new().tags(args.tags);
    if let Some(namespace) = args.namespace {
        options = options.namespace(namespace);
    }
    if let Some(version) = args.version {
        options = options.version(version);
    }
    if let Some(tenant) = args.tenant {
        options = options.tenant(tenant);
    }
    if let Some(user) = args.user {
        options = options.user(user);
    }
    options
}
