pub mod config;
pub mod db;
pub mod dispatch;
pub mod envelope;
pub mod forward;
pub mod idempotency;
pub mod models;
pub mod pairing;
pub mod providers;
pub mod relay_log;
pub mod route_key;
pub mod routes;
pub mod wa_queue;

use config::Config;
use db::Db;
use dispatch::Dispatcher;
use forward::InboundForwarder;
use idempotency::InflightMap;
use providers::discord::{DiscordClient, DiscordPoller};
use providers::telegram::{TelegramClient, TelegramPoller};
use providers::whatsapp::{DisabledWhatsAppRuntime, WhatsAppRuntime};
use relay_log::RelayLog;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wa_queue::WaQueueWorker;

/// Default expiry for seeded pairing codes that don't carry their own.
const CODE_SEED_DEFAULT_TTL_MS: i64 = 30 * 24 * 3600 * 1000;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let config = Config::from_env().expect("invalid configuration");
    rocket_with_config(config)
}

pub fn rocket_with_config(config: Config) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, Arc::new(DisabledWhatsAppRuntime))
}

/// Wire a real (or fake) WhatsApp session library.
pub fn rocket_with_runtime(
    config: Config,
    whatsapp: Arc<dyn WhatsAppRuntime>,
) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, whatsapp)
}

fn build_rocket(
    config: Config,
    whatsapp: Arc<dyn WhatsAppRuntime>,
) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let database = Db::new(&config.database_path);
    let log = Arc::new(RelayLog::open(&config.log_path));

    seed_from_config(&database, &config);

    let dispatcher = Dispatcher {
        telegram: config
            .telegram
            .bot_token
            .as_deref()
            .map(|token| TelegramClient::new(&config.telegram.api_base, token)),
        discord: config
            .discord
            .bot_token
            .as_deref()
            .map(|token| DiscordClient::new(&config.discord.api_base, token)),
        whatsapp: whatsapp.clone(),
    };

    let running = Arc::new(AtomicBool::new(true));

    // Raise body limits: raw provider payloads can exceed Rocket's defaults,
    // and the outbound handler reads its body as a string (fingerprinting
    // wants the exact bytes), which is governed by `limits.string`.
    let figment = rocket::Config::figment()
        .merge(("limits.json", 10 * 1024 * 1024))
        .merge(("limits.string", 10 * 1024 * 1024));
    let db_path = config.database_path.clone();

    rocket::custom(figment)
        .manage(database)
        .manage(log.clone())
        .manage(InflightMap::new())
        .manage(dispatcher)
        .manage(config)
        .register(
            "/",
            rocket::catchers![
                routes::bad_request,
                routes::unauthorized,
                routes::not_found,
                routes::internal_error,
                routes::unprocessable,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::bootstrap_tenant,
                routes::get_inbound_target,
                routes::set_inbound_target,
                routes::list_pairings,
                routes::issue_pairing_token,
                routes::claim_pairing,
                routes::unbind_pairing,
                routes::outbound_send,
                routes::outbound_typing,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff("Inbound Loops", {
            let running = running.clone();
            let log = log.clone();
            move |rocket| {
                Box::pin(async move {
                    let config = rocket
                        .state::<Config>()
                        .expect("config is managed before liftoff");
                    spawn_inbound_loops(config, &db_path, whatsapp, log, running);
                })
            }
        }))
        .attach(rocket::fairing::AdHoc::on_shutdown("Stop Inbound Loops", {
            let running = running.clone();
            move |_rocket| {
                Box::pin(async move {
                    running.store(false, Ordering::Relaxed);
                    println!("🛑 Inbound loops asked to stop");
                })
            }
        }))
}

/// Upsert env-seeded tenants and pairing codes. Seeds already passed
/// uniqueness validation in `Config::from_env`.
fn seed_from_config(database: &Db, config: &Config) {
    for seed in &config.tenant_seeds {
        let name = seed.name.clone().unwrap_or_else(|| seed.id.clone());
        database
            .upsert_tenant(
                &seed.id,
                &name,
                &db::hash_secret(&seed.api_key),
                seed.inbound_url.as_deref(),
                seed.inbound_timeout_ms,
            )
            .expect("Failed to seed tenant");
    }
    for seed in &config.code_seeds {
        let expires = seed
            .expires_at_ms
            .unwrap_or_else(|| db::now_ms() + CODE_SEED_DEFAULT_TTL_MS);
        database
            .seed_pairing_code(
                &seed.code,
                &seed.channel,
                &seed.route_key,
                &seed.scope,
                expires,
            )
            .expect("Failed to seed pairing code");
    }
}

/// One task per enabled inbound loop, each with its own SQLite connection.
fn spawn_inbound_loops(
    config: &Config,
    db_path: &str,
    whatsapp: Arc<dyn WhatsAppRuntime>,
    log: Arc<RelayLog>,
    running: Arc<AtomicBool>,
) {
    if config.telegram.poll_enabled {
        if let Some(token) = config.telegram.bot_token.as_deref() {
            let poller = TelegramPoller {
                db: Db::new(db_path),
                client: TelegramClient::new(&config.telegram.api_base, token),
                forwarder: InboundForwarder::new(),
                log: log.clone(),
                account_id: config.telegram.account_id.clone(),
                media_max_bytes: config.media_max_bytes,
                messages: config.messages.clone(),
            };
            let running = running.clone();
            tokio::spawn(async move { poller.run_loop(running).await });
            println!("📨 Telegram poller started");
        } else {
            eprintln!("⚠️ TELEGRAM_ENABLED is set but TELEGRAM_BOT_TOKEN is missing");
        }
    }

    if config.discord.poll_enabled {
        if let Some(token) = config.discord.bot_token.as_deref() {
            let poller = DiscordPoller {
                db: Db::new(db_path),
                client: DiscordClient::new(&config.discord.api_base, token),
                forwarder: InboundForwarder::new(),
                log: log.clone(),
                account_id: config.discord.account_id.clone(),
                media_max_bytes: config.media_max_bytes,
                messages: config.messages.clone(),
                poll_interval_ms: config.discord.poll_interval_ms,
            };
            let running = running.clone();
            tokio::spawn(async move { poller.run_loop(running).await });
            println!("📨 Discord poller started");
        } else {
            eprintln!("⚠️ DISCORD_ENABLED is set but DISCORD_BOT_TOKEN is missing");
        }
    }

    if config.whatsapp.enabled {
        let listener_db = Arc::new(Db::new(db_path));
        let listener_log = log.clone();
        whatsapp.set_active_listener(Arc::new(move |message| {
            providers::whatsapp::enqueue_inbound(&listener_db, &listener_log, &message);
        }));
        {
            let runtime = whatsapp.clone();
            let log = log.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime.monitor_inbox().await {
                    log.relay_error("whatsapp inbox monitor", &e);
                }
            });
        }
        let worker = WaQueueWorker {
            db: Db::new(db_path),
            forwarder: InboundForwarder::new(),
            runtime: whatsapp,
            log: log.clone(),
            media_max_bytes: config.media_max_bytes,
            messages: config.messages.clone(),
            batch_size: config.whatsapp.queue_batch_size,
            retry_initial_ms: config.whatsapp.retry_initial_ms,
            retry_max_ms: config.whatsapp.retry_max_ms,
        };
        let running = running.clone();
        tokio::spawn(async move { worker.run_loop(running).await });
        println!("📨 WhatsApp listener and queue worker started");
    }
}
