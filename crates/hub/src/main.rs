mod actions;
mod clock;
mod config;
mod db;
mod duration;
mod health;
mod jobs;
mod light;
mod model;
mod mqtt;
mod notify;
mod scheduler;
mod state;
mod water;
mod weather;
mod web;

#[cfg(test)]
mod testutil;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use db::Db;
use mqtt::{parse_inbound, SUBSCRIPTIONS};
use scheduler::Worker;
use state::SystemState;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let web_port: u16 = env_or("WEB_PORT", 8080);
    let poll = Duration::from_millis(env_or("JOB_POLL_MS", 1000));
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:garden.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed gardens, zones, schedules, clients) ───────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    if Path::new(&config_path).exists() {
        let cfg = config::load(&config_path)?;
        config::apply(&cfg, &db).await?;
    } else {
        warn!(path = %config_path, "config file not found, using stored entities only");
    }

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("garden-hub", broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Scheduling worker ───────────────────────────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    let worker = Worker::new(
        db,
        Arc::new(client.clone()),
        Arc::new(SystemClock),
        Arc::clone(&shared),
    );
    worker.schedule_all().await?;
    tokio::spawn(worker.clone().run(poll));

    // ── Web server ──────────────────────────────────────────────────
    let web_worker = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_worker, web_port).await {
            error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── MQTT event loop ─────────────────────────────────────────────
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => match parse_inbound(&p.topic, &p.payload) {
                Ok(msg) => {
                    let worker = worker.clone();
                    tokio::spawn(async move { worker.handle_inbound(msg).await });
                }
                Err(e) => {
                    warn!(topic = %p.topic, error = %e, "unhandled message");
                    shared
                        .write()
                        .await
                        .record_error(format!("bad message on {}: {e}", p.topic));
                }
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(%broker, port, "mqtt connected");
                // Sessions are clean, so subscriptions are renewed on every connect.
                for topic in SUBSCRIPTIONS {
                    client.subscribe(topic, QoS::AtLeastOnce).await?;
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
