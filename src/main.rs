// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge daemon

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qolsys2mqtt::config::Config;
use qolsys2mqtt::counters::Counters;
use qolsys2mqtt::event::observer_channel;
use qolsys2mqtt::mqtt::transport::MqttTransportSettings;
use qolsys2mqtt::mqtt::{ControlPlane, MqttSurface, MqttTransport, SessionToken};
use qolsys2mqtt::state::PanelState;
use qolsys2mqtt::supervisor::{Supervisor, EXIT_CONFIG, EXIT_INTERNAL};
use qolsys2mqtt::transport::{PanelLink, PanelLinkConfig};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { EXIT_CONFIG } else { 0 };
        }
    };

    init_tracing(&config.log_level);

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        eprintln!("invalid configuration: {e}");
        return EXIT_CONFIG;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return EXIT_INTERNAL;
        }
    };
    runtime.block_on(bridge(config))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn bridge(config: Config) -> i32 {
    let cfg = Arc::new(config);
    let counters = Arc::new(Counters::default());
    let session = Arc::new(SessionToken::new());

    // Panel side.
    let (link, inbound_rx) = PanelLink::new(
        PanelLinkConfig {
            host: cfg.panel_host.clone(),
            port: cfg.panel_port,
            token: cfg.panel_token.clone(),
            verify_tls: cfg.panel_verify_tls,
        },
        counters.clone(),
    );
    let link = Arc::new(link);
    let link_handle = link.handle();

    // Broker side.
    let (transport, publish_tx) = MqttTransport::new(MqttTransportSettings {
        client_id: cfg.panel_unique_id.clone(),
        host: cfg.mqtt_host.clone(),
        port: cfg.mqtt_port,
        username: cfg.mqtt_username.clone(),
        password: cfg.mqtt_password.clone(),
        qos: cfg.qos(),
        availability_topic: cfg.instance_availability_topic(),
        online_payload: "online".to_string(),
        offline_payload: "offline".to_string(),
    });
    let transport = Arc::new(transport);

    let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
    transport.notify_reconnect(reconnect_tx);
    let (ha_status_tx, ha_status_rx) = mpsc::unbounded_channel();
    transport.subscribe_route(cfg.ha_status_topic(), ha_status_tx);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    transport.subscribe_route(cfg.control_topic_filter(), command_tx);

    // Domain model and its observers.
    let mut state = PanelState::new();
    let (surface_obs_tx, surface_obs_rx) = observer_channel();
    state.register_observer(surface_obs_tx);
    let (control_obs_tx, control_obs_rx) = observer_channel();
    state.register_observer(control_obs_tx);

    let surface = MqttSurface::new(cfg.clone(), session.clone(), publish_tx);
    let control = ControlPlane::new(cfg.clone(), session.clone(), link_handle, counters.clone());

    let mut supervisor = Supervisor::new();
    let cancel = supervisor.cancel_token();

    {
        let link = link.clone();
        supervisor.spawn_restartable("panel-link", move |cancel| {
            let link = link.clone();
            Box::pin(async move { link.run(cancel).await })
        });
    }
    {
        let transport = transport.clone();
        supervisor.spawn_restartable("mqtt-transport", move |cancel| {
            let transport = transport.clone();
            Box::pin(async move { transport.run(cancel).await })
        });
    }
    supervisor.spawn_once("state", state.run(inbound_rx, counters.clone(), cancel.clone()));
    supervisor.spawn_once(
        "mqtt-surface",
        surface.run(surface_obs_rx, reconnect_rx, ha_status_rx, cancel.clone()),
    );
    supervisor.spawn_once("control-plane", control.run(command_rx, control_obs_rx, cancel.clone()));

    info!(
        "qolsys2mqtt started: panel {}:{}, broker {}:{}, discovery prefix '{}'",
        cfg.panel_host, cfg.panel_port, cfg.mqtt_host, cfg.mqtt_port, cfg.ha_discovery_prefix
    );

    let code = supervisor.run().await;
    info!("shutdown complete");
    code
}
