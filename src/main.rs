//! Binary entry point: load configuration, connect to the three device
//! controllers, start the background polling/collimation loops, and serve
//! a single operator connection until told to shut down.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use dupont_tcc::actor::{Actor, ConnectionSink};
use dupont_tcc::collimation::{CollimationCoefficients, CollimationLoop, CollimationModel};
use dupont_tcc::config::{ActorArgs, ActorConfig};
use dupont_tcc::core::keywords::KeywordDict;
use dupont_tcc::core::transport::TcpLineTransport;
use dupont_tcc::devices::m2::M2Device;
use dupont_tcc::devices::scale::ScaleDevice;
use dupont_tcc::devices::tcs::TcsDevice;

/// Collimation re-commanding cadence (spec.md 4.6 step 8). No concrete value
/// appears in the retrieved reference material; 30s matches the scale
/// device's own idle/active poll cadence order of magnitude.
const COLLIMATE_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum tilt/translation delta (arcsec-equivalent units) that triggers a
/// collimation move, same placeholder status as `CollimationCoefficients`.
const MIN_TILT: f64 = 1.0;
const MIN_TRANS: f64 = 1.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ActorArgs::parse();
    let config = ActorConfig::from_args(args)?;

    let _logging_guard = dupont_tcc::logging::init(&config.log_dir, &config.log_level)?;
    info!("starting dupont-tcc actor, listen_port={}", config.listen_port);

    let sink = ConnectionSink::new();
    let keywords = Arc::new(KeywordDict::new(Box::new(SinkAdapter(sink.clone()))));

    let tcs_transport = Arc::new(TcpLineTransport::new(config.tcs.host.clone(), config.tcs.port));
    let scale_transport = Arc::new(TcpLineTransport::new(config.scale.host.clone(), config.scale.port));
    let m2_transport = Arc::new(TcpLineTransport::new(config.m2.host.clone(), config.m2.port));

    let tcs = TcsDevice::new(tcs_transport);
    let scale = ScaleDevice::new(scale_transport, keywords.clone());
    let m2 = M2Device::new(m2_transport);

    for (name, result) in [
        ("tcs", tcs.connect().await),
        ("scale", scale.connect().await),
        ("m2", m2.connect().await),
    ] {
        if let Err(e) = result {
            warn!("{name}: initial connect failed: {e} (use 'device connect {name}' once the controller is reachable)");
        }
    }

    let model = CollimationModel::new(CollimationCoefficients::default(), MIN_TILT, MIN_TRANS);
    let collimation = CollimationLoop::new(model, tcs.clone(), m2.clone(), keywords.clone(), COLLIMATE_INTERVAL);

    scale.start_polling();
    collimation.start_watchdog();

    let actor = Actor::new(scale.clone(), tcs.clone(), m2.clone(), keywords.clone(), collimation, sink);

    actor.start_time_keyword_loop();

    let listen_port = config.listen_port;
    let listener_actor = actor.clone();
    let listener = tokio::spawn(async move {
        if let Err(e) = listener_actor.run_listener(listen_port).await {
            error!("operator listener exited: {e}");
        }
    });

    dupont_tcc::wait_for_shutdown().await;
    info!("shutdown signal received, disconnecting devices");

    listener.abort();
    for (name, result) in [
        ("tcs", tcs.disconnect().await),
        ("scale", scale.disconnect().await),
        ("m2", m2.disconnect().await),
    ] {
        if let Err(e) = result {
            warn!("{name}: disconnect error: {e}");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// `KeywordDict` stores its sink as `Box<dyn UserSink>`; `ConnectionSink` is
/// constructed behind an `Arc` (it's also handed to `Actor` and cloned per
/// connection), so this thin wrapper bridges the two ownership shapes.
struct SinkAdapter(Arc<ConnectionSink>);

impl dupont_tcc::core::keywords::UserSink for SinkAdapter {
    fn write_to_users(&self, severity: dupont_tcc::core::keywords::Severity, line: &str) {
        self.0.write_to_users(severity, line);
    }
}
