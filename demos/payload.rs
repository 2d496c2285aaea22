use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tether::script::{ChannelConfig, DeliveryChannel, EngineConfig, ScriptEngine, TracingObserver};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let terminate_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate_flag.clone())?;

    let engine = ScriptEngine::new(EngineConfig::default()).with_observer(TracingObserver);
    let mut channel = DeliveryChannel::start(ChannelConfig::default(), engine)?;
    tracing::info!(path = %channel.path().display(), "listening");

    while !terminate_flag.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    channel.shutdown();
    Ok(())
}
