use std::time::{Duration, Instant};

use tether::script::{EngineConfig, ScriptEngine, TracingObserver};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let Some(path) = std::env::args().nth(1)
    else {
        eprintln!("usage: run-script <file.lua>");
        return Ok(());
    };

    let source = std::fs::read_to_string(&path)?;

    let engine = ScriptEngine::new(EngineConfig::default()).with_observer(TracingObserver);
    engine.init()?;

    if engine.execute(&source, &path).is_err() {
        // Already reported by the observer.
        return Ok(());
    }

    // Drive scheduled tasks until none are left.
    while let Some(due) = engine.next_due() {
        let now = Instant::now();
        if due > now {
            std::thread::sleep((due - now).min(Duration::from_millis(16)));
        }

        engine.tick();
    }

    engine.shutdown();
    Ok(())
}
