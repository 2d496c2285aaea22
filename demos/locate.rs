use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tether::{
    driver::procfs::ProcfsDriver,
    os::linux::{LocatorConfig, ProcessLocator, ProcfsSource},
    utils::{
        Representation, hexdump,
        injector::{InjectionMode, Injector, InjectorConfig},
    },
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let name = std::env::args().nth(1).unwrap_or_else(|| String::from("game"));

    let terminate_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate_flag.clone())?;

    // Setup the injector.
    let locator = ProcessLocator::new(ProcfsSource::new(), LocatorConfig::new(name));
    let injector = Injector::new(locator, ProcfsDriver::attach, InjectorConfig::default())?
        .with_status_callback(|state, message| tracing::info!(%state, message));

    // Poll until the target shows up.
    while !injector.attach() {
        if terminate_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        std::thread::sleep(Duration::from_secs(1));
    }

    let Some(target) = injector.target()
    else {
        return Ok(());
    };

    println!("Target: {target:#?}");

    if injector.mode() != InjectionMode::Full {
        println!("Guest VM not located: {:?}", injector.last_failure());
        return Ok(());
    }

    let Some(vm) = injector.vm()
    else {
        return Ok(());
    };

    println!("Guest VM: {vm:#?}");

    let dump = injector.with_memory(|memory| hexdump(memory, vm.address, 64, Representation::U8))?;
    println!("{dump}");

    Ok(())
}
