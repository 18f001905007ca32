//! A stand-alone sample host for the GATT peripheral server.
//!
//! Serves three sample services:
//!
//! * Device Information (0x180A) with the Manufacturer Name String
//!   characteristic (0x2A29),
//! * Battery (0x180F) with a notifying Level characteristic (0x2A19) that
//!   drains by one percent per tick,
//! * a custom Text service whose string characteristic can be read,
//!   written and subscribed to.
//!
//! Respects `BLUEZ_ADAPTER` (adapter hint) and `BLUEZ_LIST_ADAPTERS`
//! (log the adapter snapshot at startup).

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use bzperi::dsl::ServerBuilder;
use bzperi::{register_configurator, Server, ServerConfig};

/// The application-side data store shared with the server thread.
static DATA: Lazy<Mutex<HashMap<String, Vec<u8>>>> = Lazy::new(|| {
    let mut data = HashMap::new();
    data.insert("battery/level".to_string(), vec![78u8]);
    data.insert("text/string".to_string(), b"Hello, world!".to_vec());
    Mutex::new(data)
});

fn sample_services(server: &mut ServerBuilder<'_>) -> bzperi::Result<()> {
    server.service("device", "180A", |service| {
        service.characteristic("mfgr_name", "2A29", &["read"], |chr| {
            chr.on_read(|_req| Ok(b"Acme Inc.".to_vec()));
            Ok(())
        })
    })?;

    server.service("battery", "180F", |service| {
        service.characteristic("level", "2A19", &["read", "notify"], |level| {
            level.on_read(|req| Ok(vec![req.data.get_u8("battery/level").unwrap_or(0)]));
            level.on_updated(|ctx| ctx.data.get("battery/level"));
            Ok(())
        })
    })?;

    server.service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |service| {
        service.characteristic(
            "string",
            "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
            &["read", "write", "notify"],
            |chr| {
                chr.on_read(|req| Ok(req.data.get("text/string").unwrap_or_default()));
                chr.on_write(|req| {
                    req.data.set("text/string", req.value);
                    Ok(())
                });
                chr.on_updated(|ctx| ctx.data.get("text/string"));
                Ok(())
            },
        )
    })
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("bzperi", log::LevelFilter::Debug)
        .init();

    register_configurator(sample_services);

    let getter: bzperi::DataGetter = Arc::new(|name| DATA.lock().get(name).cloned());
    let setter: bzperi::DataSetter = Arc::new(|name, value| {
        DATA.lock().insert(name.to_string(), value.to_vec());
        true
    });

    let mut config = ServerConfig::new("bzperi", "BzPeri", "BzPeri", getter, setter);
    config.preferred_adapter = std::env::var("BLUEZ_ADAPTER").ok();

    let server = match Server::start(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: failed to start GATT server: {e}");
            std::process::exit(1);
        }
    };

    if std::env::var_os("BLUEZ_LIST_ADAPTERS").is_some() {
        if let Some(info) = server.adapter_info() {
            log::info!(
                "adapter: {} address={} alias={} powered={}",
                info.path,
                info.address,
                info.alias,
                info.powered
            );
        }
    }

    // Drain the battery by one percent every few seconds and notify
    // subscribers.
    let server = Arc::new(server);
    let battery_server = server.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(5));
        {
            let mut data = DATA.lock();
            let level = data.entry("battery/level".to_string()).or_insert(vec![100]);
            let current = level.first().copied().unwrap_or(100);
            *level = vec![if current == 0 { 100 } else { current - 1 }];
        }
        battery_server.notify_updated_characteristic("/com/bzperi/battery/level");
    });

    println!("GATT server running; press Enter to stop.");
    let _ = std::io::stdin().lock().read_line(&mut String::new());

    if !server.shutdown_and_wait() {
        eprintln!("server stopped unhealthy: {}", server.health().as_str());
        std::process::exit(1);
    }
}
