use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use sirepo_backend::*;
use sirepo_flyer_backend::*;

/// Runs five aperture settings of the SRW fixture through the multi-copy flyer.
///
/// `--serial` runs the copies one after the other, `--offline` uses the in-process server.
fn run() -> SirepoResult<()> {
    let config = if Path::new("sirepo.toml").exists() {
        SirepoConfig::from_file("sirepo.toml")?
    } else {
        SirepoConfig::default()
    }
    .with_env_overrides()?;
    let offline = std::env::args().any(|arg| arg == "--offline");
    let serial = std::env::args().any(|arg| arg == "--serial");

    let client = if offline {
        SirepoClient::new(Arc::new(SimServer::srw_basic()), &config.secret)
    } else {
        SirepoClient::from_config(&config)?
    };
    client.authenticate("srw", SimServer::SRW_SIM_ID)?;

    let deltas: Vec<ParamDelta> = (1..=5)
        .map(|i| {
            let mut aperture = indexmap::IndexMap::new();
            aperture.insert("horizontalSize".to_string(), json!(i as f64 * 0.1));
            aperture.insert("verticalSize".to_string(), json!((6 - i) as f64 * 0.1));
            let mut delta = ParamDelta::new();
            delta.insert("Aperture".to_string(), aperture);
            delta
        })
        .collect();
    let options = SirepoFlyerOptions {
        watch_name: "W9".to_string(),
        run_parallel: !serial,
        root_dir: config.root_dir.clone(),
        ..Default::default()
    };
    let mut flyer = SirepoFlyer::new(Arc::new(client), deltas, options);

    let mut timer = TickTimer::new();
    flyer.kickoff()?;
    flyer.complete()?;
    for event in flyer.collect()? {
        println!(
            "mean {} hash {} status {}",
            event.data["sirepo_flyer_mean"],
            event.data["sirepo_flyer_hash_value"],
            event.data["sirepo_flyer_status"]
        );
    }
    println!("{} asset documents", flyer.collect_asset_docs().len());
    timer.tick_log(if serial { "serial flyer" } else { "parallel flyer" });
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
