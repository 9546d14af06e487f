use std::env;
use std::sync::Arc;

use serde_json::json;

use sirepo_backend::*;

/// Scans the aperture of a beamline and prints the mean intensity seen by its first watchpoint.
///
/// `--offline` runs against the in-process simulation server; otherwise the server, secret and
/// data directory come from `sirepo.toml` (if present) and the environment.
fn run() -> SirepoResult<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let offline = args.iter().any(|a| a == "--offline");
    let sim_id = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| SimServer::SRW_SIM_ID.to_string());

    let config = if std::path::Path::new("sirepo.toml").exists() {
        SirepoConfig::from_file("sirepo.toml")?
    } else {
        SirepoConfig::default()
    }
    .with_env_overrides()?;

    let client = if offline {
        SirepoClient::new(Arc::new(SimServer::srw_basic()), &config.secret)
    } else {
        SirepoClient::from_config(&config)?
    };
    client.authenticate("srw", &sim_id)?;
    let options = SynthesisOptions::default().with_report(ReportConfig::from(&config));
    let mut beamline = Beamline::new(Arc::new(client), &options)?;

    let watch = beamline
        .watchpoints()
        .into_iter()
        .next()
        .ok_or_else(|| SirepoError::not_found("type", "watch"))?;
    let aperture = beamline
        .device_names()
        .into_iter()
        .find(|name| {
            beamline
                .dev(name)
                .map(|d| d.has_signal("horizontalSize"))
                .unwrap_or(false)
        })
        .ok_or_else(|| SirepoError::not_found("field", "horizontalSize"))?;

    let mut timer = TickTimer::new();
    beamline.stage(&watch)?;
    for size in [0.1, 0.2, 0.3, 0.4, 0.5] {
        beamline.signal_set(&aperture, "horizontalSize", json!(size))?;
        beamline.trigger(&watch)?;
        println!(
            "{}.horizontalSize = {:.2}: mean = {}, duration = {}",
            aperture,
            size,
            beamline.signal_get(&watch, "mean")?,
            beamline.signal_get(&watch, "duration")?,
        );
    }
    beamline.unstage(&watch)?;
    timer.tick_log("aperture scan");
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
