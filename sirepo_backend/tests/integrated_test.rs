use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value as Json};
use sha2::{Digest, Sha256};
use sirepo_backend::*;

fn connect(server: &Arc<SimServer>, sim_type: &str, sim_id: &str) -> Arc<SirepoClient> {
    let client = SirepoClient::new(server.clone(), "bluesky");
    client.authenticate(sim_type, sim_id).unwrap();
    Arc::new(client)
}

fn report_config(root: &tempfile::TempDir) -> ReportConfig {
    ReportConfig {
        root_dir: root.path().to_path_buf(),
        image_shape: (10, 12),
        reader: None,
    }
}

fn element(client: &SirepoClient, index: usize) -> Json {
    client.document().read().as_json()["models"]["beamline"][index].clone()
}

fn assert_close(value: &Json, expected: f64) {
    let value = value.as_f64().unwrap();
    assert!(
        (value - expected).abs() <= 1e-12 * expected.abs().max(1.),
        "{} != {}",
        value,
        expected
    );
}

#[test]
fn signals_mirror_the_document() {
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let options = SynthesisOptions::default().with_extra_model_fields(&["undulator", "intensityReport"]);
    let beamline = Beamline::new(client.clone(), &options).unwrap();

    let document = client.document().read();
    let mut checked = 0;
    for name in beamline.device_names() {
        for sig in beamline.dev(&name).unwrap().signals().values() {
            if let Some(binding) = sig.binding() {
                assert!(
                    json_eq(sig.get(), &document.read(binding).unwrap()),
                    "{} disagrees with {}",
                    sig.name(),
                    binding
                );
                checked += 1;
            }
        }
    }
    assert!(checked > 50);
}

#[test]
fn writes_go_through() {
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let mut beamline = Beamline::new(client.clone(), &SynthesisOptions::default()).unwrap();

    let status = beamline.signal_set("aperture", "horizontalSize", json!(0.25)).unwrap();
    assert!(status.is_done() && status.success());
    assert_eq!(element(&client, 0)["horizontalSize"], json!(0.25));

    beamline.signal_put("aperture", "element_position", json!(21.5)).unwrap();
    assert_eq!(element(&client, 0)["position"], json!(21.5));
    assert!(element(&client, 0).get("element_position").is_none());

    beamline.signal_put("w9_propagation", "hrange_mod", json!(2.0)).unwrap();
    assert_eq!(
        client.document().read().as_json()["models"]["propagation"]["9"][0][5],
        json!(2.0)
    );

    // the server copy only changes on a run
    assert_eq!(
        server.simulation(SimServer::SRW_SIM_ID).unwrap()["models"]["beamline"][0]["horizontalSize"],
        json!(1)
    );
}

#[test]
fn read_only_writes_leave_the_document_alone() {
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let options = SynthesisOptions::default().with_read_only(&["verticalSize"]);
    let mut beamline = Beamline::new(client.clone(), &options).unwrap();
    let before = client.document().read().clone();

    assert!(matches!(
        beamline.signal_set("aperture", "verticalSize", json!(5.0)),
        Err(SirepoError::ReadOnly(_))
    ));
    assert_eq!(*client.document().read(), before);
    assert_eq!(beamline.signal_get("aperture", "verticalSize").unwrap(), json!(1.0));

    assert!(matches!(
        beamline.signal_set("w9", "mean", json!(1.0)),
        Err(SirepoError::ReadOnly(_))
    ));
}

#[test]
fn grazing_angle_recomputes_the_orientation() {
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let mut beamline = Beamline::new(client.clone(), &SynthesisOptions::default()).unwrap();
    let before = element(&client, 1);

    beamline.signal_set("hfm", "grazingAngle", json!(10.0)).unwrap();
    assert_eq!(server.calls("stateless-compute"), 1);

    let after = element(&client, 1);
    let changed: HashSet<&str> = after
        .as_object()
        .unwrap()
        .iter()
        .filter(|(key, value)| !json_eq(value, &before[key.as_str()]))
        .map(|(key, _)| key.as_str())
        .collect();
    let expected: HashSet<&str> = ["grazingAngle", "normalVectorX", "normalVectorZ", "tangentialVectorX"]
        .into_iter()
        .collect();
    assert_eq!(changed, expected);

    assert_close(&after["normalVectorX"], 0.9999500004166653);
    assert_close(&after["tangentialVectorX"], 0.009999833334166664);
    assert_close(&after["normalVectorZ"], -0.009999833334166664);
    assert_close(&after["normalVectorY"], 0.);
    assert_close(&after["tangentialVectorY"], 0.);
    // the device caches the new values too
    assert_close(&beamline.signal_get("hfm", "normalVectorZ").unwrap(), -0.009999833334166664);

    // plain fields of the mirror do not reach the service
    beamline.signal_set("hfm", "radius", json!(1000.0)).unwrap();
    assert_eq!(server.calls("stateless-compute"), 1);
}

#[test]
fn crl_recomputes_its_focus() {
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let mut beamline = Beamline::new(client.clone(), &SynthesisOptions::default()).unwrap();

    beamline.signal_set("crl1", "numberOfLenses", json!(2.0)).unwrap();
    let focal = 1500e-6 / (2. * 2. * 4.207e-6);
    let crl = element(&client, 2);
    assert_close(&crl["focalDistance"], focal);
    assert_close(&crl["absoluteFocusPosition"], 30. + focal);
    assert_close(&beamline.signal_get("crl1", "focalDistance").unwrap(), focal);
}

#[test]
fn polling_counts_calls() {
    let server = Arc::new(SimServer::srw_basic().with_status_script(&["pending", "running", "completed"]));
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    client.document().write().set_report("watchpointReport9");
    let (status, duration) = client.run(10).unwrap();
    assert_eq!(status["state"], "completed");
    assert_eq!(server.run_calls(SimServer::SRW_SIM_ID), 3);
    assert!(duration.as_secs_f64() > 0.);

    // unknown states are not terminal
    let server = Arc::new(SimServer::srw_basic().with_status_script(&["canceled", "completed"]));
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    client.document().write().set_report("watchpointReport9");
    client.run(10).unwrap();
    assert_eq!(server.run_calls(SimServer::SRW_SIM_ID), 2);
}

#[test]
fn polling_failures() {
    let server = Arc::new(SimServer::srw_basic().with_status_script(&["pending", "error"]));
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    client.document().write().set_report("watchpointReport9");
    match client.run(10) {
        Err(SirepoError::SimulationFailed { state, .. }) => assert_eq!(state, "error"),
        other => panic!("unexpected {:?}", other.map(|(status, _)| status)),
    }
    assert_eq!(server.run_calls(SimServer::SRW_SIM_ID), 2);

    let server = Arc::new(SimServer::srw_basic().with_status_script(&["running"]));
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    client.document().write().set_report("watchpointReport9");
    assert!(matches!(
        client.run(4),
        Err(SirepoError::PollBudgetExhausted { attempts: 4, .. })
    ));
    assert_eq!(server.run_calls(SimServer::SRW_SIM_ID), 4);

    assert!(matches!(client.run(0), Err(SirepoError::Precondition(_))));
    assert_eq!(server.calls("run-simulation"), 1);
}

#[test]
fn watchpoint_scan() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let options = SynthesisOptions::default().with_report(report_config(&root));
    let mut beamline = Beamline::new(client.clone(), &options).unwrap();
    assert_eq!(beamline.watchpoints(), vec!["w9".to_string()]);

    assert!(matches!(beamline.trigger("w9"), Err(SirepoError::Precondition(_))));
    beamline.stage("w9").unwrap();

    // mean intensity of the 30x40 spot behind an aperture of each horizontal size
    let expected = [
        (0.5, 66543611143.66682),
        (1.0, 133087222287.33363),
        (1.5, 199630833431.00046),
        (2.0, 266174444574.66727),
        (2.5, 332718055718.3341),
    ];
    let mut result_hashes = HashSet::new();
    let mut document_hashes = HashSet::new();
    for (size, mean) in expected {
        beamline.signal_set("aperture", "horizontalSize", json!(size)).unwrap();
        assert!(beamline.trigger("w9").unwrap().success());
        let raw = client.fetch_result(-1).unwrap();
        result_hashes.insert(hex::encode(Sha256::digest(&raw)));
        document_hashes.insert(beamline.signal_get("w9", "sirepo_data_hash").unwrap().to_string());

        let measured = beamline.signal_get("w9", "mean").unwrap().as_f64().unwrap();
        assert!(
            ((measured - mean) / mean).abs() < 1e-9,
            "size {}: mean {} != {}",
            size,
            measured,
            mean
        );
        assert!(beamline.signal_get("w9", "duration").unwrap().as_f64().unwrap() > 0.);
    }
    assert_eq!(result_hashes.len(), expected.len());
    assert_eq!(document_hashes.len(), expected.len());

    let readings = beamline.read("w9").unwrap();
    assert_eq!(readings["w9_shape"].value, json!([30, 40]));
    let snapshot = readings["w9_sirepo_data_json"].value.as_str().unwrap().to_string();
    let snapshot: Json = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(snapshot["models"]["beamline"][0]["horizontalSize"], json!(2.5));

    let keys = beamline.describe("w9").unwrap();
    assert_eq!(keys["w9_image"].shape, vec![10, 12]);
    assert_eq!(keys["w9_image"].external.as_deref(), Some("FILESTORE:"));

    let frames = beamline
        .dev("w9")
        .unwrap()
        .report_state()
        .unwrap()
        .frames()
        .unwrap();
    assert_eq!(frames.len(), 5);
    assert_eq!(frames.frame_shape(), (10, 12));

    let docs = beamline.collect_asset_docs("w9").unwrap();
    assert_eq!(docs.len(), 6);
    let resource = match &docs[0] {
        AssetDoc::Resource(resource) => resource.clone(),
        other => panic!("expected a resource, got {:?}", other),
    };
    assert_eq!(resource.spec, "SRW");
    for (frame, doc) in docs[1..].iter().enumerate() {
        match doc {
            AssetDoc::Datum(datum) => {
                assert_eq!(datum.resource, resource.uid);
                assert_eq!(datum.datum_kwargs["frame"], json!(frame));
            }
            other => panic!("expected a datum, got {:?}", other),
        }
        let file = root
            .path()
            .join(format!("{}_srw_{:04}.dat", resource.resource_path, frame));
        assert!(file.exists(), "{} is missing", file.display());
    }
    assert!(beamline.collect_asset_docs("w9").unwrap().is_empty());

    beamline.unstage("w9").unwrap();
    assert!(matches!(beamline.trigger("w9"), Err(SirepoError::Precondition(_))));
}

#[test]
fn spectrum_trigger() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let options = SynthesisOptions::default()
        .with_extra_model_fields(&["intensityReport"])
        .with_report(report_config(&root));
    let mut beamline = Beamline::new(client, &options).unwrap();
    let name = "single_electron_spectrum";

    beamline.stage(name).unwrap();
    beamline.trigger(name).unwrap();
    assert_eq!(beamline.signal_get(name, "shape").unwrap(), json!([200]));
    let energies = beamline.signal_get(name, "photon_energy").unwrap();
    assert_eq!(energies.as_array().unwrap().len(), 200);
    assert_close(&energies[0], 100.);
    assert!(beamline.signal_get(name, "image").unwrap().as_str().is_some());

    let keys = beamline.describe(name).unwrap();
    assert_eq!(keys[&format!("{}_image", name)].shape, vec![200]);

    let docs = beamline.collect_asset_docs(name).unwrap();
    match &docs[0] {
        AssetDoc::Resource(resource) => assert_eq!(resource.resource_kwargs["ndim"], json!(1)),
        other => panic!("expected a resource, got {:?}", other),
    }
    beamline.unstage(name).unwrap();
}

#[test]
fn shadow_watchpoint_with_injected_reader() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(SimServer::shadow_basic());
    let client = connect(&server, "shadow", SimServer::SHADOW_SIM_ID);

    let options = SynthesisOptions::default().with_report(report_config(&root));
    let mut beamline = Beamline::new(client.clone(), &options).unwrap();
    beamline.stage("w2").unwrap();
    assert!(matches!(beamline.trigger("w2"), Err(SirepoError::Config(_))));

    let config = report_config(&root).with_reader(Arc::new(SrwAsciiReader));
    let options = SynthesisOptions::default().with_report(config);
    let mut beamline = Beamline::new(client, &options).unwrap();
    beamline.stage("w2").unwrap();
    beamline.trigger("w2").unwrap();
    assert_eq!(beamline.signal_get("w2", "shape").unwrap(), json!([50, 50]));
    assert_eq!(beamline.describe("w2").unwrap()["w2_image"].shape, vec![50, 50]);

    let docs = beamline.collect_asset_docs("w2").unwrap();
    match &docs[0] {
        AssetDoc::Resource(resource) => {
            assert_eq!(resource.spec, "SHADOW");
            assert_eq!(resource.resource_kwargs["histogram_bins"], json!(50));
        }
        other => panic!("expected a resource, got {:?}", other),
    }
}

#[test]
fn clones_are_independent_and_deletable() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(SimServer::srw_basic());
    let client = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let original = client.document().read().clone();

    let copy = Arc::new(client.clone_simulation("scan copy").unwrap());
    let copy_id = copy.sim_id().unwrap();
    assert!(copy.is_copy());
    assert!(server.has_simulation(&copy_id));

    let options = SynthesisOptions::default().with_report(report_config(&root));
    let mut beamline = Beamline::new(copy.clone(), &options).unwrap();
    beamline.signal_set("aperture", "horizontalSize", json!(3.0)).unwrap();
    beamline.stage("w9").unwrap();
    beamline.trigger("w9").unwrap();

    assert_eq!(*client.document().read(), original);
    assert_eq!(
        server.simulation(SimServer::SRW_SIM_ID).unwrap()["models"]["beamline"][0]["horizontalSize"],
        json!(1)
    );

    copy.delete_clone().unwrap();
    assert!(!server.has_simulation(&copy_id));
    assert!(server.has_simulation(SimServer::SRW_SIM_ID));
    assert!(matches!(beamline.trigger("w9"), Err(SirepoError::Precondition(_))));
    assert!(matches!(client.delete_clone(), Err(SirepoError::Precondition(_))));
}

#[test]
fn populated_beamline_runs() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(SimServer::srw_basic());
    let source = connect(&server, "srw", SimServer::SRW_SIM_ID);
    let empty = connect(&server, "srw", SimServer::EMPTY_SIM_ID);

    let splices = [Splice {
        source: &source,
        indices: vec![0, 4],
        positions: vec![10., 15.],
    }];
    let options = SynthesisOptions::default().with_report(report_config(&root));
    let mut beamline = populate_beamline(&empty, "spliced", &splices, &options).unwrap();
    assert_eq!(beamline.watchpoints(), vec!["w9".to_string()]);
    assert_eq!(beamline.signal_get("w9", "id").unwrap(), json!(1.0));

    beamline.stage("w9").unwrap();
    beamline.trigger("w9").unwrap();
    assert_eq!(beamline.signal_get("w9", "shape").unwrap(), json!([30, 40]));
}
