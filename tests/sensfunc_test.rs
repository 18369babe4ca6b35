//! End-to-end tests: derive sensitivity functions from synthetic standard-star
//! observations against a fixture calibration root, then flux-calibrate with them.


use approx::assert_relative_eq;
use fluxcal::sensfunc::PATCH_LINES;
use fluxcal::{
    apply_orders, apply_sensfunc, compute_masks, generate_orders, generate_sensfunc,
    get_standard_spectrum, scale_to_ab_magnitude, synthetic_ab_magnitude, ApplyRequest,
    AssemblyStage, CalibrationData, ExtinctionRequest, FluxError, MaskConfig, ModelProvenance,
    ObservedSpectrum, SensFuncConfig, SensFuncRecord, StandardQuery, TrueFluxModel,
    TrueFluxSource,
};
use test_data::*;

const EXPTIME: f64 = 120.0;
const AIRMASS: f64 = 1.3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

fn site() -> ExtinctionRequest {
    ExtinctionRequest::Site {
        longitude: SITE_LON,
        latitude: SITE_LAT,
    }
}

fn feige34() -> TrueFluxSource {
    TrueFluxSource::Query(StandardQuery::at(FEIGE34_RA, FEIGE34_DEC))
}

/// FEIGE34 observed at `AIRMASS` over `[start, stop]`.
fn feige34_spectrum(start: f64, stop: f64) -> ObservedSpectrum {
    let wave = grid(start, stop, 2.0);
    let (counts, ivar) = observe(&wave, feige34_flux, EXPTIME, AIRMASS);
    ObservedSpectrum::new(wave, counts, ivar).unwrap()
}

/// A sample of pixels that enter the fit: every 25th pixel passing all masks.
fn fitted_pixels(spec: &ObservedSpectrum) -> Vec<usize> {
    let masks = compute_masks(
        &spec.wave,
        &spec.counts,
        &spec.ivar,
        &MaskConfig::default(),
        None,
    )
    .unwrap();
    masks
        .combined()
        .iter()
        .enumerate()
        .filter(|&(i, &ok)| ok && i % 25 == 0)
        .map(|(i, _)| i)
        .collect()
}

fn smooth_with_extinction() -> SensFuncConfig {
    SensFuncConfig {
        extinction: site(),
        ..Default::default()
    }
}

#[test]
fn smooth_sensfunc_recovers_instrument_response() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let spec = feige34_spectrum(4000.0, 8000.0);

    let record = generate_sensfunc(
        &spec,
        AIRMASS,
        EXPTIME,
        &feige34(),
        &smooth_with_extinction(),
        &data,
    )
    .unwrap();

    // Record layout
    assert_eq!(record.len(), spec.len());
    assert_eq!(record.sensfunc.len(), spec.len());
    assert_eq!(record.mask.len(), spec.len());
    assert_eq!(record.flux_true.len(), spec.len());
    assert_eq!(record.wave_min, 4000.0);
    assert_eq!(record.wave_max, 8000.0);
    assert_eq!(record.std_name, "FEIGE34");
    assert_eq!(record.std_source, "calspec");
    assert!(record.std_cal_file.ends_with("feige34_stis.dat"));
    assert_eq!(record.std_ra.as_deref(), Some(FEIGE34_RA));
    assert_eq!(record.extinction_site.as_deref(), Some("lasilla"));
    assert!(!record.telluric);
    assert_eq!(
        record.stages,
        vec![
            AssemblyStage::Init,
            AssemblyStage::ExtinctionApplied,
            AssemblyStage::ModelResolved,
            AssemblyStage::Masked,
            AssemblyStage::FitPoly,
            AssemblyStage::FitSpline,
            AssemblyStage::Patched,
            AssemblyStage::Packaged,
        ]
    );

    // Edge pixels are never valid
    assert!(!record.mask[0]);
    assert!(!record.mask[spec.len() - 1]);

    let pixels = fitted_pixels(&spec);
    assert!(pixels.len() > 50);
    for i in pixels {
        let w = record.wave[i];
        assert!(record.mask[i]);
        assert_relative_eq!(record.flux_true[i], feige34_flux(w), max_relative = 1e-4);
        assert_relative_eq!(
            record.sensfunc[i],
            instrument_sensitivity(w),
            max_relative = 2e-3
        );
    }
}

#[test]
fn uncovered_standard_is_extrapolated_smoothly() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());

    // Rising model known only redward of 4000 A; a linear edge ramp would
    // cross zero at 3250 A
    let truth = |w: f64| 1e-4 * (w - 2500.0).powi(2);
    let model_wave = grid(4000.0, 8000.0, 10.0);
    let model_flux = model_wave.iter().map(|&w| truth(w)).collect();
    let model = TrueFluxModel::new(
        model_wave,
        model_flux,
        "RISING",
        "rising.dat",
        ModelProvenance::Archive("calspec".into()),
    )
    .unwrap();

    let wave = grid(3200.0, 8000.0, 2.0);
    let (counts, ivar) = observe(&wave, truth, EXPTIME, 0.0);
    let spec = ObservedSpectrum::new(wave, counts, ivar).unwrap();
    let record = generate_sensfunc(
        &spec,
        AIRMASS,
        EXPTIME,
        &TrueFluxSource::Model(model),
        &SensFuncConfig::default(),
        &data,
    )
    .unwrap();

    for (&w, &f) in record.wave.iter().zip(&record.flux_true) {
        assert!(f > 0.0, "true flux {f} at {w} A");
        assert_relative_eq!(f, truth(w), max_relative = 1e-4);
    }
    // No jump where the model ends
    for pair in record.flux_true.windows(2) {
        assert!((pair[1] / pair[0] - 1.0).abs() < 0.02);
    }

    let pixels: Vec<usize> = fitted_pixels(&spec)
        .into_iter()
        .filter(|&i| record.wave[i] < 4000.0)
        .collect();
    assert!(!pixels.is_empty());
    for i in pixels {
        assert_relative_eq!(
            record.sensfunc[i],
            instrument_sensitivity(record.wave[i]),
            max_relative = 2e-3
        );
    }
}

#[test]
fn sensfunc_record_round_trips_through_file() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let spec = feige34_spectrum(5000.0, 7000.0);
    let record = generate_sensfunc(
        &spec,
        AIRMASS,
        EXPTIME,
        &feige34(),
        &SensFuncConfig::default(),
        &data,
    )
    .unwrap();
    assert_eq!(record.extinction_site, None);

    let path = root.path().join("sens.rkyv");
    record.save_to_file(&path).unwrap();
    let loaded = SensFuncRecord::load_from_file(&path).unwrap();
    assert_eq!(loaded, record);
}

#[test]
fn applying_the_sensfunc_recovers_true_flux() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let spec = feige34_spectrum(4000.0, 8000.0);
    let record = generate_sensfunc(
        &spec,
        AIRMASS,
        EXPTIME,
        &feige34(),
        &smooth_with_extinction(),
        &data,
    )
    .unwrap();

    let request = ApplyRequest::new(AIRMASS, EXPTIME)
        .with_extinction(site(), &data)
        .unwrap();
    assert!(request.extinction.is_some());
    let fluxed = apply_sensfunc(&record, &spec, None, &request).unwrap();
    assert_eq!(fluxed.flam.len(), spec.len());

    for i in fitted_pixels(&spec) {
        assert!(fluxed.mask[i]);
        assert_relative_eq!(fluxed.flam[i], feige34_flux(spec.wave[i]), max_relative = 2e-3);
        assert!(fluxed.flam_ivar[i] > 0.0);
    }

    // Rescale to a broadband magnitude half a magnitude fainter
    let filter = data.filter("V").unwrap();
    let ab = synthetic_ab_magnitude(&spec.wave, &fluxed.flam, Some(fluxed.mask.as_slice()), &filter, &[])
        .unwrap();
    let scale = scale_to_ab_magnitude(
        &spec.wave,
        &fluxed.flam,
        Some(fluxed.mask.as_slice()),
        &filter,
        ab + 0.5,
        &[],
    )
    .unwrap();
    assert_relative_eq!(scale, 10f64.powf(-0.2), max_relative = 1e-9);
}

#[test]
fn pixelized_sensfunc_keeps_raw_ratio_in_the_nir() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let wave = grid(8500.0, 10500.0, 2.0);
    let (counts, ivar) = observe(&wave, feige34_flux, EXPTIME, 0.0);
    let spec = ObservedSpectrum::new(wave, counts, ivar).unwrap();

    let config = SensFuncConfig {
        telluric: true,
        ..Default::default()
    };
    let record = generate_sensfunc(&spec, 1.0, EXPTIME, &feige34(), &config, &data).unwrap();
    assert!(record.telluric);
    assert!(!record.stages.contains(&AssemblyStage::FitSpline));
    assert_eq!(record.stages.last(), Some(&AssemblyStage::Packaged));

    let near_patched_line =
        |w: f64| PATCH_LINES.iter().any(|&line| (w - line).abs() <= 10.0);
    let mut checked = 0;
    for (i, &w) in record.wave.iter().enumerate() {
        if !record.mask[i] || near_patched_line(w) {
            continue;
        }
        assert_relative_eq!(record.sensfunc[i], instrument_sensitivity(w), max_relative = 1e-4);
        checked += 1;
    }
    assert!(checked > 800);
}

#[test]
fn missing_transmission_curve_skips_nir_mask() {
    init_tracing();
    let root = build_calibration_root();
    std::fs::remove_file(root.path().join("skysim/mktrans_zm_10_10.dat")).unwrap();
    let data = CalibrationData::new(root.path());
    let wave = grid(8500.0, 10500.0, 2.0);
    let (counts, ivar) = observe(&wave, feige34_flux, EXPTIME, 0.0);
    let spec = ObservedSpectrum::new(wave, counts, ivar).unwrap();

    let record = generate_sensfunc(
        &spec,
        1.0,
        EXPTIME,
        &feige34(),
        &SensFuncConfig::default(),
        &data,
    )
    .unwrap();
    assert_eq!(record.len(), spec.len());
}

#[test]
fn synthetic_standards_from_spectral_type() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let wave = grid(4000.0, 8000.0, 2.0);

    // A0 stars use the rescaled Vega spectrum
    let vega_flux = |w: f64| vega_flux_cgs(w) * 10f64.powf(0.4 * (0.03 - 10.0)) / 1e-17;
    let (counts, ivar) = observe(&wave, vega_flux, EXPTIME, 0.0);
    let spec = ObservedSpectrum::new(wave.clone(), counts, ivar).unwrap();
    let a0 = TrueFluxSource::Query(StandardQuery::by_type("A0V", 10.0));
    let record =
        generate_sensfunc(&spec, 1.0, EXPTIME, &a0, &SensFuncConfig::default(), &data).unwrap();
    assert_eq!(record.std_source, "vega");
    assert_eq!(record.std_name, "A0V");
    assert_eq!(record.std_ra, None);
    for i in fitted_pixels(&spec) {
        assert_relative_eq!(
            record.sensfunc[i],
            instrument_sensitivity(spec.wave[i]),
            max_relative = 2e-3
        );
    }

    // Other types come from the model grid
    let g2_query = StandardQuery::by_type("G2V", 8.0);
    let model = get_standard_spectrum(&g2_query, &data).unwrap();
    assert!(model.cal_file.ends_with("kp00_5750.dat"));
    let level = model.flux[0];
    assert!(level > 0.0);
    let (counts, ivar) = observe(&wave, |_| level, EXPTIME, 0.0);
    let spec = ObservedSpectrum::new(wave, counts, ivar).unwrap();
    let record = generate_sensfunc(
        &spec,
        1.0,
        EXPTIME,
        &TrueFluxSource::Query(g2_query),
        &SensFuncConfig::default(),
        &data,
    )
    .unwrap();
    assert_eq!(record.std_source, "grid-model");
    let mid = spec.len() / 2;
    assert_relative_eq!(
        record.sensfunc[mid],
        instrument_sensitivity(spec.wave[mid]),
        max_relative = 2e-3
    );
}

#[test]
fn resolution_and_request_failures() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let spec = feige34_spectrum(5000.0, 6000.0);

    // No archived standard near the pointing
    let far = TrueFluxSource::Query(StandardQuery::at("00:00:00.0", "-45:00:00"));
    match generate_sensfunc(&spec, 1.0, EXPTIME, &far, &SensFuncConfig::default(), &data) {
        Err(FluxError::StandardNotFound { closest, .. }) => assert!(closest.contains("FEIGE34")),
        other => panic!("expected StandardNotFound, got {other:?}"),
    }

    // Airmass below one with extinction requested
    assert!(matches!(
        generate_sensfunc(&spec, 0.9, EXPTIME, &feige34(), &smooth_with_extinction(), &data),
        Err(FluxError::InvalidInput(_))
    ));

    // Airmass below one without extinction
    assert!(matches!(
        generate_sensfunc(&spec, 0.5, EXPTIME, &feige34(), &SensFuncConfig::default(), &data),
        Err(FluxError::InvalidInput(_))
    ));

    // Extinction requested without observatory coordinates
    let no_site = SensFuncConfig {
        extinction: ExtinctionRequest::Site {
            longitude: f64::NAN,
            latitude: SITE_LAT,
        },
        ..Default::default()
    };
    assert!(matches!(
        generate_sensfunc(&spec, 1.1, EXPTIME, &feige34(), &no_site, &data),
        Err(FluxError::Configuration(_))
    ));

    // Spectral type without a magnitude
    let partial = TrueFluxSource::Query(fluxcal::StandardQuery {
        sptype: Some("G2V".into()),
        ..Default::default()
    });
    assert!(matches!(
        generate_sensfunc(&spec, 1.0, EXPTIME, &partial, &SensFuncConfig::default(), &data),
        Err(FluxError::Configuration(_))
    ));

    assert!(matches!(
        generate_sensfunc(&spec, 1.0, 0.0, &feige34(), &SensFuncConfig::default(), &data),
        Err(FluxError::InvalidInput(_))
    ));
}

#[test]
fn distant_observatory_skips_extinction() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let spec = feige34_spectrum(5000.0, 6000.0);
    let config = SensFuncConfig {
        extinction: ExtinctionRequest::Site {
            longitude: 204.53,
            latitude: 19.83,
        },
        ..Default::default()
    };
    let record = generate_sensfunc(&spec, AIRMASS, EXPTIME, &feige34(), &config, &data).unwrap();
    assert_eq!(record.extinction_site, None);
    assert!(record.stages.contains(&AssemblyStage::ExtinctionApplied));
}

#[test]
fn orders_are_calibrated_independently() {
    init_tracing();
    let root = build_calibration_root();
    let data = CalibrationData::new(root.path());
    let orders = vec![
        feige34_spectrum(4000.0, 5998.0),
        feige34_spectrum(6000.0, 8000.0),
    ];

    let records: Vec<SensFuncRecord> = generate_orders(
        &orders,
        AIRMASS,
        EXPTIME,
        &feige34(),
        &smooth_with_extinction(),
        &data,
    )
    .into_iter()
    .collect::<Result<_, _>>()
    .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].wave_max, 5998.0);
    assert_eq!(records[1].wave_min, 6000.0);

    let request = ApplyRequest::new(AIRMASS, EXPTIME)
        .with_extinction(site(), &data)
        .unwrap();
    let fluxed = apply_orders(&records, &orders, &request).unwrap();
    for (order, out) in orders.iter().zip(&fluxed) {
        for i in fitted_pixels(order) {
            assert_relative_eq!(out.flam[i], feige34_flux(order.wave[i]), max_relative = 2e-3);
        }
    }
}
