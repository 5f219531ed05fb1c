//! End-to-end sample flow through the transfer pipeline, looped back by the
//! simulator's resistive load.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::session_with;
use daq_driver_smu::device::calibration::{CeeCalibration, M1000Calibration};
use daq_driver_smu::info::Mode;
use daq_driver_smu::signal::MeasureBuffer;
use daq_driver_smu::sim::SimulatedSmu;

fn assert_all_near(samples: &[f32], expected: f32, tolerance: f32) {
    for (i, &s) in samples.iter().enumerate() {
        assert!(
            (s - expected).abs() <= tolerance,
            "sample {i}: {s} not within {tolerance} of {expected}"
        );
    }
}

#[test]
fn test_cee_svmi_into_load() {
    let sim = Arc::new(SimulatedSmu::cee("CEE-1").with_load(100.0));
    let session = session_with(&[sim.clone()]);
    let dev = session.get_device("CEE-1").unwrap();

    dev.set_mode(0, Mode::Svmi).unwrap();
    let volts = MeasureBuffer::new(2000);
    let amps = MeasureBuffer::new(2000);
    {
        let mut bank = dev.lock();
        bank.signal_mut(0, 0).unwrap().source_constant(2.0);
        bank.signal_mut(0, 0).unwrap().measure_buffer(volts.clone(), 2000);
        bank.signal_mut(0, 1).unwrap().measure_buffer(amps.clone(), 2000);
    }

    session.run(2000).unwrap();

    assert_eq!(volts.written(), 2000);
    assert_eq!(amps.written(), 2000);
    assert_all_near(&volts.snapshot(), 2.0, 0.01);
    assert_all_near(&amps.snapshot(), 0.02, 0.001);
    assert_eq!(dev.samples_consumed(), 2000);
    assert!(!sim.is_streaming());
}

#[test]
fn test_m1000_simv_into_load() {
    let sim = Arc::new(SimulatedSmu::m1000("M-1").with_load(100.0));
    let session = session_with(&[sim.clone()]);
    let dev = session.get_device("M-1").unwrap();

    dev.set_mode(1, Mode::Simv).unwrap();
    let volts = MeasureBuffer::new(3000);
    let amps = MeasureBuffer::new(3000);
    {
        let mut bank = dev.lock();
        bank.signal_mut(1, 1).unwrap().source_constant(0.01);
        bank.signal_mut(1, 0).unwrap().measure_buffer(volts.clone(), 3000);
        bank.signal_mut(1, 1).unwrap().measure_buffer(amps.clone(), 3000);
    }

    session.run(3000).unwrap();

    assert_eq!(volts.written(), 3000);
    assert_all_near(&volts.snapshot(), 1.0, 0.01);
    assert_all_near(&amps.snapshot(), 0.01, 1e-4);
}

#[test]
fn test_buffer_source_arrives_in_tick_order() {
    let sim = Arc::new(SimulatedSmu::cee("CEE-2"));
    let session = session_with(&[sim]);
    let dev = session.get_device("CEE-2").unwrap();

    // 0.5 V .. 4.46 V staircase, 100 ticks long
    let ramp: Vec<f32> = (0..100).map(|i| 0.5 + i as f32 * 0.04).collect();
    let volts = MeasureBuffer::new(1000);
    dev.set_mode(0, Mode::Svmi).unwrap();
    {
        let mut bank = dev.lock();
        bank.signal_mut(0, 0).unwrap().source_buffer(ramp.clone(), true).unwrap();
        bank.signal_mut(0, 0).unwrap().measure_buffer(volts.clone(), 1000);
    }

    session.run(1000).unwrap();

    for (tick, &measured) in volts.snapshot().iter().enumerate() {
        let expected = ramp[tick % ramp.len()];
        assert!(
            (measured - expected).abs() < 0.005,
            "tick {tick}: measured {measured}, sourced {expected}"
        );
    }
}

#[test]
fn test_callback_sink_sees_every_tick() {
    let sim = Arc::new(SimulatedSmu::m1000("M-2"));
    let session = session_with(&[sim]);
    let dev = session.get_device("M-2").unwrap();

    let count = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&count);
    dev.lock()
        .signal_mut(0, 0)
        .unwrap()
        .measure_callback(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

    session.run(5000).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 5000);
}

#[test]
fn test_disabled_channel_measures_nothing() {
    let sim = Arc::new(SimulatedSmu::cee("CEE-3"));
    let session = session_with(&[sim]);
    let dev = session.get_device("CEE-3").unwrap();
    assert_eq!(dev.mode(1).unwrap(), Mode::Disabled);

    let volts = MeasureBuffer::new(500);
    {
        let mut bank = dev.lock();
        bank.signal_mut(1, 0).unwrap().source_constant(3.0);
        bank.signal_mut(1, 0).unwrap().measure_buffer(volts.clone(), 500);
    }

    session.run(500).unwrap();
    assert_all_near(&volts.snapshot(), 0.0, 0.005);
}

#[test]
fn test_m1000_calibration_corrects_converter_error() {
    let mut cal = M1000Calibration::identity();
    // channel A: source voltage, measure voltage, measure current
    cal.offset[2] = 0.05;
    cal.gain_p[2] = 0.98;
    cal.offset[0] = -0.02;
    cal.gain_p[0] = 1.01;
    cal.offset[1] = 0.001;
    cal.gain_p[1] = 1.02;

    let measure = |cal: M1000Calibration, serial: &str| {
        let sim = Arc::new(SimulatedSmu::m1000(serial).with_m1000_calibration(cal));
        let session = session_with(&[sim]);
        let dev = session.get_device(serial).unwrap();
        dev.set_mode(0, Mode::Svmi).unwrap();
        let volts = MeasureBuffer::new(1000);
        {
            let mut bank = dev.lock();
            bank.signal_mut(0, 0).unwrap().source_constant(2.0);
            bank.signal_mut(0, 0).unwrap().measure_buffer(volts.clone(), 1000);
        }
        session.run(1000).unwrap();
        (dev.is_calibrated(), volts.snapshot())
    };

    let (calibrated, corrected) = measure(cal.clone().into_valid(), "M-CAL");
    assert!(calibrated);
    assert_all_near(&corrected, 2.0, 0.005);

    // same converter error, but the record is not marked valid
    let (calibrated, raw) = measure(cal, "M-RAW");
    assert!(!calibrated);
    assert!((raw[500] - 2.0).abs() > 0.05);
}

#[test]
fn test_cee_calibration_offsets_removed() {
    let cal = CeeCalibration::new([4, -3], [2, 1], [100_000, 100_000]);
    let sim = Arc::new(SimulatedSmu::cee("CEE-CAL").with_cee_calibration(cal));
    let session = session_with(&[sim]);
    let dev = session.get_device("CEE-CAL").unwrap();
    assert!(dev.is_calibrated());

    dev.set_mode(0, Mode::Svmi).unwrap();
    let volts = MeasureBuffer::new(1000);
    let amps = MeasureBuffer::new(1000);
    {
        let mut bank = dev.lock();
        bank.signal_mut(0, 0).unwrap().source_constant(1.0);
        bank.signal_mut(0, 0).unwrap().measure_buffer(volts.clone(), 1000);
        bank.signal_mut(0, 1).unwrap().measure_buffer(amps.clone(), 1000);
    }
    session.run(1000).unwrap();

    assert_all_near(&volts.snapshot(), 1.0, 0.01);
    assert_all_near(&amps.snapshot(), 0.01, 0.001);
}
