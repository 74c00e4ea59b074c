//! Demo front end for the array-calibration engine. Real rack
//! transports live behind the [ProcessorDriver] seam and are supplied
//! by the vendor's driver layer; this binary wires the engine to the
//! simulated rack so the full protocol can be exercised anywhere.
//!
//! [ProcessorDriver]: arraycal::processor::ProcessorDriver

use clap::Parser;

use arraycal::{
    args::{CalArgs, CommandTask},
    dummy_processor::DummyRoom,
    engine::{CalibrationContext, CalibrationEngine, CalibrationSettings},
    filter::CalibrationBank,
    processor::{recording_delay, ConnectionParams, DeviceKind, ProcessorRole},
    rack::Rack,
    speaker_table::SpeakerTable,
};

use log::info;
use std::path::Path;
use std::process::exit;

// Example:
// cargo run --bin arraycal --
//                          --geometry arc
//                          --data     data calibrate
//                          --thresh   80
//                          --diag     diag_out

fn main() {
    env_logger::init();
    let args = CalArgs::parse();

    let table = match SpeakerTable::load(args.geometry, &args.data_dir) {
        Ok(table) => table,
        Err(error) => {
            eprintln!("error: {}", error);
            exit(1);
        }
    };
    info!(
        "{} table loaded, {} speakers",
        table.geometry(),
        table.len()
    );

    match args.command {
        CommandTask::Calibrate(cmd) => {
            let mut settings = CalibrationSettings::new(args.data_dir.clone());
            settings.threshold_db = cmd.threshold;
            settings.low_freq = cmd.low_freq;
            settings.high_freq = cmd.high_freq;
            settings.mic_distance = cmd.distance;
            settings.diagnostics_dir = cmd.diagnostics_dir.clone();

            let rack = match simulated_rack(&table, &settings) {
                Ok(rack) => rack,
                Err(error) => {
                    eprintln!("error: {}", error);
                    exit(1);
                }
            };

            let engine = CalibrationEngine::new(&settings);
            let mut ctx = CalibrationContext::new(table, rack, settings);
            match engine.calibrate(&mut ctx) {
                Ok(outcome) => {
                    for report in &outcome.reports {
                        let verdict = if report.bypassed {
                            "bypassed (flat filter)".to_string()
                        } else {
                            format!(
                                "{:.1} dB measured, {:.1} dB corrected",
                                report.level_db,
                                report.verify_level_db.unwrap_or(f64::NEG_INFINITY)
                            )
                        };
                        println!("speaker {:>2}: {}", report.speaker_id, verdict);
                    }
                    println!("bank written to {}", outcome.artifact.display());
                    if let Some(archived) = outcome.archived {
                        println!("previous bank archived as {}", archived.display());
                    }
                }
                Err(error) => {
                    eprintln!("error: {}", error);
                    ctx.rack.halt_all();
                    exit(1);
                }
            }
            ctx.rack.halt_all();
        }

        CommandTask::Inspect(cmd) => {
            println!("id  chan  role        azimuth  elevation  led");
            let rows: Vec<_> = if cmd.indicators_only {
                table.entries_with_indicator().collect()
            } else {
                table.entries().collect()
            };
            for entry in rows {
                println!(
                    "{:<3} {:<5} {:<11} {:>7}  {:>9}  {}",
                    entry.id,
                    entry.channel,
                    entry.role.to_string(),
                    angle(entry.azimuth),
                    angle(entry.elevation),
                    if entry.has_indicator { "yes" } else { "no" }
                );
            }

            let artifact = args.geometry.artifact_file(&args.data_dir);
            match CalibrationBank::from_path(&artifact) {
                Ok(bank) => println!(
                    "calibrated: {} filters in {}",
                    bank.len(),
                    artifact.display()
                ),
                Err(_) => println!("not calibrated (no usable bank at {})", artifact.display()),
            }
        }
    }
}

/// A full simulated rack wired for the loaded table, brought up and
/// ready to trigger.
fn simulated_rack(
    table: &SpeakerTable,
    settings: &CalibrationSettings,
) -> Result<Rack, arraycal::processor::DeviceError> {
    let delay = recording_delay(
        settings.mic_distance,
        settings.samplerate,
        Some(DeviceKind::PlaybackUnit),
        Some(DeviceKind::RecordUnit),
    );
    let mut room = DummyRoom::new(delay);
    let playback_a = room.playback_unit();
    let playback_b = room.playback_unit();
    let recorder = room.recorder_unit();
    let bus = room.trigger_bus();
    room.wire_table(table);

    let mut rack = Rack::new(
        Box::new(playback_a),
        Box::new(playback_b),
        Box::new(recorder),
        Some(Box::new(bus)),
    );
    rack.bring_up(
        Path::new("play_buf.rcx"),
        Path::new("rec_buf.rcx"),
        &ConnectionParams::default(),
    )?;
    for role in ProcessorRole::ALL {
        info!("{} is {}", role, rack.state(role));
    }
    Ok(rack)
}

fn angle(value: Option<f64>) -> String {
    match value {
        Some(deg) => format!("{:.1}", deg),
        None => "unknown".to_string(),
    }
}
