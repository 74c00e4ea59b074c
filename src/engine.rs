//! The calibration engine: drives the measure → design → verify cycle
//! for every speaker in the table and assembles the per-speaker filter
//! bank.
//!
//! One calibration run owns the rack's routing outright. At any instant
//! during a run, at most one speaker is electrically active: the speaker
//! under test gets its channel, every other playback unit is parked on
//! the silent channel. A hardware failure during any step aborts the
//! whole run; a quiet speaker does not, it is bypassed with a flat
//! filter and the run moves on.

use crate::filter::{self, BankError, CalibrationBank, CalibrationFilter, FilterError};
use crate::processor::{recording_delay, DeviceError, ProcessorRole};
use crate::rack::{PollSettings, Rack, TriggerKind, BUSY_TAG};
use crate::signal::{Recording, Signal, HARDWARE_SAMPLERATE};
use crate::speaker_table::{NotFoundError, SpeakerEntry, SpeakerTable};

use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Channel-select tag on the playback circuits.
const CHANNEL_TAG: &str = "chan";

/// Sample-buffer tag on the playback and record circuits.
const DATA_TAG: &str = "data";

/// Buffer-length tag on all circuits.
const BUFLEN_TAG: &str = "playbuflen";

/// Everything a calibration run can be tuned with. Constructed once per
/// session and carried inside the [CalibrationContext]; there is no
/// process-wide state.
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Recordings below this level are bypassed rather than corrected
    pub threshold_db: f64,
    /// Lower edge of the analysis band in Hz, also the probe sweep start
    pub low_freq: f64,
    /// Upper edge of the analysis band in Hz, also the probe sweep end
    pub high_freq: f64,
    /// Mic-to-speaker distance in meters, for the travel-time delay
    pub mic_distance: f64,
    /// Hardware sample rate in Hz
    pub samplerate: f64,
    /// Probe duration in seconds
    pub probe_duration: f64,
    /// Busy-poll cadence and bound
    pub poll: PollSettings,
    /// Directory holding the speaker tables and the active artifact
    pub data_dir: PathBuf,
    /// Directory superseded artifacts are archived into
    pub archive_dir: PathBuf,
    /// When set, per-speaker recordings are dumped here as WAV
    pub diagnostics_dir: Option<PathBuf>,
}

impl CalibrationSettings {
    /// Default tuning against a data directory: the 50–16000 Hz band,
    /// the 80 dB bypass threshold, a 50 ms probe at the hardware rate.
    pub fn new(data_dir: PathBuf) -> Self {
        let archive_dir = data_dir.join("archive");
        Self {
            threshold_db: 80.0,
            low_freq: 50.0,
            high_freq: 16000.0,
            mic_distance: 1.6,
            samplerate: HARDWARE_SAMPLERATE,
            probe_duration: 0.05,
            poll: PollSettings::default(),
            data_dir,
            archive_dir,
            diagnostics_dir: None,
        }
    }
}

/// The explicit state a calibration run works against: the loaded
/// table, the rack, the settings, and the run-in-progress flag that
/// keeps two runs from interleaving routing changes.
pub struct CalibrationContext {
    /// The routing table for the selected geometry
    pub table: SpeakerTable,
    /// The connected rack
    pub rack: Rack,
    /// Run tuning
    pub settings: CalibrationSettings,
    run_flag: Arc<AtomicBool>,
}

impl CalibrationContext {
    /// Binds a table, a rack and settings into one context.
    pub fn new(table: SpeakerTable, rack: Rack, settings: CalibrationSettings) -> Self {
        Self {
            table,
            rack,
            settings,
            run_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claims the exclusive right to change routing. Released when the
    /// returned guard drops.
    pub fn try_begin_run(&self) -> Result<RunGuard, CalibrationError> {
        if self.run_flag.swap(true, Ordering::SeqCst) {
            return Err(CalibrationError::RunInProgress);
        }
        Ok(RunGuard {
            flag: Arc::clone(&self.run_flag),
        })
    }
}

/// Clears the context's run flag when dropped, on every exit path.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Errors that end a calibration run or a calibrated playback.
#[derive(Debug)]
pub enum CalibrationError {
    /// Another run already owns the rack's routing.
    RunInProgress,

    /// A hardware call failed mid-run. Partial results are discarded;
    /// the previously persisted bank stays untouched.
    Aborted { speaker: u32, source: DeviceError },

    /// A tag the protocol requires is missing from a loaded circuit.
    /// Also aborts the run: without it no measurement can be trusted.
    MissingTag {
        speaker: u32,
        role: ProcessorRole,
        tag: &'static str,
    },

    /// Filter design or application failed.
    Design(FilterError),

    /// The finished bank could not be persisted.
    Persist(BankError),

    /// A speaker lookup missed.
    NotFound(NotFoundError),

    /// The bank holds no filter for the requested speaker.
    Uncalibrated { speaker: u32 },
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationError::RunInProgress => {
                write!(f, "a calibration run is already in progress")
            }
            CalibrationError::Aborted { speaker, source } => {
                write!(f, "run aborted at speaker {}: {}", speaker, source)
            }
            CalibrationError::MissingTag { speaker, role, tag } => {
                write!(
                    f,
                    "run aborted at speaker {}: {} circuit has no tag {:?}",
                    speaker, role, tag
                )
            }
            CalibrationError::Design(error) => write!(f, "filter design failed: {}", error),
            CalibrationError::Persist(error) => {
                write!(f, "could not persist filter bank: {}", error)
            }
            CalibrationError::NotFound(error) => write!(f, "{}", error),
            CalibrationError::Uncalibrated { speaker } => {
                write!(f, "no stored filter for speaker {}", speaker)
            }
        }
    }
}

impl std::error::Error for CalibrationError {}

/// Per-speaker diagnostics from a run: the measured level, the
/// amplitude-difference curves of both passes, and whether the speaker
/// was bypassed. Observational only; nothing feeds back into the
/// stored filters.
#[derive(Debug, Clone)]
pub struct SpeakerReport {
    /// Speaker this report describes
    pub speaker_id: u32,
    /// Surveyed azimuth in degrees, if known
    pub azimuth: Option<f64>,
    /// Surveyed elevation in degrees, if known
    pub elevation: Option<f64>,
    /// True when the measurement was too quiet to trust
    pub bypassed: bool,
    /// Level of the first-pass recording in dB
    pub level_db: f64,
    /// Level of the verify-pass recording, absent for bypassed speakers
    pub verify_level_db: Option<f64>,
    /// First-pass amplitude difference per analysis bin, in dB
    pub amplitude_diff_db: Vec<f32>,
    /// Verify-pass amplitude difference per analysis bin, in dB
    pub verify_amplitude_diff_db: Vec<f32>,
    /// Analysis bin centers in Hz
    pub frequencies: Vec<f64>,
}

/// Result of a successful full run.
#[derive(Debug)]
pub struct CalibrationOutcome {
    /// The complete bank, one filter per speaker in the table
    pub bank: CalibrationBank,
    /// Per-speaker diagnostics, ascending id
    pub reports: Vec<SpeakerReport>,
    /// Where the bank was persisted
    pub artifact: PathBuf,
    /// Where the superseded artifact went, if one existed
    pub archived: Option<PathBuf>,
}

/// Orchestrates the per-speaker two-pass calibration cycle.
pub struct CalibrationEngine {
    probe: Signal,
}

impl CalibrationEngine {
    /// Builds the engine and its probe stimulus from the settings: a
    /// chirp sweeping exactly the analysis band.
    pub fn new(settings: &CalibrationSettings) -> Self {
        let probe = Signal::chirp(
            settings.probe_duration,
            settings.low_freq,
            settings.high_freq,
            settings.samplerate,
        );
        Self { probe }
    }

    /// The probe stimulus used for every measurement.
    pub fn probe(&self) -> &Signal {
        &self.probe
    }

    /// Calibrates every speaker in the context's table, in ascending id
    /// order, and persists the finished bank. On any hardware failure
    /// the rack is unrouted and the whole run is abandoned; the
    /// previously persisted bank is left untouched.
    pub fn calibrate(
        &self,
        ctx: &mut CalibrationContext,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        let _guard = ctx.try_begin_run()?;

        let silent = ctx.table.silent_channel();
        let delay = recording_delay(
            ctx.settings.mic_distance,
            ctx.settings.samplerate,
            Some(ctx.rack.kind(ProcessorRole::PlaybackA)),
            Some(ctx.rack.kind(ProcessorRole::Recorder)),
        );
        info!(
            "calibrating {} speakers on the {} array ({} sample recording delay)",
            ctx.table.len(),
            ctx.table.geometry(),
            delay
        );

        let measured = self.run_speakers(ctx, silent, delay);
        let (bank, reports) = match measured {
            Ok(result) => result,
            Err(error) => {
                // leave no speaker live behind us, best effort
                for role in ProcessorRole::PLAYBACK {
                    let _ = ctx.rack.write_tag(role, CHANNEL_TAG, silent as f64);
                }
                return Err(error);
            }
        };

        let (artifact, archived) = persist_bank(&bank, ctx)?;
        info!(
            "calibration complete, bank of {} filters written to {}",
            bank.len(),
            artifact.display()
        );
        Ok(CalibrationOutcome {
            bank,
            reports,
            artifact,
            archived,
        })
    }

    fn run_speakers(
        &self,
        ctx: &mut CalibrationContext,
        silent: u16,
        delay: usize,
    ) -> Result<(CalibrationBank, Vec<SpeakerReport>), CalibrationError> {
        let geometry = ctx.table.geometry().to_string();
        let mut bank = CalibrationBank::new(&geometry, ctx.settings.samplerate);
        let mut reports = Vec::new();

        let entries: Vec<SpeakerEntry> = ctx.table.entries().cloned().collect();
        for entry in &entries {
            debug!(
                "speaker {}: channel {} on {}",
                entry.id, entry.channel, entry.role
            );
            route(&mut ctx.rack, entry, silent)?;
            let report = self.measure_one(ctx, entry, delay, &mut bank)?;
            reports.push(report);
            // park the speaker again before moving on
            write_required(
                &mut ctx.rack,
                entry.role,
                CHANNEL_TAG,
                silent as f64,
                entry.id,
            )?;
        }
        Ok((bank, reports))
    }

    fn measure_one(
        &self,
        ctx: &mut CalibrationContext,
        entry: &SpeakerEntry,
        delay: usize,
        bank: &mut CalibrationBank,
    ) -> Result<SpeakerReport, CalibrationError> {
        let settings = &ctx.settings;
        let recording = measure(&mut ctx.rack, &self.probe, delay, settings, entry.id)?;
        let level = recording.level_db();

        if level < settings.threshold_db {
            info!(
                "speaker {}: {:.1} dB is below the {:.0} dB threshold, storing a flat filter",
                entry.id, level, settings.threshold_db
            );
            bank.insert(
                entry.id,
                CalibrationFilter::identity(self.probe.nsamples(), settings.samplerate),
            );
            return Ok(SpeakerReport {
                speaker_id: entry.id,
                azimuth: entry.azimuth,
                elevation: entry.elevation,
                bypassed: true,
                level_db: level,
                verify_level_db: None,
                amplitude_diff_db: Vec::new(),
                verify_amplitude_diff_db: Vec::new(),
                frequencies: Vec::new(),
            });
        }

        let design = filter::design(
            &self.probe,
            recording.signal(),
            settings.low_freq,
            settings.high_freq,
        )
        .map_err(CalibrationError::Design)?;
        // the filter is final here; the second pass only observes it
        bank.insert(entry.id, design.filter.clone());

        let filtered = design
            .filter
            .apply(&self.probe)
            .map_err(CalibrationError::Design)?;
        let verify = measure(&mut ctx.rack, &filtered, delay, settings, entry.id)?;
        let verify_design = filter::design(
            &filtered,
            verify.signal(),
            settings.low_freq,
            settings.high_freq,
        )
        .map_err(CalibrationError::Design)?;
        if verify.level_db() < settings.threshold_db {
            warn!(
                "speaker {}: verify pass came back at {:.1} dB; the stored filter stands",
                entry.id,
                verify.level_db()
            );
        }

        if let Some(dir) = &ctx.settings.diagnostics_dir {
            dump_diagnostics(dir, entry.id, &recording, &verify);
        }

        info!(
            "speaker {}: {:.1} dB measured, {:.1} dB after correction",
            entry.id,
            level,
            verify.level_db()
        );
        Ok(SpeakerReport {
            speaker_id: entry.id,
            azimuth: entry.azimuth,
            elevation: entry.elevation,
            bypassed: false,
            level_db: level,
            verify_level_db: Some(verify.level_db()),
            amplitude_diff_db: design.amplitude_diff_db,
            verify_amplitude_diff_db: verify_design.amplitude_diff_db,
            frequencies: design.frequencies,
        })
    }
}

/// Routes one speaker: its channel on the owning playback unit, the
/// silent channel everywhere else, so no other speaker can sound.
fn route(rack: &mut Rack, entry: &SpeakerEntry, silent: u16) -> Result<(), CalibrationError> {
    for role in ProcessorRole::PLAYBACK {
        let channel = if role == entry.role {
            entry.channel
        } else {
            silent
        };
        write_required(rack, role, CHANNEL_TAG, channel as f64, entry.id)?;
    }
    Ok(())
}

/// Writes a tag the protocol cannot do without, converting both device
/// errors and tag absence into run-ending errors.
fn write_required(
    rack: &mut Rack,
    role: ProcessorRole,
    tag: &'static str,
    value: f64,
    speaker: u32,
) -> Result<(), CalibrationError> {
    let status = rack
        .write_tag(role, tag, value)
        .map_err(|source| CalibrationError::Aborted { speaker, source })?;
    if !status.is_ok() {
        return Err(CalibrationError::MissingTag { speaker, role, tag });
    }
    Ok(())
}

/// One arm → trigger → wait → read cycle: plays `signal` through the
/// currently routed channel and returns what the mic heard, with the
/// recording-delay prefix discarded.
fn measure(
    rack: &mut Rack,
    signal: &Signal,
    delay: usize,
    settings: &CalibrationSettings,
    speaker: u32,
) -> Result<Recording, CalibrationError> {
    let aborted = |source| CalibrationError::Aborted { speaker, source };
    let n = signal.nsamples();

    for role in ProcessorRole::PLAYBACK {
        write_required(rack, role, BUFLEN_TAG, n as f64, speaker)?;
        let status = rack
            .write_buffer(role, DATA_TAG, signal.samples())
            .map_err(aborted)?;
        if !status.is_ok() {
            return Err(CalibrationError::MissingTag {
                speaker,
                role,
                tag: DATA_TAG,
            });
        }
    }
    // the recorder keeps capturing while the sound is still in flight
    write_required(
        rack,
        ProcessorRole::Recorder,
        BUFLEN_TAG,
        (n + delay) as f64,
        speaker,
    )?;

    if rack.trigger_bus_running() {
        rack.fire_trigger(TriggerKind::BusA, None).map_err(aborted)?;
    } else {
        // no bus: arm the recorder first, then start the sound
        rack.fire_trigger(TriggerKind::Software, Some(ProcessorRole::Recorder))
            .map_err(aborted)?;
        for role in ProcessorRole::PLAYBACK {
            rack.fire_trigger(TriggerKind::Software, Some(role))
                .map_err(aborted)?;
        }
    }

    rack.wait_until_idle(&ProcessorRole::ALL, BUSY_TAG, &settings.poll)
        .map_err(aborted)?;

    let raw = rack
        .read_buffer(ProcessorRole::Recorder, DATA_TAG, n + delay)
        .map_err(aborted)?
        .ok_or(CalibrationError::MissingTag {
            speaker,
            role: ProcessorRole::Recorder,
            tag: DATA_TAG,
        })?;
    Ok(Recording::new(raw[delay..].to_vec(), signal.samplerate()))
}

/// Archives any previous artifact under a timestamped name and renames
/// a freshly written temp file into place. Any failure leaves the
/// previous artifact exactly where it was and removes the temp file.
fn persist_bank(
    bank: &CalibrationBank,
    ctx: &CalibrationContext,
) -> Result<(PathBuf, Option<PathBuf>), CalibrationError> {
    let artifact = ctx.table.geometry().artifact_file(&ctx.settings.data_dir);
    let tmp = artifact.with_extension("ron.tmp");

    if let Err(error) = bank.to_path(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(CalibrationError::Persist(error));
    }

    let archived = if artifact.exists() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let stem = artifact
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("calibration");
        let dest = ctx
            .settings
            .archive_dir
            .join(format!("{}_{}.ron", stem, stamp));
        let moved = fs::create_dir_all(&ctx.settings.archive_dir)
            .and_then(|_| fs::rename(&artifact, &dest));
        if let Err(error) = moved {
            let _ = fs::remove_file(&tmp);
            return Err(CalibrationError::Persist(BankError::Io(error)));
        }
        info!("previous calibration archived as {}", dest.display());
        Some(dest)
    } else {
        None
    };

    if let Err(error) = fs::rename(&tmp, &artifact) {
        let _ = fs::remove_file(&tmp);
        return Err(CalibrationError::Persist(BankError::Io(error)));
    }
    Ok((artifact, archived))
}

fn dump_diagnostics(dir: &PathBuf, speaker: u32, recording: &Recording, verify: &Recording) {
    let dump = fs::create_dir_all(dir)
        .map_err(|error| error.to_string())
        .and_then(|_| {
            recording
                .signal()
                .write_wav(&dir.join(format!("speaker_{:02}_recorded.wav", speaker)))
                .map_err(|error| error.to_string())
        })
        .and_then(|_| {
            verify
                .signal()
                .write_wav(&dir.join(format!("speaker_{:02}_verified.wav", speaker)))
                .map_err(|error| error.to_string())
        });
    if let Err(error) = dump {
        warn!("speaker {}: diagnostic dump failed: {}", speaker, error);
    }
}

/// Plays a signal through one speaker with its stored correction filter
/// applied, under the same routing discipline as a calibration run.
pub fn play_calibrated(
    ctx: &mut CalibrationContext,
    bank: &CalibrationBank,
    speaker_id: u32,
    signal: &Signal,
) -> Result<(), CalibrationError> {
    let _guard = ctx.try_begin_run()?;

    let entry = ctx
        .table
        .lookup_by_id(speaker_id)
        .map_err(CalibrationError::NotFound)?
        .clone();
    let filter = bank
        .filter(speaker_id)
        .ok_or(CalibrationError::Uncalibrated { speaker: speaker_id })?;
    let filtered = filter.apply(signal).map_err(CalibrationError::Design)?;

    let silent = ctx.table.silent_channel();
    route(&mut ctx.rack, &entry, silent)?;
    for role in ProcessorRole::PLAYBACK {
        write_required(
            &mut ctx.rack,
            role,
            BUFLEN_TAG,
            filtered.nsamples() as f64,
            speaker_id,
        )?;
        let status = ctx
            .rack
            .write_buffer(role, DATA_TAG, filtered.samples())
            .map_err(|source| CalibrationError::Aborted {
                speaker: speaker_id,
                source,
            })?;
        if !status.is_ok() {
            return Err(CalibrationError::MissingTag {
                speaker: speaker_id,
                role,
                tag: DATA_TAG,
            });
        }
    }

    let trigger = if ctx.rack.trigger_bus_running() {
        ctx.rack.fire_trigger(TriggerKind::BusA, None)
    } else {
        ProcessorRole::PLAYBACK.iter().try_for_each(|role| {
            ctx.rack.fire_trigger(TriggerKind::Software, Some(*role))
        })
    };
    trigger.map_err(|source| CalibrationError::Aborted {
        speaker: speaker_id,
        source,
    })?;
    ctx.rack
        .wait_until_idle(&ProcessorRole::PLAYBACK, BUSY_TAG, &ctx.settings.poll)
        .map_err(|source| CalibrationError::Aborted {
            speaker: speaker_id,
            source,
        })?;

    for role in ProcessorRole::PLAYBACK {
        write_required(&mut ctx.rack, role, CHANNEL_TAG, silent as f64, speaker_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_processor::DummyRoom;
    use crate::processor::{ConnectionParams, DeviceKind};
    use crate::speaker_table::Geometry;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    const ROWS: &str = "1,1,A,-90.0,0.0,1\n2,2,A,-30.0,0.0,0\n3,1,B,30.0,0.0,0\n4,2,B,90.0,0.0,1\n";

    fn fixture(rows: &str) -> (tempfile::TempDir, DummyRoom, CalibrationContext) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("speakertable_arc.txt")).unwrap();
        writeln!(file, "id,channel,role,azimuth,elevation,indicator").unwrap();
        write!(file, "{}", rows).unwrap();
        drop(file);
        let table = SpeakerTable::load(Geometry::Arc, dir.path()).unwrap();

        let delay = recording_delay(
            1.6,
            HARDWARE_SAMPLERATE,
            Some(DeviceKind::PlaybackUnit),
            Some(DeviceKind::RecordUnit),
        );
        let mut room = DummyRoom::new(delay);
        let a = room.playback_unit();
        let b = room.playback_unit();
        let rec = room.recorder_unit();
        let bus = room.trigger_bus();
        room.wire_table(&table);

        let mut rack = Rack::new(Box::new(a), Box::new(b), Box::new(rec), Some(Box::new(bus)));
        rack.bring_up(
            Path::new("play_buf.rcx"),
            Path::new("rec_buf.rcx"),
            &ConnectionParams::default(),
        )
        .unwrap();

        let mut settings = CalibrationSettings::new(dir.path().to_path_buf());
        settings.poll = PollSettings {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(250),
        };
        let ctx = CalibrationContext::new(table, rack, settings);
        (dir, room, ctx)
    }

    #[test]
    fn full_run_covers_every_speaker_exactly_once() {
        let (_dir, _room, mut ctx) = fixture(ROWS);
        let engine = CalibrationEngine::new(&ctx.settings);

        let outcome = engine.calibrate(&mut ctx).unwrap();
        assert_eq!(outcome.bank.len(), 4);
        assert_eq!(
            outcome.bank.speaker_ids().collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        // healthy speakers get a real correction, not a flat filter
        for id in 1..=4 {
            assert!(!outcome.bank.filter(id).unwrap().is_identity());
        }
        assert!(outcome.artifact.exists());
        assert!(outcome.archived.is_none());
        assert_eq!(outcome.reports.len(), 4);
        assert!(outcome.reports.iter().all(|r| !r.bypassed));
    }

    #[test]
    fn quiet_speaker_is_bypassed_both_times() {
        let (_dir, mut room, mut ctx) = fixture(ROWS);
        // speaker 3 is channel 1 on playback-B; kill it
        room.set_gain(ProcessorRole::PlaybackB, 1, 0.0);
        let engine = CalibrationEngine::new(&ctx.settings);

        let first = engine.calibrate(&mut ctx).unwrap();
        assert!(first.bank.filter(3).unwrap().is_identity());
        assert!(first.reports[2].bypassed);
        assert!(!first.bank.filter(1).unwrap().is_identity());

        // the same channel bypasses again, and the first artifact is
        // archived rather than overwritten
        let second = engine.calibrate(&mut ctx).unwrap();
        assert!(second.bank.filter(3).unwrap().is_identity());
        let archived = second.archived.unwrap();
        assert!(archived.exists());
        assert!(second.artifact.exists());
    }

    #[test]
    fn routing_leaves_every_other_unit_on_the_silent_channel() {
        let (_dir, _room, mut ctx) = fixture(ROWS);
        let silent = ctx.table.silent_channel();
        let entry = ctx.table.lookup_by_id(3).unwrap().clone();

        route(&mut ctx.rack, &entry, silent).unwrap();
        assert_eq!(
            ctx.rack
                .read_tag(ProcessorRole::PlaybackB, CHANNEL_TAG)
                .unwrap(),
            Some(entry.channel as f64)
        );
        assert_eq!(
            ctx.rack
                .read_tag(ProcessorRole::PlaybackA, CHANNEL_TAG)
                .unwrap(),
            Some(silent as f64)
        );
    }

    #[test]
    fn stuck_hardware_aborts_the_run_and_unroutes() {
        let (dir, room, mut ctx) = fixture(ROWS);
        room.set_stuck_busy(true);
        let engine = CalibrationEngine::new(&ctx.settings);

        let err = engine.calibrate(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Aborted {
                speaker: 1,
                source: DeviceError::Timeout { .. },
            }
        ));

        // cleanup parked both playback units on the silent channel
        let silent = ctx.table.silent_channel() as f64;
        for role in ProcessorRole::PLAYBACK {
            assert_eq!(ctx.rack.read_tag(role, CHANNEL_TAG).unwrap(), Some(silent));
        }
        // and nothing was persisted
        let artifact = Geometry::Arc.artifact_file(dir.path());
        assert!(!artifact.exists());
        assert!(!artifact.with_extension("ron.tmp").exists());
    }

    #[test]
    fn dead_recorder_link_aborts() {
        let (_dir, room, mut ctx) = fixture(ROWS);
        room.fail_recorder_reads(true);
        let engine = CalibrationEngine::new(&ctx.settings);

        let err = engine.calibrate(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::MissingTag {
                role: ProcessorRole::Recorder,
                ..
            }
        ));
    }

    #[test]
    fn failed_persist_leaves_the_previous_artifact_untouched() {
        let (dir, _room, mut ctx) = fixture(ROWS);
        let engine = CalibrationEngine::new(&ctx.settings);
        engine.calibrate(&mut ctx).unwrap();

        let artifact = Geometry::Arc.artifact_file(dir.path());
        let before = fs::read_to_string(&artifact).unwrap();

        // make archiving impossible: the archive dir's parent is a file
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        ctx.settings.archive_dir = blocker.join("archive");

        let err = engine.calibrate(&mut ctx).unwrap_err();
        assert!(matches!(err, CalibrationError::Persist(_)));
        assert_eq!(fs::read_to_string(&artifact).unwrap(), before);
        assert!(!artifact.with_extension("ron.tmp").exists());
    }

    #[test]
    fn run_guard_blocks_a_second_run() {
        let (_dir, _room, mut ctx) = fixture(ROWS);
        let engine = CalibrationEngine::new(&ctx.settings);

        let guard = ctx.try_begin_run().unwrap();
        let err = engine.calibrate(&mut ctx).unwrap_err();
        assert!(matches!(err, CalibrationError::RunInProgress));

        drop(guard);
        engine.calibrate(&mut ctx).unwrap();
    }

    #[test]
    fn play_calibrated_requires_a_known_calibrated_speaker() {
        let (_dir, _room, mut ctx) = fixture(ROWS);
        let engine = CalibrationEngine::new(&ctx.settings);
        let outcome = engine.calibrate(&mut ctx).unwrap();

        let tone = engine.probe().clone();
        play_calibrated(&mut ctx, &outcome.bank, 2, &tone).unwrap();

        let err = play_calibrated(&mut ctx, &outcome.bank, 99, &tone).unwrap_err();
        assert!(matches!(err, CalibrationError::NotFound(_)));

        let empty = CalibrationBank::new("arc", ctx.settings.samplerate);
        let err = play_calibrated(&mut ctx, &empty, 2, &tone).unwrap_err();
        assert!(matches!(err, CalibrationError::Uncalibrated { speaker: 2 }));
    }
}
