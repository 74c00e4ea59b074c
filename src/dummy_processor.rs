//! Simulated processing units for tests and bench-less development.
//!
//! A [DummyRoom] stands in for the physical array: it knows which
//! channels actually have a speaker wired to them and at what strength,
//! and it carries sound from whichever playback unit is routed to a
//! wired channel into the record unit's buffer, after the configured
//! recording delay. The units themselves honor the same tag vocabulary
//! as the real circuits (`playbuflen`, `chan`, `data`, `playback`), so
//! the whole calibration protocol runs against them unchanged.

use crate::processor::{ConnectionParams, DeviceKind, ProcessorDriver, ProcessorRole, TagStatus};
use crate::rack::{TriggerBusDriver, TriggerKind};

use rand::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Linear gain a wired channel gets unless overridden: a healthy but
/// not perfectly flat speaker, about 6 dB down.
pub const DEFAULT_CHANNEL_GAIN: f64 = 0.5;

/// How many busy-tag polls a triggered unit stays busy for.
const BUSY_POLLS: usize = 2;

/// Amplitude of the mic noise floor, far below any bypass threshold.
const NOISE_AMPLITUDE: f64 = 1e-6;

struct RoomState {
    // (playback unit, channel) -> linear gain; unwired channels are silent
    wiring: HashMap<(usize, u16), f64>,
    delay_samples: usize,
    epoch: u64,
    // playback unit -> (routed channel, loaded buffer) at trigger time
    emissions: HashMap<usize, (u16, Vec<f32>)>,
    stuck_busy: bool,
    recorder_read_fails: bool,
}

/// The shared acoustic space the dummy units live in, and the knobs the
/// tests turn: wiring, per-channel gain, a stuck busy tag, a failing
/// record buffer.
pub struct DummyRoom {
    inner: Arc<Mutex<RoomState>>,
    playback_units: Vec<usize>,
    next_unit: usize,
}

impl DummyRoom {
    /// An empty room whose recordings arrive `delay_samples` after the
    /// trigger, matching whatever recording delay the caller computes.
    pub fn new(delay_samples: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RoomState {
                wiring: HashMap::new(),
                delay_samples,
                epoch: 0,
                emissions: HashMap::new(),
                stuck_busy: false,
                recorder_read_fails: false,
            })),
            playback_units: Vec::new(),
            next_unit: 0,
        }
    }

    /// A new playback unit in this room. The first call is the unit for
    /// [ProcessorRole::PlaybackA], the second for
    /// [ProcessorRole::PlaybackB].
    pub fn playback_unit(&mut self) -> DummyProcessor {
        let unit = self.next_unit;
        self.next_unit += 1;
        self.playback_units.push(unit);
        DummyProcessor::new(unit, DeviceKind::PlaybackUnit, false, Arc::clone(&self.inner))
    }

    /// The record unit for this room.
    pub fn recorder_unit(&mut self) -> DummyProcessor {
        let unit = self.next_unit;
        self.next_unit += 1;
        DummyProcessor::new(unit, DeviceKind::RecordUnit, true, Arc::clone(&self.inner))
    }

    /// A trigger bus that starts every unit in the room at once.
    pub fn trigger_bus(&self) -> DummyTriggerBus {
        DummyTriggerBus {
            room: Arc::clone(&self.inner),
        }
    }

    fn unit_for(&self, role: ProcessorRole) -> usize {
        let index = match role {
            ProcessorRole::PlaybackA => 0,
            ProcessorRole::PlaybackB => 1,
            ProcessorRole::Recorder => panic!("the recorder drives no speakers"),
        };
        self.playback_units[index]
    }

    /// Wires a speaker to a channel of a playback role at the given
    /// linear gain.
    pub fn wire(&mut self, role: ProcessorRole, channel: u16, gain: f64) {
        let unit = self.unit_for(role);
        self.inner
            .lock()
            .unwrap()
            .wiring
            .insert((unit, channel), gain);
    }

    /// Wires every speaker of a routing table at
    /// [DEFAULT_CHANNEL_GAIN].
    pub fn wire_table(&mut self, table: &crate::speaker_table::SpeakerTable) {
        for entry in table.entries() {
            self.wire(entry.role, entry.channel, DEFAULT_CHANNEL_GAIN);
        }
    }

    /// Overrides one channel's gain; 0.0 makes the speaker dead.
    pub fn set_gain(&mut self, role: ProcessorRole, channel: u16, gain: f64) {
        self.wire(role, channel, gain);
    }

    /// When set, every unit's busy tag stays up forever, which is how
    /// the timeout path gets exercised.
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.inner.lock().unwrap().stuck_busy = stuck;
    }

    /// When set, the record unit's buffer tag stops answering, as a
    /// dropped link would.
    pub fn fail_recorder_reads(&self, fail: bool) {
        self.inner.lock().unwrap().recorder_read_fails = fail;
    }
}

/// A simulated unit: local tag store plus a handle on the shared room.
pub struct DummyProcessor {
    unit: usize,
    kind: DeviceKind,
    is_recorder: bool,
    tags: HashMap<String, f64>,
    buffers: HashMap<String, Vec<f32>>,
    busy_left: usize,
    seen_epoch: u64,
    room: Arc<Mutex<RoomState>>,
}

impl DummyProcessor {
    fn new(unit: usize, kind: DeviceKind, is_recorder: bool, room: Arc<Mutex<RoomState>>) -> Self {
        Self {
            unit,
            kind,
            is_recorder,
            tags: HashMap::new(),
            buffers: HashMap::new(),
            busy_left: 0,
            seen_epoch: 0,
            room,
        }
    }

    fn knows_tag(&self, name: &str) -> bool {
        matches!(name, "playbuflen" | "chan" | "playback")
    }

    fn on_trigger(&mut self) {
        if !self.is_recorder {
            let channel = self.tags.get("chan").copied().unwrap_or(0.0) as u16;
            let samples = self.buffers.get("data").cloned().unwrap_or_default();
            self.room
                .lock()
                .unwrap()
                .emissions
                .insert(self.unit, (channel, samples));
        }
        self.busy_left = BUSY_POLLS;
    }

    fn catch_up_on_bus_triggers(&mut self) {
        let epoch = self.room.lock().unwrap().epoch;
        if epoch > self.seen_epoch {
            self.seen_epoch = epoch;
            self.on_trigger();
        }
    }
}

impl ProcessorDriver for DummyProcessor {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn connect(&mut self, _params: &ConnectionParams) -> bool {
        true
    }

    fn clear_circuit(&mut self) -> bool {
        self.tags.clear();
        self.buffers.clear();
        true
    }

    fn load_circuit(&mut self, _circuit: &Path) -> bool {
        true
    }

    fn run(&mut self) -> bool {
        true
    }

    fn halt(&mut self) -> bool {
        true
    }

    fn set_tag(&mut self, name: &str, value: f64) -> TagStatus {
        if !self.knows_tag(name) {
            return TagStatus::TagNotFound;
        }
        self.tags.insert(name.to_string(), value);
        TagStatus::Ok
    }

    fn write_buffer(&mut self, name: &str, data: &[f32]) -> TagStatus {
        if name != "data" {
            return TagStatus::TagNotFound;
        }
        self.buffers.insert(name.to_string(), data.to_vec());
        TagStatus::Ok
    }

    fn get_tag(&mut self, name: &str) -> Option<f64> {
        if name == "playback" {
            self.catch_up_on_bus_triggers();
            if self.room.lock().unwrap().stuck_busy {
                return Some(1.0);
            }
            if self.busy_left > 0 {
                self.busy_left -= 1;
                return Some(1.0);
            }
            return Some(0.0);
        }
        if !self.knows_tag(name) {
            return None;
        }
        self.tags.get(name).copied()
    }

    fn read_buffer(&mut self, name: &str, count: usize) -> Option<Vec<f32>> {
        if name != "data" {
            return None;
        }
        if !self.is_recorder {
            return self.buffers.get(name).map(|buffer| {
                let mut out = buffer.clone();
                out.resize(count, 0.0);
                out
            });
        }

        let state = self.room.lock().unwrap();
        if state.recorder_read_fails {
            return None;
        }

        let mut rng = thread_rng();
        let mut out: Vec<f32> = (0..count)
            .map(|_| rng.gen_range(-NOISE_AMPLITUDE..NOISE_AMPLITUDE) as f32)
            .collect();
        for (unit, (channel, samples)) in &state.emissions {
            let gain = state.wiring.get(&(*unit, *channel)).copied().unwrap_or(0.0);
            if gain == 0.0 {
                continue;
            }
            for (i, &sample) in samples.iter().enumerate() {
                let at = state.delay_samples + i;
                if at < count {
                    out[at] += sample * gain as f32;
                }
            }
        }
        Some(out)
    }

    fn soft_trigger(&mut self, _index: u32) -> bool {
        self.on_trigger();
        true
    }
}

/// A trigger bus that pulses every unit in its room.
pub struct DummyTriggerBus {
    room: Arc<Mutex<RoomState>>,
}

impl TriggerBusDriver for DummyTriggerBus {
    fn connect(&mut self, _interface: &str) -> bool {
        true
    }

    fn fire(&mut self, _kind: TriggerKind) -> bool {
        self.room.lock().unwrap().epoch += 1;
        true
    }
}
