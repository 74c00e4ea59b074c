//! The rack: the active set of processing units under their fixed roles,
//! plus the optional shared trigger bus, and the arm/trigger/wait
//! protocol every measurement runs through.
//!
//! The hardware offers no event or interrupt path. The only way to know
//! that playback and recording have finished is to poll a busy tag on
//! each unit until it reads 0, so the wait primitive here is a bounded
//! busy-poll, never an unbounded loop.

use crate::processor::{
    ConnectionParams, DeviceError, DeviceKind, ProcessorDriver, ProcessorHandle, ProcessorRole,
    ProcessorState, TagStatus,
};

use log::{debug, info};
use std::path::Path;
use std::time::{Duration, Instant};

/// Busy tag polled after a trigger; the circuits hold it at 1 while
/// playing or recording and drop it to 0 when done.
pub const BUSY_TAG: &str = "playback";

/// Trigger index wired to the start input of the playback and record
/// circuits.
const SOFT_TRIGGER_INDEX: u32 = 1;

/// The ways a measurement can be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Per-unit software trigger; needs a target role
    Software,
    /// Trigger-bus line A, starts all units at once
    BusA,
    /// Trigger-bus line B
    BusB,
}

/// Transport seam for the shared trigger bus, mirroring
/// [ProcessorDriver] for the one piece of rack hardware that is not a
/// processor. `fire` only ever receives the bus kinds.
pub trait TriggerBusDriver {
    /// Establish the link to the bus interface.
    fn connect(&mut self, interface: &str) -> bool;

    /// Pulse a bus trigger line.
    fn fire(&mut self, kind: TriggerKind) -> bool;
}

/// Poll cadence and bound for [Rack::wait_until_idle].
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep between reads of the busy tag
    pub interval: Duration,
    /// Give up after this long and report a timeout
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(10),
        }
    }
}

/// The active processing units under their fixed logical roles, plus the
/// optional trigger bus. Exclusive owner of every handle; all tag
/// traffic and triggering goes through here.
pub struct Rack {
    playback_a: ProcessorHandle,
    playback_b: ProcessorHandle,
    recorder: ProcessorHandle,
    trigger_bus: Option<TriggerBus>,
}

struct TriggerBus {
    driver: Box<dyn TriggerBusDriver>,
    running: bool,
}

impl Rack {
    /// Assembles a rack from one driver per role and an optional
    /// trigger-bus driver. All handles start unconnected; call
    /// [bring_up](Rack::bring_up) before any measurement.
    pub fn new(
        playback_a: Box<dyn ProcessorDriver>,
        playback_b: Box<dyn ProcessorDriver>,
        recorder: Box<dyn ProcessorDriver>,
        trigger_bus: Option<Box<dyn TriggerBusDriver>>,
    ) -> Self {
        Self {
            playback_a: ProcessorHandle::new(ProcessorRole::PlaybackA, playback_a),
            playback_b: ProcessorHandle::new(ProcessorRole::PlaybackB, playback_b),
            recorder: ProcessorHandle::new(ProcessorRole::Recorder, recorder),
            trigger_bus: trigger_bus.map(|driver| TriggerBus {
                driver,
                running: false,
            }),
        }
    }

    fn handle(&self, role: ProcessorRole) -> &ProcessorHandle {
        match role {
            ProcessorRole::PlaybackA => &self.playback_a,
            ProcessorRole::PlaybackB => &self.playback_b,
            ProcessorRole::Recorder => &self.recorder,
        }
    }

    fn handle_mut(&mut self, role: ProcessorRole) -> &mut ProcessorHandle {
        match role {
            ProcessorRole::PlaybackA => &mut self.playback_a,
            ProcessorRole::PlaybackB => &mut self.playback_b,
            ProcessorRole::Recorder => &mut self.recorder,
        }
    }

    /// Lifecycle state of one unit.
    pub fn state(&self, role: ProcessorRole) -> ProcessorState {
        self.handle(role).state()
    }

    /// Hardware family of one unit.
    pub fn kind(&self, role: ProcessorRole) -> DeviceKind {
        self.handle(role).kind()
    }

    /// Whether a trigger bus was fitted and initialized.
    pub fn trigger_bus_running(&self) -> bool {
        self.trigger_bus.as_ref().map_or(false, |bus| bus.running)
    }

    /// Brings one unit from `Unconnected` to `Running` with the given
    /// circuit file.
    pub fn connect_and_load(
        &mut self,
        role: ProcessorRole,
        circuit: &Path,
        params: &ConnectionParams,
    ) -> Result<(), DeviceError> {
        self.handle_mut(role).connect_and_load(circuit, params)
    }

    /// Initializes the trigger bus on the given interface. Required
    /// before any bus trigger is fired.
    pub fn init_trigger_bus(&mut self, interface: &str) -> Result<(), DeviceError> {
        let bus = self
            .trigger_bus
            .as_mut()
            .ok_or_else(|| DeviceError::Protocol("no trigger bus fitted".to_string()))?;
        if !bus.driver.connect(interface) {
            return Err(DeviceError::Protocol(
                "failed to connect trigger bus".to_string(),
            ));
        }
        bus.running = true;
        info!("trigger bus running on {}", interface);
        Ok(())
    }

    /// Full rack bring-up: the playback circuit onto both playback
    /// units, the record circuit onto the recorder, and the trigger bus
    /// if fitted. Unit indices on the link follow role order.
    pub fn bring_up(
        &mut self,
        playback_circuit: &Path,
        record_circuit: &Path,
        params: &ConnectionParams,
    ) -> Result<(), DeviceError> {
        for (index, role) in ProcessorRole::PLAYBACK.iter().enumerate() {
            let params = ConnectionParams {
                interface: params.interface.clone(),
                index: index as u32 + 1,
            };
            self.connect_and_load(*role, playback_circuit, &params)?;
        }
        let rec_params = ConnectionParams {
            interface: params.interface.clone(),
            index: 1,
        };
        self.connect_and_load(ProcessorRole::Recorder, record_circuit, &rec_params)?;
        if self.trigger_bus.is_some() {
            self.init_trigger_bus(&params.interface)?;
        }
        Ok(())
    }

    /// Halts every running unit. The bus needs no halt; it is stateless
    /// between pulses.
    pub fn halt_all(&mut self) {
        for role in ProcessorRole::ALL {
            if self.state(role) == ProcessorState::Running {
                info!("halting {}", role);
                self.handle_mut(role).halt();
            }
        }
        if let Some(bus) = self.trigger_bus.as_mut() {
            bus.running = false;
        }
    }

    /// Writes a scalar tag on one unit.
    pub fn write_tag(
        &mut self,
        role: ProcessorRole,
        name: &str,
        value: f64,
    ) -> Result<TagStatus, DeviceError> {
        self.handle_mut(role).set_tag(name, value)
    }

    /// Reads a scalar tag from one unit; `Ok(None)` when the circuit
    /// defines no such tag.
    pub fn read_tag(
        &mut self,
        role: ProcessorRole,
        name: &str,
    ) -> Result<Option<f64>, DeviceError> {
        self.handle_mut(role).get_tag(name)
    }

    /// Writes a sample buffer to one unit.
    pub fn write_buffer(
        &mut self,
        role: ProcessorRole,
        name: &str,
        data: &[f32],
    ) -> Result<TagStatus, DeviceError> {
        self.handle_mut(role).write_buffer(name, data)
    }

    /// Reads `count` samples of a buffer tag from one unit; `Ok(None)`
    /// when the circuit defines no such tag.
    pub fn read_buffer(
        &mut self,
        role: ProcessorRole,
        name: &str,
        count: usize,
    ) -> Result<Option<Vec<f32>>, DeviceError> {
        self.handle_mut(role).read_buffer(name, count)
    }

    /// Writes the same scalar tag on both playback units.
    pub fn write_tag_playback(&mut self, name: &str, value: f64) -> Result<TagStatus, DeviceError> {
        let mut status = TagStatus::Ok;
        for role in ProcessorRole::PLAYBACK {
            let s = self.write_tag(role, name, value)?;
            if !s.is_ok() {
                status = s;
            }
        }
        Ok(status)
    }

    /// Writes the same sample buffer on both playback units.
    pub fn write_buffer_playback(
        &mut self,
        name: &str,
        data: &[f32],
    ) -> Result<TagStatus, DeviceError> {
        let mut status = TagStatus::Ok;
        for role in ProcessorRole::PLAYBACK {
            let s = self.write_buffer(role, name, data)?;
            if !s.is_ok() {
                status = s;
            }
        }
        Ok(status)
    }

    /// Fires a trigger and returns immediately; pair with
    /// [wait_until_idle](Rack::wait_until_idle) to block until the
    /// units finish. Software triggers need a target role; bus triggers
    /// need the bus initialized.
    pub fn fire_trigger(
        &mut self,
        kind: TriggerKind,
        role: Option<ProcessorRole>,
    ) -> Result<(), DeviceError> {
        match kind {
            TriggerKind::Software => {
                let role = role.ok_or_else(|| {
                    DeviceError::Protocol("software trigger needs a target role".to_string())
                })?;
                self.handle_mut(role).soft_trigger(SOFT_TRIGGER_INDEX)?;
                debug!("software trigger sent to {}", role);
                Ok(())
            }
            TriggerKind::BusA | TriggerKind::BusB => {
                let bus = self
                    .trigger_bus
                    .as_mut()
                    .filter(|bus| bus.running)
                    .ok_or_else(|| {
                        DeviceError::Protocol("trigger bus is not initialized".to_string())
                    })?;
                if !bus.driver.fire(kind) {
                    return Err(DeviceError::Protocol("trigger bus rejected pulse".to_string()));
                }
                debug!("bus trigger {:?} sent", kind);
                Ok(())
            }
        }
    }

    /// Blocks until every listed unit reports 0 on `tag`, polling at
    /// `poll.interval` and giving up after `poll.timeout`. A unit whose
    /// circuit defines no such tag counts as idle, matching the
    /// firmware's treatment of absent tags.
    pub fn wait_until_idle(
        &mut self,
        roles: &[ProcessorRole],
        tag: &str,
        poll: &PollSettings,
    ) -> Result<(), DeviceError> {
        let started = Instant::now();
        loop {
            let mut busy = false;
            for role in roles {
                match self.read_tag(*role, tag)? {
                    Some(value) if value != 0.0 => {
                        busy = true;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        debug!("{}: no busy tag {:?}, counting as idle", role, tag);
                    }
                }
            }
            if !busy {
                return Ok(());
            }
            if started.elapsed() >= poll.timeout {
                return Err(DeviceError::Timeout {
                    tag: tag.to_string(),
                    waited: started.elapsed(),
                });
            }
            spin_sleep::sleep(poll.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Driver whose busy tag stays up for a fixed number of reads, or
    /// forever with `polls_until_idle = None`.
    struct BusyDriver {
        polls_until_idle: Option<usize>,
        reads: usize,
    }

    impl BusyDriver {
        fn idle_after(polls: usize) -> Self {
            Self {
                polls_until_idle: Some(polls),
                reads: 0,
            }
        }

        fn never_idle() -> Self {
            Self {
                polls_until_idle: None,
                reads: 0,
            }
        }
    }

    impl ProcessorDriver for BusyDriver {
        fn kind(&self) -> DeviceKind {
            DeviceKind::PlaybackUnit
        }
        fn connect(&mut self, _params: &ConnectionParams) -> bool {
            true
        }
        fn clear_circuit(&mut self) -> bool {
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
        fn set_tag(&mut self, _name: &str, _value: f64) -> TagStatus {
            TagStatus::Ok
        }
        fn write_buffer(&mut self, _name: &str, _data: &[f32]) -> TagStatus {
            TagStatus::Ok
        }
        fn get_tag(&mut self, name: &str) -> Option<f64> {
            if name != BUSY_TAG {
                return None;
            }
            self.reads += 1;
            match self.polls_until_idle {
                Some(n) if self.reads > n => Some(0.0),
                _ => Some(1.0),
            }
        }
        fn read_buffer(&mut self, _name: &str, count: usize) -> Option<Vec<f32>> {
            Some(vec![0.0; count])
        }
        fn soft_trigger(&mut self, _index: u32) -> bool {
            true
        }
    }

    struct AlwaysOkBus;

    impl TriggerBusDriver for AlwaysOkBus {
        fn connect(&mut self, _interface: &str) -> bool {
            true
        }
        fn fire(&mut self, _kind: TriggerKind) -> bool {
            true
        }
    }

    fn running_rack(
        a: BusyDriver,
        b: BusyDriver,
        rec: BusyDriver,
        bus: Option<Box<dyn TriggerBusDriver>>,
    ) -> Rack {
        let mut rack = Rack::new(Box::new(a), Box::new(b), Box::new(rec), bus);
        rack.bring_up(
            &PathBuf::from("play_buf.rcx"),
            &PathBuf::from("rec_buf.rcx"),
            &ConnectionParams::default(),
        )
        .unwrap();
        rack
    }

    #[test]
    fn software_trigger_requires_a_role() {
        let mut rack = running_rack(
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            None,
        );
        let err = rack.fire_trigger(TriggerKind::Software, None).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));

        rack.fire_trigger(TriggerKind::Software, Some(ProcessorRole::PlaybackA))
            .unwrap();
    }

    #[test]
    fn bus_trigger_requires_initialized_bus() {
        let mut rack = running_rack(
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            None,
        );
        let err = rack.fire_trigger(TriggerKind::BusA, None).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn bus_trigger_fires_when_running() {
        let mut rack = running_rack(
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            Some(Box::new(AlwaysOkBus)),
        );
        assert!(rack.trigger_bus_running());
        rack.fire_trigger(TriggerKind::BusA, None).unwrap();
        rack.fire_trigger(TriggerKind::BusB, None).unwrap();
    }

    #[test]
    fn wait_until_idle_returns_once_all_drop() {
        let mut rack = running_rack(
            BusyDriver::idle_after(3),
            BusyDriver::idle_after(1),
            BusyDriver::idle_after(0),
            None,
        );
        let poll = PollSettings {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        };
        rack.wait_until_idle(&ProcessorRole::ALL, BUSY_TAG, &poll)
            .unwrap();
    }

    #[test]
    fn wait_until_idle_times_out_within_bound() {
        let mut rack = running_rack(
            BusyDriver::never_idle(),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            None,
        );
        let poll = PollSettings {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        };
        let started = Instant::now();
        let err = rack
            .wait_until_idle(&ProcessorRole::ALL, BUSY_TAG, &poll)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
        // bounded: well under an order of magnitude past the timeout
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn missing_busy_tag_counts_as_idle() {
        let mut rack = running_rack(
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            None,
        );
        let poll = PollSettings::default();
        rack.wait_until_idle(&ProcessorRole::ALL, "no_such_tag", &poll)
            .unwrap();
    }

    #[test]
    fn playback_writes_reach_both_units() {
        let mut rack = running_rack(
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            BusyDriver::idle_after(0),
            None,
        );
        let status = rack.write_tag_playback("playbuflen", 2048.0).unwrap();
        assert!(status.is_ok());
        let status = rack
            .write_buffer_playback("data", &[0.0, 0.5, -0.5])
            .unwrap();
        assert!(status.is_ok());
    }
}
