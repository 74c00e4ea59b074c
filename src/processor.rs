//! A single signal-processing unit: the driver seam that the hardware
//! vendor's transport hides behind, and the connection state machine
//! every unit moves through before it will accept tag traffic.
//!
//! A unit is brought up in a fixed order: connect over the rack link,
//! clear and load a circuit file, then start the circuit. Only a running
//! circuit answers tag reads and writes. A failed bring-up step leaves
//! the handle in a terminal failed state that must be re-initialized;
//! nothing here retries on its own.

use log::{debug, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Speed of sound used for travel-time compensation, in meters/second.
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Logical name of a processing unit's function in the rack. Every other
/// component refers to units by role, never by raw handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorRole {
    /// First playback-only unit
    PlaybackA,
    /// Second playback-only unit
    PlaybackB,
    /// The combined playback/record unit holding the microphone input
    Recorder,
}

impl ProcessorRole {
    /// The two playback roles, in routing order.
    pub const PLAYBACK: [ProcessorRole; 2] = [ProcessorRole::PlaybackA, ProcessorRole::PlaybackB];

    /// All roles in the rack.
    pub const ALL: [ProcessorRole; 3] = [
        ProcessorRole::PlaybackA,
        ProcessorRole::PlaybackB,
        ProcessorRole::Recorder,
    ];
}

impl fmt::Display for ProcessorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorRole::PlaybackA => write!(f, "playback-A"),
            ProcessorRole::PlaybackB => write!(f, "playback-B"),
            ProcessorRole::Recorder => write!(f, "recorder"),
        }
    }
}

/// Hardware family of a unit. The two families have different fixed
/// conversion latencies through their DA/AD pipelines, counted in whole
/// samples at the hardware rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Multi-channel playback unit
    PlaybackUnit,
    /// Two-channel unit with the microphone input
    RecordUnit,
}

impl DeviceKind {
    /// Digital-to-analog pipeline latency in samples.
    pub fn da_delay(&self) -> usize {
        match self {
            DeviceKind::PlaybackUnit => 24,
            DeviceKind::RecordUnit => 30,
        }
    }

    /// Analog-to-digital pipeline latency in samples.
    pub fn ad_delay(&self) -> usize {
        match self {
            DeviceKind::PlaybackUnit => 47,
            DeviceKind::RecordUnit => 65,
        }
    }
}

/// Samples between issuing playback and the played sound arriving in the
/// record buffer: acoustic travel time for the mic distance plus the
/// fixed conversion latencies of the devices involved. Purely additive,
/// whole samples.
pub fn recording_delay(
    distance: f64,
    samplerate: f64,
    play: Option<DeviceKind>,
    rec: Option<DeviceKind>,
) -> usize {
    let traveling = (distance / SPEED_OF_SOUND * samplerate) as usize;
    let da = play.map_or(0, |kind| kind.da_delay());
    let ad = rec.map_or(0, |kind| kind.ad_delay());
    traveling + da + ad
}

/// Connection lifecycle of a unit. Tag traffic and triggers are only
/// legal in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No link to the unit
    Unconnected,
    /// Link established, no circuit loaded
    Connected,
    /// Circuit loaded but not started
    CircuitLoaded,
    /// Circuit running, unit accepts tag traffic
    Running,
    /// A bring-up step failed; the handle must be re-initialized
    Failed,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessorState::Unconnected => "unconnected",
            ProcessorState::Connected => "connected",
            ProcessorState::CircuitLoaded => "circuit-loaded",
            ProcessorState::Running => "running",
            ProcessorState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a tag write. Tag absence is a routine condition in the
/// firmware (a circuit simply may not define the tag), so it is reported
/// as a value rather than an error; callers that require the tag to
/// exist check for it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum TagStatus {
    /// The tag exists and took the value
    Ok,
    /// The loaded circuit defines no tag with this name
    TagNotFound,
    /// The unit rejected the write outright
    DeviceError,
}

impl TagStatus {
    /// True when the write landed.
    pub fn is_ok(&self) -> bool {
        matches!(self, TagStatus::Ok)
    }
}

/// Transport parameters for connecting to a unit on the rack link.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Link interface name, e.g. `"GB"` for the gigabit interface
    pub interface: String,
    /// Position of the unit on the link
    pub index: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            interface: "GB".to_string(),
            index: 1,
        }
    }
}

/// The primitive contract a vendor transport has to satisfy. Boolean
/// returns mirror the firmware API: `false` means the operation was
/// rejected. The rest of the crate only ever talks to hardware through
/// this trait, so tests and the demo binary can substitute a simulated
/// unit.
pub trait ProcessorDriver {
    /// Hardware family of the unit behind this driver.
    fn kind(&self) -> DeviceKind;

    /// Establish the transport link.
    fn connect(&mut self, params: &ConnectionParams) -> bool;

    /// Clear any previously loaded circuit.
    fn clear_circuit(&mut self) -> bool;

    /// Load a circuit file onto the unit.
    fn load_circuit(&mut self, circuit: &Path) -> bool;

    /// Start the loaded circuit.
    fn run(&mut self) -> bool;

    /// Stop the circuit and drop the link.
    fn halt(&mut self) -> bool;

    /// Write a scalar tag.
    fn set_tag(&mut self, name: &str, value: f64) -> TagStatus;

    /// Write a sample buffer tag.
    fn write_buffer(&mut self, name: &str, data: &[f32]) -> TagStatus;

    /// Read a scalar tag; `None` when the circuit defines no such tag.
    fn get_tag(&mut self, name: &str) -> Option<f64>;

    /// Read `count` samples from a buffer tag; `None` when the circuit
    /// defines no such tag.
    fn read_buffer(&mut self, name: &str, count: usize) -> Option<Vec<f32>>;

    /// Fire the unit's software trigger input.
    fn soft_trigger(&mut self, index: u32) -> bool;
}

/// Errors raised by unit bring-up and primitive calls.
#[derive(Debug)]
pub enum DeviceError {
    /// The transport link could not be established.
    Connection(ProcessorRole),

    /// The circuit file could not be cleared or loaded.
    CircuitLoad {
        role: ProcessorRole,
        circuit: PathBuf,
    },

    /// The unit rejected the run command.
    Run(ProcessorRole),

    /// A primitive was called on a unit that is not running.
    InvalidState {
        role: ProcessorRole,
        state: ProcessorState,
    },

    /// A trigger primitive was used before its prerequisite was
    /// initialized, e.g. a bus trigger without a running trigger bus.
    Protocol(String),

    /// The idle-wait poll exceeded its bound.
    Timeout { tag: String, waited: Duration },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Connection(role) => write!(f, "failed to connect to {}", role),
            DeviceError::CircuitLoad { role, circuit } => {
                write!(f, "failed to load circuit {} onto {}", circuit.display(), role)
            }
            DeviceError::Run(role) => write!(f, "{} rejected the run command", role),
            DeviceError::InvalidState { role, state } => {
                write!(f, "{} is {}, not running", role, state)
            }
            DeviceError::Protocol(what) => write!(f, "protocol error: {}", what),
            DeviceError::Timeout { tag, waited } => {
                write!(f, "gave up waiting for tag {:?} after {:?}", tag, waited)
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// A connected, circuit-loaded unit under one rack role: the driver plus
/// its lifecycle state. Owned exclusively by the rack.
pub struct ProcessorHandle {
    role: ProcessorRole,
    driver: Box<dyn ProcessorDriver>,
    state: ProcessorState,
}

impl ProcessorHandle {
    /// Wraps a driver under a role, in the `Unconnected` state.
    pub fn new(role: ProcessorRole, driver: Box<dyn ProcessorDriver>) -> Self {
        Self {
            role,
            driver,
            state: ProcessorState::Unconnected,
        }
    }

    /// The role this handle serves.
    pub fn role(&self) -> ProcessorRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    /// Hardware family of the unit.
    pub fn kind(&self) -> DeviceKind {
        self.driver.kind()
    }

    /// Drives the unit from `Unconnected` all the way to `Running`:
    /// connect, clear + load the circuit, start it. Each failing step
    /// leaves the handle `Failed`.
    pub fn connect_and_load(
        &mut self,
        circuit: &Path,
        params: &ConnectionParams,
    ) -> Result<(), DeviceError> {
        if self.state != ProcessorState::Unconnected {
            return Err(DeviceError::InvalidState {
                role: self.role,
                state: self.state,
            });
        }

        if !self.driver.connect(params) {
            self.state = ProcessorState::Failed;
            return Err(DeviceError::Connection(self.role));
        }
        self.state = ProcessorState::Connected;
        debug!("{}: connected via {}", self.role, params.interface);

        if !self.driver.clear_circuit() || !self.driver.load_circuit(circuit) {
            self.state = ProcessorState::Failed;
            return Err(DeviceError::CircuitLoad {
                role: self.role,
                circuit: circuit.to_path_buf(),
            });
        }
        self.state = ProcessorState::CircuitLoaded;
        debug!("{}: circuit {} loaded", self.role, circuit.display());

        if !self.driver.run() {
            self.state = ProcessorState::Failed;
            return Err(DeviceError::Run(self.role));
        }
        self.state = ProcessorState::Running;
        debug!("{}: circuit running", self.role);
        Ok(())
    }

    /// Stops the circuit and drops back to `Unconnected`. Legal from any
    /// state; a rejected halt is logged, not raised, since the handle is
    /// being torn down either way.
    pub fn halt(&mut self) {
        if self.state == ProcessorState::Running && !self.driver.halt() {
            warn!("{}: halt rejected", self.role);
        }
        self.state = ProcessorState::Unconnected;
    }

    fn ensure_running(&self) -> Result<(), DeviceError> {
        if self.state != ProcessorState::Running {
            return Err(DeviceError::InvalidState {
                role: self.role,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Writes a scalar tag on a running unit.
    pub fn set_tag(&mut self, name: &str, value: f64) -> Result<TagStatus, DeviceError> {
        self.ensure_running()?;
        let status = self.driver.set_tag(name, value);
        if status == TagStatus::TagNotFound {
            debug!("{}: circuit has no tag {:?}", self.role, name);
        }
        Ok(status)
    }

    /// Writes a sample buffer tag on a running unit.
    pub fn write_buffer(&mut self, name: &str, data: &[f32]) -> Result<TagStatus, DeviceError> {
        self.ensure_running()?;
        let status = self.driver.write_buffer(name, data);
        if status == TagStatus::TagNotFound {
            debug!("{}: circuit has no buffer tag {:?}", self.role, name);
        }
        Ok(status)
    }

    /// Reads a scalar tag on a running unit; `Ok(None)` when the circuit
    /// defines no such tag.
    pub fn get_tag(&mut self, name: &str) -> Result<Option<f64>, DeviceError> {
        self.ensure_running()?;
        Ok(self.driver.get_tag(name))
    }

    /// Reads a sample buffer tag on a running unit; `Ok(None)` when the
    /// circuit defines no such tag.
    pub fn read_buffer(
        &mut self,
        name: &str,
        count: usize,
    ) -> Result<Option<Vec<f32>>, DeviceError> {
        self.ensure_running()?;
        Ok(self.driver.read_buffer(name, count))
    }

    /// Fires the unit's software trigger.
    pub fn soft_trigger(&mut self, index: u32) -> Result<(), DeviceError> {
        self.ensure_running()?;
        if !self.driver.soft_trigger(index) {
            return Err(DeviceError::Protocol(format!(
                "{} rejected software trigger {}",
                self.role, index
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted driver whose bring-up steps can be made to fail.
    struct ScriptedDriver {
        fail_connect: bool,
        fail_load: bool,
        fail_run: bool,
        last_tag: Option<(String, f64)>,
    }

    impl ScriptedDriver {
        fn ok() -> Self {
            Self {
                fail_connect: false,
                fail_load: false,
                fail_run: false,
                last_tag: None,
            }
        }
    }

    impl ProcessorDriver for ScriptedDriver {
        fn kind(&self) -> DeviceKind {
            DeviceKind::PlaybackUnit
        }
        fn connect(&mut self, _params: &ConnectionParams) -> bool {
            !self.fail_connect
        }
        fn clear_circuit(&mut self) -> bool {
            true
        }
        fn load_circuit(&mut self, _circuit: &Path) -> bool {
            !self.fail_load
        }
        fn run(&mut self) -> bool {
            !self.fail_run
        }
        fn halt(&mut self) -> bool {
            true
        }
        fn set_tag(&mut self, name: &str, value: f64) -> TagStatus {
            if name == "ghost" {
                return TagStatus::TagNotFound;
            }
            self.last_tag = Some((name.to_string(), value));
            TagStatus::Ok
        }
        fn write_buffer(&mut self, _name: &str, _data: &[f32]) -> TagStatus {
            TagStatus::Ok
        }
        fn get_tag(&mut self, name: &str) -> Option<f64> {
            self.last_tag
                .as_ref()
                .filter(|(tag, _)| tag == name)
                .map(|(_, value)| *value)
        }
        fn read_buffer(&mut self, _name: &str, count: usize) -> Option<Vec<f32>> {
            Some(vec![0.0; count])
        }
        fn soft_trigger(&mut self, _index: u32) -> bool {
            true
        }
    }

    fn circuit() -> PathBuf {
        PathBuf::from("play_buf.rcx")
    }

    #[test]
    fn bring_up_reaches_running() {
        let mut handle =
            ProcessorHandle::new(ProcessorRole::PlaybackA, Box::new(ScriptedDriver::ok()));
        assert_eq!(handle.state(), ProcessorState::Unconnected);

        handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap();
        assert_eq!(handle.state(), ProcessorState::Running);
    }

    #[test]
    fn failed_connect_is_terminal() {
        let mut driver = ScriptedDriver::ok();
        driver.fail_connect = true;
        let mut handle = ProcessorHandle::new(ProcessorRole::PlaybackA, Box::new(driver));

        let err = handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
        assert_eq!(handle.state(), ProcessorState::Failed);

        // a failed handle refuses a second bring-up attempt
        let err = handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidState { .. }));
    }

    #[test]
    fn failed_run_reports_run_error() {
        let mut driver = ScriptedDriver::ok();
        driver.fail_run = true;
        let mut handle = ProcessorHandle::new(ProcessorRole::PlaybackB, Box::new(driver));

        let err = handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap_err();
        assert!(matches!(err, DeviceError::Run(ProcessorRole::PlaybackB)));
        assert_eq!(handle.state(), ProcessorState::Failed);
    }

    #[test]
    fn primitives_require_running() {
        let mut handle =
            ProcessorHandle::new(ProcessorRole::Recorder, Box::new(ScriptedDriver::ok()));
        let err = handle.set_tag("chan", 1.0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidState {
                role: ProcessorRole::Recorder,
                state: ProcessorState::Unconnected,
            }
        ));
    }

    #[test]
    fn halt_returns_to_unconnected() {
        let mut handle =
            ProcessorHandle::new(ProcessorRole::PlaybackA, Box::new(ScriptedDriver::ok()));
        handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap();
        handle.halt();
        assert_eq!(handle.state(), ProcessorState::Unconnected);
    }

    #[test]
    fn missing_tag_is_reported_not_raised() {
        let mut handle =
            ProcessorHandle::new(ProcessorRole::PlaybackA, Box::new(ScriptedDriver::ok()));
        handle
            .connect_and_load(&circuit(), &ConnectionParams::default())
            .unwrap();

        let status = handle.set_tag("ghost", 1.0).unwrap();
        assert_eq!(status, TagStatus::TagNotFound);

        let status = handle.set_tag("chan", 5.0).unwrap();
        assert!(status.is_ok());
        assert_eq!(handle.get_tag("chan").unwrap(), Some(5.0));
    }

    #[test]
    fn recording_delay_is_additive_whole_samples() {
        // 1.6 m of travel at 48828.125 Hz is 227 whole samples; the
        // playback DA and record AD pipelines add 24 and 65.
        let delay = recording_delay(
            1.6,
            48828.125,
            Some(DeviceKind::PlaybackUnit),
            Some(DeviceKind::RecordUnit),
        );
        assert_eq!(delay, 227 + 24 + 65);

        assert_eq!(recording_delay(1.6, 48828.125, None, None), 227);
        assert_eq!(
            recording_delay(0.0, 48828.125, Some(DeviceKind::RecordUnit), None),
            30
        );
    }
}
