//! Loading and querying of the speaker-routing table, which binds each
//! physical loudspeaker in the array to the processor channel that drives
//! it. One table file exists per array [Geometry], as plain text with a
//! header line followed by one row per speaker:
//!
//! ```text
//! id,channel,role,azimuth,elevation,indicator
//! 1,1,A,-90.0,0.0,1
//! 2,2,A,-87.5,0.0,0
//! ```
//!
//! Where:
//!
//! - `id` is the speaker number, contiguous from 1
//! - `channel` is the electrical output channel on the owning processor
//! - `role` is `A` or `B`, the playback processor the channel belongs to
//! - `azimuth` and `elevation` are degrees, and may be left empty when
//!   the speaker's position has not been surveyed
//! - `indicator` is `1` if the speaker has an indicator LED fitted
//!
//! The table is read once when a geometry is selected and is immutable
//! afterwards; selecting a geometry again replaces the whole table.

use crate::processor::ProcessorRole;

use nom::{
    character::complete::{char, one_of, u16, u32},
    combinator::{map, opt},
    error::Error,
    number::complete::double,
    sequence::{preceded, tuple},
    Finish, IResult,
};

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Named physical arrangement of the speaker array. Selects which table
/// file and which calibration artifact belong to the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Geometry {
    /// Horizontal arc of speakers at ear height
    Arc,
    /// Hemispheric dome of speakers
    Dome,
}

impl Geometry {
    /// Path of the routing-table file for this geometry.
    pub fn table_file(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("speakertable_{}.txt", self))
    }

    /// Path of the active calibration artifact for this geometry.
    pub fn artifact_file(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("calibration_{}.ron", self))
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Geometry::Arc => write!(f, "arc"),
            Geometry::Dome => write!(f, "dome"),
        }
    }
}

/// One row of the routing table: a single physical speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEntry {
    /// Speaker number, contiguous from 1 across the whole array
    pub id: u32,
    /// Output channel on the owning processor
    pub channel: u16,
    /// The playback processor this speaker is wired to
    pub role: ProcessorRole,
    /// Azimuth in degrees, if surveyed
    pub azimuth: Option<f64>,
    /// Elevation in degrees, if surveyed
    pub elevation: Option<f64>,
    /// Whether the speaker has an indicator LED fitted
    pub has_indicator: bool,
}

fn parse_role(s: &str) -> IResult<&str, ProcessorRole> {
    map(one_of("AB"), |c| match c {
        'A' => ProcessorRole::PlaybackA,
        _ => ProcessorRole::PlaybackB,
    })(s)
}

fn parse_row(s: &str) -> IResult<&str, SpeakerEntry> {
    map(
        tuple((
            u32,
            preceded(char(','), u16),
            preceded(char(','), parse_role),
            preceded(char(','), opt(double)),
            preceded(char(','), opt(double)),
            preceded(char(','), one_of("01")),
        )),
        |(id, channel, role, azimuth, elevation, indicator)| SpeakerEntry {
            id,
            channel,
            role,
            azimuth,
            elevation,
            has_indicator: indicator == '1',
        },
    )(s)
}

impl FromStr for SpeakerEntry {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_row(s.trim()).finish() {
            Ok((_remaining, entry)) => Ok(entry),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

/// Things that can go wrong while loading a routing table.
#[derive(Debug)]
pub enum ConfigError {
    /// No table file exists for the requested geometry.
    MissingTable(PathBuf),

    /// The table file could not be read.
    Io(std::io::Error),

    /// A row did not match the table format.
    Row { line: usize, text: String },

    /// Two speakers claim the same (role, channel) pair, which would
    /// make them electrically indistinguishable.
    DuplicateRoute { role: ProcessorRole, channel: u16 },

    /// Two rows carry the same speaker id.
    DuplicateId(u32),

    /// Speaker ids must run contiguously from 1.
    NonContiguousId { expected: u32, found: u32 },

    /// The table file contains no rows.
    Empty(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingTable(path) => {
                write!(f, "no speaker table at {}", path.display())
            }
            ConfigError::Io(error) => write!(f, "io error reading speaker table: {}", error),
            ConfigError::Row { line, text } => {
                write!(f, "malformed table row on line {}: {:?}", line, text)
            }
            ConfigError::DuplicateRoute { role, channel } => {
                write!(f, "channel {} on processor {} is wired twice", channel, role)
            }
            ConfigError::DuplicateId(id) => write!(f, "speaker id {} appears twice", id),
            ConfigError::NonContiguousId { expected, found } => {
                write!(f, "speaker ids must be contiguous: expected {}, found {}", expected, found)
            }
            ConfigError::Empty(path) => {
                write!(f, "speaker table {} has no rows", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Returned by the lookup operations when no row matches.
#[derive(Debug, Clone, PartialEq)]
pub enum NotFoundError {
    /// No speaker with this id exists in the table.
    Id(u32),
    /// No speaker sits at exactly this direction.
    Direction { azimuth: f64, elevation: f64 },
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundError::Id(id) => write!(f, "no speaker with id {}", id),
            NotFoundError::Direction { azimuth, elevation } => {
                write!(f, "no speaker at azimuth {} elevation {}", azimuth, elevation)
            }
        }
    }
}

impl std::error::Error for NotFoundError {}

/// The loaded routing table for one geometry. Immutable after [load].
///
/// [load]: SpeakerTable::load
#[derive(Debug, Clone)]
pub struct SpeakerTable {
    geometry: Geometry,
    entries: Vec<SpeakerEntry>,
}

impl SpeakerTable {
    /// Reads and validates the routing table for `geometry` from
    /// `data_dir`. Rows are checked for the two invariants the rest of
    /// the system leans on: ids contiguous from 1, and no two speakers
    /// sharing a (role, channel) pair.
    pub fn load(geometry: Geometry, data_dir: &Path) -> Result<Self, ConfigError> {
        let path = geometry.table_file(data_dir);
        if !path.exists() {
            return Err(ConfigError::MissingTable(path));
        }
        let raw = fs::read_to_string(&path)?;

        let mut entries = Vec::new();
        // line numbers are 1-based and the header is line 1
        for (line, text) in raw.lines().enumerate().skip(1) {
            if text.trim().is_empty() {
                continue;
            }
            let entry = SpeakerEntry::from_str(text).map_err(|_| ConfigError::Row {
                line: line + 1,
                text: text.to_string(),
            })?;
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(ConfigError::Empty(path));
        }

        let mut ids = HashSet::new();
        let mut routes = HashSet::new();
        for entry in &entries {
            if !ids.insert(entry.id) {
                return Err(ConfigError::DuplicateId(entry.id));
            }
            if !routes.insert((entry.role, entry.channel)) {
                return Err(ConfigError::DuplicateRoute {
                    role: entry.role,
                    channel: entry.channel,
                });
            }
        }

        entries.sort_by_key(|e| e.id);
        for (i, entry) in entries.iter().enumerate() {
            let expected = i as u32 + 1;
            if entry.id != expected {
                return Err(ConfigError::NonContiguousId {
                    expected,
                    found: entry.id,
                });
            }
        }

        Ok(SpeakerTable { geometry, entries })
    }

    /// The geometry this table was loaded for.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of speakers in the array.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no speakers. Never true after a
    /// successful [load](SpeakerTable::load).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All rows, in ascending id order.
    pub fn entries(&self) -> impl Iterator<Item = &SpeakerEntry> {
        self.entries.iter()
    }

    /// The row for a speaker id, or [NotFoundError::Id].
    pub fn lookup_by_id(&self, id: u32) -> Result<&SpeakerEntry, NotFoundError> {
        if id == 0 || id as usize > self.entries.len() {
            return Err(NotFoundError::Id(id));
        }
        Ok(&self.entries[id as usize - 1])
    }

    /// The row whose surveyed position matches the given direction
    /// exactly, or [NotFoundError::Direction]. Rows without a surveyed
    /// position never match.
    pub fn lookup_by_direction(
        &self,
        azimuth: f64,
        elevation: f64,
    ) -> Result<&SpeakerEntry, NotFoundError> {
        self.entries
            .iter()
            .find(|e| e.azimuth == Some(azimuth) && e.elevation == Some(elevation))
            .ok_or(NotFoundError::Direction { azimuth, elevation })
    }

    /// Rows with an indicator LED fitted. Lazy and restartable.
    pub fn entries_with_indicator(&self) -> impl Iterator<Item = &SpeakerEntry> {
        self.entries.iter().filter(|e| e.has_indicator)
    }

    /// A channel index guaranteed to drive no speaker: one past the
    /// highest channel in the table. Routing a processor here silences
    /// it, which is how the calibration engine keeps every speaker but
    /// the one under test quiet.
    pub fn silent_channel(&self) -> u16 {
        self.entries.iter().map(|e| e.channel).max().unwrap_or(0) + 1
    }
}
