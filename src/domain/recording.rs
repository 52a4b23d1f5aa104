//! Offline recordings
//!
//! Parses two DOT CSV exports recorded in extended quaternion mode, joins them
//! on `SampleTimeFine` and writes the combined file with a joint angle per row.

use crate::domain::joint_angle::compute_joint_angle;
use crate::domain::models::{EulerAngles, Quaternion};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Only exports in this mode carry the quaternion columns.
pub const MEASUREMENT_MODE: &str = "Sensor fusion Mode - Extended (Quaternion)";

const DATA_COLUMNS: usize = 10;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Unexpected file name {0}. Expecting the format of SENSORADDR_DATE_TIME_MS.csv")]
    FileName(String),
    #[error("Same file selected for both recordings")]
    SameFile,
    #[error("Incompatible measurement mode '{0}', expected extended quaternion mode")]
    IncompatibleMode(String),
    #[error("Line {line}: cannot parse {field}")]
    InvalidRow { line: usize, field: &'static str },
    #[error("Line {line}: duplicate SampleTimeFine {sample_time_fine}")]
    DuplicateTimestamp { line: usize, sample_time_fine: u64 },
    #[error("No samples found")]
    NoSamples,
}

/// Header block of an export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingMetadata {
    pub device_tag: String,
    pub firmware_version: String,
    pub app_version: String,
    pub sync_status: String,
    pub output_rate: String,
    pub filter_profile: String,
    pub measurement_mode: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingSample {
    pub packet_count: u32,
    pub sample_time_fine: u64,
    pub quaternion: Quaternion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub metadata: RecordingMetadata,
    pub samples: Vec<RecordingSample>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, RecordingError> {
        check_file_name(path)?;
        Self::parse(BufReader::new(File::open(path)?))
    }

    /// Data rows start with an integer packet counter and have at least ten
    /// columns. `Key:,value` rows fill the metadata; anything else is skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, RecordingError> {
        let mut metadata = RecordingMetadata::default();
        let mut samples = Vec::new();
        let mut seen = HashMap::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let number = index + 1;
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();

            let packet_count = fields.first().and_then(|f| f.parse::<u32>().ok());
            match packet_count {
                Some(packet_count) if fields.len() >= DATA_COLUMNS => {
                    let sample = parse_sample(packet_count, &fields, number)?;
                    if seen.insert(sample.sample_time_fine, number).is_some() {
                        return Err(RecordingError::DuplicateTimestamp {
                            line: number,
                            sample_time_fine: sample.sample_time_fine,
                        });
                    }
                    samples.push(sample);
                }
                _ => apply_header(&mut metadata, &fields)?,
            }
        }

        if samples.is_empty() {
            return Err(RecordingError::NoSamples);
        }
        Ok(Self { metadata, samples })
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.samples.first().map(|s| s.sample_time_fine)
    }
}

fn parse_sample(
    packet_count: u32,
    fields: &[&str],
    line: usize,
) -> Result<RecordingSample, RecordingError> {
    let sample_time_fine = fields[1].parse::<u64>().map_err(|_| RecordingError::InvalidRow {
        line,
        field: "SampleTimeFine",
    })?;

    let mut q = [0.0f32; 4];
    for (slot, (value, field)) in q
        .iter_mut()
        .zip(fields[2..6].iter().zip(["Quat_W", "Quat_X", "Quat_Y", "Quat_Z"]))
    {
        *slot = value
            .parse::<f32>()
            .map_err(|_| RecordingError::InvalidRow { line, field })?;
    }

    Ok(RecordingSample {
        packet_count,
        sample_time_fine,
        quaternion: Quaternion::new(q[0], q[1], q[2], q[3]),
    })
}

fn apply_header(metadata: &mut RecordingMetadata, fields: &[&str]) -> Result<(), RecordingError> {
    let (Some(key), Some(value)) = (fields.first(), fields.get(1)) else {
        return Ok(());
    };
    let value = value.to_string();
    match *key {
        "DeviceTag:" => metadata.device_tag = value,
        "FirmwareVersion:" => metadata.firmware_version = value,
        "AppVersion:" => metadata.app_version = value,
        "SyncStatus:" => metadata.sync_status = value,
        "OutputRate:" => metadata.output_rate = value,
        "FilterProfile:" => metadata.filter_profile = value,
        "Measurement Mode:" => {
            if value != MEASUREMENT_MODE {
                return Err(RecordingError::IncompatibleMode(value));
            }
            metadata.measurement_mode = value;
        }
        "StartTime:" => metadata.start_time = value,
        _ => {}
    }
    Ok(())
}

/// Export file names look like `SENSORADDR_DATE_TIME_MS.csv`.
pub fn check_file_name(path: &Path) -> Result<(), RecordingError> {
    let stem = file_stem(path);
    if stem.split('_').count() != 4 {
        return Err(RecordingError::FileName(stem));
    }
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `PROCESSED_<addr1>_<addr2>_<date>_<time1>_<ms1>_<time2>_<ms2>.csv` next to
/// the first export when both come from the same directory and day, otherwise
/// `PROCESSED_<stem1>_<stem2>.csv` next to the first export.
pub fn processed_file_path(first: &Path, second: &Path) -> Result<PathBuf, RecordingError> {
    if first == second {
        return Err(RecordingError::SameFile);
    }
    check_file_name(first)?;
    check_file_name(second)?;

    let (stem1, stem2) = (file_stem(first), file_stem(second));
    let a: Vec<&str> = stem1.split('_').collect();
    let b: Vec<&str> = stem2.split('_').collect();
    let dir = first.parent().unwrap_or_else(|| Path::new(""));

    let name = if first.parent() == second.parent() && a[1] == b[1] {
        format!(
            "PROCESSED_{}_{}_{}_{}_{}_{}_{}.csv",
            a[0], b[0], a[1], a[2], a[3], b[2], b[3]
        )
    } else {
        format!("PROCESSED_{}_{}.csv", stem1, stem2)
    };
    Ok(dir.join(name))
}

/// One `SampleTimeFine` present in both recordings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinedRow {
    pub sample_time_fine: u64,
    pub first: RecordingSample,
    pub second: RecordingSample,
    pub angles: EulerAngles,
}

/// Inner join on `SampleTimeFine` in the first recording's order. The first
/// recording is the proximal segment.
pub fn join(first: &Recording, second: &Recording) -> Vec<JoinedRow> {
    let by_time: HashMap<u64, &RecordingSample> = second
        .samples
        .iter()
        .map(|s| (s.sample_time_fine, s))
        .collect();

    first
        .samples
        .iter()
        .filter_map(|a| {
            let b = by_time.get(&a.sample_time_fine)?;
            Some(JoinedRow {
                sample_time_fine: a.sample_time_fine,
                first: *a,
                second: **b,
                angles: compute_joint_angle(a.quaternion, b.quaternion),
            })
        })
        .collect()
}

/// Write the combined CSV: metadata block, column header, one line per row.
pub fn write_combined<W: Write>(
    out: &mut W,
    saved_at: &str,
    first: &RecordingMetadata,
    second: &RecordingMetadata,
    rows: &[JoinedRow],
) -> std::io::Result<()> {
    writeln!(out, "SaveDate:,{}", saved_at)?;
    writeln!(out, "DeviceTag,DOT1,DOT2")?;
    let pairs = [
        ("DeviceTag", &first.device_tag, &second.device_tag),
        ("FirmwareVersion", &first.firmware_version, &second.firmware_version),
        ("AppVersion", &first.app_version, &second.app_version),
        ("SyncStatus", &first.sync_status, &second.sync_status),
        ("OutputRate", &first.output_rate, &second.output_rate),
        ("FilterProfile", &first.filter_profile, &second.filter_profile),
        ("MeasurementMode", &first.measurement_mode, &second.measurement_mode),
        ("StartTime", &first.start_time, &second.start_time),
    ];
    for (key, a, b) in pairs {
        writeln!(out, "{},{},{}", key, a, b)?;
    }

    writeln!(
        out,
        "SampleTimeFine,\
        PacketCount1,Quat_W1,Quat_X1,Quat_Y1,Quat_Z1,\
        PacketCount2,Quat_W2,Quat_X2,Quat_Y2,Quat_Z2,\
        JointAngle_X,JointAngle_Y,JointAngle_Z"
    )?;

    for row in rows {
        let (q1, q2) = (row.first.quaternion, row.second.quaternion);
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            row.sample_time_fine,
            row.first.packet_count,
            q1.w,
            q1.x,
            q1.y,
            q1.z,
            row.second.packet_count,
            q2.w,
            q2.x,
            q2.y,
            q2.z,
            row.angles.x,
            row.angles.y,
            row.angles.z
        )?;
    }
    out.flush()
}

/// Counts reported after a file is processed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub output: PathBuf,
    pub first_samples: usize,
    pub second_samples: usize,
    pub joined_rows: usize,
    /// Absolute difference between the first timestamps of both recordings
    pub start_offset: u64,
}

/// Load both exports, join them and write the combined file to `output`
/// (or the derived processed path).
pub fn process(
    first: &Path,
    second: &Path,
    output: Option<&Path>,
    saved_at: &str,
) -> Result<ProcessSummary, RecordingError> {
    let derived = processed_file_path(first, second)?;
    let output = output.map(Path::to_path_buf).unwrap_or(derived);

    let a = Recording::load(first)?;
    let b = Recording::load(second)?;
    let rows = join(&a, &b);

    let mut out = BufWriter::new(File::create(&output)?);
    write_combined(&mut out, saved_at, &a.metadata, &b.metadata, &rows)?;

    let start_offset = match (a.first_timestamp(), b.first_timestamp()) {
        (Some(x), Some(y)) => x.abs_diff(y),
        _ => 0,
    };
    Ok(ProcessSummary {
        output,
        first_samples: a.samples.len(),
        second_samples: b.samples.len(),
        joined_rows: rows.len(),
        start_offset,
    })
}
