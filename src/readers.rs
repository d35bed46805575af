//! Raw-data reader seams.
//!
//! The acquisition formats themselves are external collaborators: the pipeline
//! consumes them through the [`SessionReaders`] trait so jobs stay testable with
//! synthetic data. `FsReaders` is the filesystem-backed implementation used by
//! the worker binary; it reads the staged interchange forms (a JSON block dump
//! and plain numeric CSV tables) that the acquisition hosts export.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::FlowError;
use crate::photometry::frame::Frame;
use crate::pipeline::Hemisphere;

/// One multiplexed optical channel as acquired: carrier-modulated samples at
/// the raw rate. The name encodes color and side, e.g. `grnR`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChannel {
    pub name: String,
    pub carrier_hz: f64,
    pub samples: Vec<f64>,
}

/// A raw photometry block: channels plus the two behavioral synchronization
/// pulse trains, all at `sample_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub sample_rate: f64,
    pub channels: Vec<RawChannel>,
    pub to_beh_sys: Vec<f64>,
    pub from_beh_sys: Vec<f64>,
}

pub trait SessionReaders: Send + Sync {
    /// Read the raw photometry block under a session's Photometry directory.
    /// `Ok(None)` means the directory holds no block in a known format.
    fn read_block(&self, dir: &Path) -> Result<Option<RawBlock>, FlowError>;

    /// Read a numeric table (header row of column names, f64 cells, empty cell
    /// = NaN). An unnamed first column is a row index and is skipped.
    fn read_table(&self, path: &Path) -> Result<Frame, FlowError>;
}

/// Filesystem readers for the staged interchange formats.
pub struct FsReaders;

impl SessionReaders for FsReaders {
    fn read_block(&self, dir: &Path) -> Result<Option<RawBlock>, FlowError> {
        let path = dir.join("block.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(FlowError::Io)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn read_table(&self, path: &Path) -> Result<Frame, FlowError> {
        if !path.exists() {
            return Err(FlowError::MissingInput(format!(
                "table not found: {}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).map_err(FlowError::Io)?;
        parse_table(&raw, path)
    }
}

fn parse_table(raw: &str, path: &Path) -> Result<Frame, FlowError> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| {
        FlowError::Validation(format!("empty table: {}", path.display()))
    })?;
    let names: Vec<&str> = header.split(',').map(|s| s.trim()).collect();
    let skip_first = names.first().map(|n| n.is_empty()).unwrap_or(false);
    let start = usize::from(skip_first);

    let mut cols: Vec<Vec<f64>> = vec![Vec::new(); names.len() - start];
    for (line_no, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if cells.len() != names.len() {
            return Err(FlowError::Validation(format!(
                "{}: row {} has {} cells, header has {}",
                path.display(),
                line_no + 2,
                cells.len(),
                names.len()
            )));
        }
        for (col, cell) in cols.iter_mut().zip(cells[start..].iter()) {
            let v = if cell.is_empty() {
                f64::NAN
            } else {
                cell.parse::<f64>().map_err(|_| {
                    FlowError::Validation(format!(
                        "{}: row {} has non-numeric cell '{}'",
                        path.display(),
                        line_no + 2,
                        cell
                    ))
                })?
            };
            col.push(v);
        }
    }

    let mut frame = Frame::new();
    for (name, col) in names[start..].iter().zip(cols) {
        frame.push_column(name, col)?;
    }
    Ok(frame)
}

/// Optional per-session metadata (`meta_info.toml` in the Photometry folder):
/// light source, virus injections, wavelengths, implantation notes. All lookups
/// are forgiving; absent metadata is normal.
#[derive(Debug, Clone)]
pub struct MetaInfo(toml::Value);

impl MetaInfo {
    pub fn empty() -> Self {
        MetaInfo(toml::Value::Table(Default::default()))
    }

    pub fn from_str(raw: &str) -> Result<Self, FlowError> {
        let value: toml::Value =
            toml::from_str(raw).map_err(|e: toml::de::Error| FlowError::Toml(e.to_string()))?;
        Ok(MetaInfo(value))
    }

    /// First `*.toml` in `dir`, if any.
    pub fn read_dir(dir: &Path) -> Result<Option<Self>, FlowError> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut toml_files: Vec<_> = fs::read_dir(dir)
            .map_err(FlowError::Io)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "toml").unwrap_or(false))
            .collect();
        toml_files.sort();
        match toml_files.first() {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(FlowError::Io)?;
                Ok(Some(Self::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn get_path(&self, path: &[&str]) -> Option<&toml::Value> {
        let mut cur = &self.0;
        for part in path {
            cur = cur.get(part)?;
        }
        Some(cur)
    }

    pub fn light_source(&self) -> String {
        self.get_path(&["Fiber", "light_source"])
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn fiber_notes(&self, side: Hemisphere) -> String {
        self.get_path(&["Fiber", "implantation", side.label(), "notes"])
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    pub fn sensor_protein(&self, side: Hemisphere) -> Option<String> {
        self.get_path(&["VirusInjection", side.label(), "sensor_protein"])
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn excitation_wavelength(&self, color: &str) -> Option<i64> {
        self.get_path(&["Fiber", "excitation_wavelength", color])
            .and_then(|v| v.as_integer())
    }

    pub fn emission_wavelength(&self, color: &str) -> Option<i64> {
        self.get_path(&["Fiber", "emission_wavelength", color])
            .and_then(|v| v.as_integer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_table_skips_index_column() {
        let raw = ",nTrial,ENL\n0,1,0\n1,1,1\n2,2,\n";
        let frame = parse_table(raw, &PathBuf::from("t.csv")).unwrap();
        assert_eq!(frame.names(), &["nTrial".to_string(), "ENL".to_string()]);
        assert_eq!(frame.column("nTrial").unwrap(), &[1.0, 1.0, 2.0]);
        assert!(frame.column("ENL").unwrap()[2].is_nan());
    }

    #[test]
    fn meta_info_lookup_chains() {
        let meta = MetaInfo::from_str(
            r#"
[Fiber]
light_source = "Plexon LED"
[Fiber.implantation.right]
notes = "AP -1.2"
[Fiber.excitation_wavelength]
green = 465
[VirusInjection.right]
sensor_protein = "GCaMP"
"#,
        )
        .unwrap();
        assert_eq!(meta.light_source(), "Plexon LED");
        assert_eq!(meta.fiber_notes(Hemisphere::Right), "AP -1.2");
        assert_eq!(meta.fiber_notes(Hemisphere::Left), "");
        assert_eq!(meta.excitation_wavelength("green"), Some(465));
        assert_eq!(meta.sensor_protein(Hemisphere::Right).as_deref(), Some("GCaMP"));
    }
}
