//! Persistence: the sequence document and the store that reads/writes it.
//!
//! A saved sequence is a flat, sectioned key-value document serialized as
//! JSON. Every value is a string; numbers go through `Display`/`FromStr`, so
//! `f64` durations round-trip exactly. The layout mirrors what the editing
//! surface shows:
//!
//! - `general`: `instructions`, `channels`, and one `channel{i}` label per
//!   output.
//! - `instruction{i}`: `note`, `channels` (bit string, most significant
//!   channel first), `opcode`, `operand`, `duration`, `unit`.
//! - `scanner`: `samples`, `repetitions`, `slots`.
//! - `slot{i}`: `instruction`, `start`, `start_unit`, `end`, `end_unit`.
//!
//! Decoding is strict: a missing section or key, an unparsable number, an
//! unknown opcode or unit name, or a stray section/key all fail with an error
//! naming the offending section and field. Value-level semantics (positive
//! durations, slot indices in range) are *not* checked here; that stays with
//! the compiler and the scan plan.
//!
//! [`SequenceStore`] adds the file policy: refuse to overwrite unless told
//! to, and mirror every save to a fixed shared path so the latest sequence is
//! always available to analysis machines.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::info;
use regex::Regex;

use crate::error::{Result, SequencerError};
use crate::instruction::{Instruction, Opcode, TimeUnit};
use crate::scan::{ScanSettings, SlotSettings};
use crate::table::InstructionTable;

/// Shared path that receives a copy of every save.
pub const DEFAULT_SHARED_EXPORT: &str = "shared/current_sequence.json";

type Section = IndexMap<String, String>;

/// In-memory form of a saved sequence: ordered sections of ordered
/// string-valued keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDocument {
    sections: IndexMap<String, Section>,
}

impl SequenceDocument {
    /// Captures a table and scan settings into document form.
    pub fn assemble(table: &InstructionTable, scan: &ScanSettings) -> Self {
        let mut sections = IndexMap::new();

        let mut general = Section::new();
        general.insert("instructions".into(), table.len().to_string());
        general.insert("channels".into(), table.channel_count().to_string());
        for ch in 0..table.channel_count() {
            general.insert(format!("channel{ch}"), table.channel_label(ch).to_string());
        }
        sections.insert("general".to_string(), general);

        for (i, instr) in table.iter().enumerate() {
            let mut sec = Section::new();
            sec.insert("note".into(), instr.note.clone());
            sec.insert(
                "channels".into(),
                format!(
                    "{:0width$b}",
                    instr.channel_mask,
                    width = table.channel_count()
                ),
            );
            sec.insert("opcode".into(), instr.opcode.name().to_string());
            sec.insert("operand".into(), instr.operand.to_string());
            sec.insert("duration".into(), instr.duration.to_string());
            sec.insert("unit".into(), instr.unit.name().to_string());
            sections.insert(format!("instruction{i}"), sec);
        }

        let mut scanner = Section::new();
        scanner.insert("samples".into(), scan.sample_count.to_string());
        scanner.insert("repetitions".into(), scan.repetition.to_string());
        scanner.insert("slots".into(), scan.slots.len().to_string());
        sections.insert("scanner".to_string(), scanner);

        for (i, slot) in scan.slots.iter().enumerate() {
            let mut sec = Section::new();
            sec.insert("instruction".into(), slot.instruction.to_string());
            sec.insert("start".into(), slot.start.to_string());
            sec.insert("start_unit".into(), slot.start_unit.name().to_string());
            sec.insert("end".into(), slot.end.to_string());
            sec.insert("end_unit".into(), slot.end_unit.name().to_string());
            sections.insert(format!("slot{i}"), sec);
        }

        Self { sections }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.sections)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let sections = serde_json::from_str(text)?;
        Ok(Self { sections })
    }

    /// Rebuilds the table and scan settings, validating the document format.
    pub fn decode(&self) -> Result<(InstructionTable, ScanSettings)> {
        let instr_re = Regex::new(r"^instruction(\d+)$").unwrap();
        let slot_re = Regex::new(r"^slot(\d+)$").unwrap();

        let general = self.section("general")?;
        let n_instr: usize = parse_field("general", general, "instructions")?;
        let n_chan: usize = parse_field("general", general, "channels")?;
        if !(1..=32).contains(&n_chan) {
            return Err(SequencerError::section_format(
                "general",
                "channels",
                format!("must be between 1 and 32 (got {n_chan})"),
            ));
        }
        for key in general.keys() {
            let known = key == "instructions"
                || key == "channels"
                || channel_label_index(key).map_or(false, |ch| ch < n_chan);
            if !known {
                return Err(SequencerError::section_format(
                    "general",
                    "keys",
                    format!("contain unrecognized entry `{key}`"),
                ));
            }
        }

        let mut table = InstructionTable::new(n_chan);
        for ch in 0..n_chan {
            if let Some(label) = general.get(&format!("channel{ch}")) {
                table.set_channel_label(ch, label.clone());
            }
        }

        for i in 0..n_instr {
            let name = format!("instruction{i}");
            let sec = self.section(&name)?;
            reject_unknown(
                &name,
                sec,
                &["note", "channels", "opcode", "operand", "duration", "unit"],
            )?;

            let bits = field(&name, sec, "channels")?;
            if bits.len() != n_chan || bits.bytes().any(|b| b != b'0' && b != b'1') {
                return Err(SequencerError::section_format(
                    &name,
                    "channels",
                    format!("must be a {n_chan}-bit binary string (got \"{bits}\")"),
                ));
            }
            let channel_mask = u32::from_str_radix(bits, 2).map_err(|_| {
                SequencerError::section_format(
                    &name,
                    "channels",
                    format!("must be a {n_chan}-bit binary string (got \"{bits}\")"),
                )
            })?;

            table.push(Instruction {
                note: field(&name, sec, "note")?.to_string(),
                channel_mask,
                opcode: named_field(&name, sec, "opcode", Opcode::from_name, "opcode")?,
                operand: parse_field(&name, sec, "operand")?,
                duration: parse_field(&name, sec, "duration")?,
                unit: named_field(&name, sec, "unit", TimeUnit::from_name, "time unit")?,
            });
        }

        let scanner = self.section("scanner")?;
        reject_unknown("scanner", scanner, &["samples", "repetitions", "slots"])?;
        let sample_count: usize = parse_field("scanner", scanner, "samples")?;
        let repetition: usize = parse_field("scanner", scanner, "repetitions")?;
        let n_slots: usize = parse_field("scanner", scanner, "slots")?;

        let mut slots = Vec::with_capacity(n_slots);
        for i in 0..n_slots {
            let name = format!("slot{i}");
            let sec = self.section(&name)?;
            reject_unknown(
                &name,
                sec,
                &["instruction", "start", "start_unit", "end", "end_unit"],
            )?;
            slots.push(SlotSettings {
                instruction: parse_field(&name, sec, "instruction")?,
                start: parse_field(&name, sec, "start")?,
                start_unit: named_field(&name, sec, "start_unit", TimeUnit::from_name, "time unit")?,
                end: parse_field(&name, sec, "end")?,
                end_unit: named_field(&name, sec, "end_unit", TimeUnit::from_name, "time unit")?,
            });
        }

        for name in self.sections.keys() {
            let known = name == "general"
                || name == "scanner"
                || section_index(&instr_re, name).map_or(false, |i| i < n_instr)
                || section_index(&slot_re, name).map_or(false, |i| i < n_slots);
            if !known {
                return Err(SequencerError::section_format(
                    name,
                    "header",
                    "is not a recognized section".to_string(),
                ));
            }
        }

        Ok((
            table,
            ScanSettings {
                sample_count,
                repetition,
                slots,
            },
        ))
    }

    fn section(&self, name: &str) -> Result<&Section> {
        self.sections.get(name).ok_or_else(|| {
            SequencerError::section_format(name, "header", "is missing".to_string())
        })
    }
}

fn field<'a>(section: &str, sec: &'a Section, key: &'static str) -> Result<&'a str> {
    sec.get(key)
        .map(String::as_str)
        .ok_or_else(|| SequencerError::section_format(section, key, "is missing".to_string()))
}

fn parse_field<T: std::str::FromStr>(section: &str, sec: &Section, key: &'static str) -> Result<T> {
    let raw = field(section, sec, key)?;
    raw.trim().parse().map_err(|_| {
        SequencerError::section_format(
            section,
            key,
            format!("cannot be parsed as a number (got \"{raw}\")"),
        )
    })
}

fn named_field<T>(
    section: &str,
    sec: &Section,
    key: &'static str,
    lookup: fn(&str) -> Option<T>,
    kind: &str,
) -> Result<T> {
    let raw = field(section, sec, key)?;
    lookup(raw).ok_or_else(|| {
        SequencerError::section_format(
            section,
            key,
            format!("is not a recognized {kind} (got \"{raw}\")"),
        )
    })
}

/// `channel{i}` keys in the `general` section.
fn channel_label_index(key: &str) -> Option<usize> {
    key.strip_prefix("channel").and_then(|s| s.parse().ok())
}

fn section_index(re: &Regex, name: &str) -> Option<usize> {
    re.captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn reject_unknown(section: &str, sec: &Section, allowed: &[&str]) -> Result<()> {
    for key in sec.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(SequencerError::section_format(
                section,
                "keys",
                format!("contain unrecognized entry `{key}`"),
            ));
        }
    }
    Ok(())
}

/// File-level save/load with overwrite protection and a shared mirror copy.
#[derive(Debug, Clone)]
pub struct SequenceStore {
    shared_export: PathBuf,
}

impl SequenceStore {
    pub fn new(shared_export: impl Into<PathBuf>) -> Self {
        Self {
            shared_export: shared_export.into(),
        }
    }

    pub fn shared_export(&self) -> &Path {
        &self.shared_export
    }

    /// Writes the sequence to `path`, and an identical copy to the shared
    /// export path.
    ///
    /// An existing `path` is only replaced when `overwrite` is set; the
    /// shared copy is always replaced. Parent directories are created as
    /// needed.
    pub fn save(
        &self,
        path: &Path,
        table: &InstructionTable,
        scan: &ScanSettings,
        overwrite: bool,
    ) -> Result<()> {
        if path.exists() && !overwrite {
            return Err(SequencerError::FileExists {
                path: path.to_path_buf(),
            });
        }

        let json = SequenceDocument::assemble(table, scan).to_json()?;
        write_with_dirs(path, &json)?;
        write_with_dirs(&self.shared_export, &json)?;
        info!(
            "sequence saved to {} ({} instructions, {} slots); shared copy at {}",
            path.display(),
            table.len(),
            scan.slots.len(),
            self.shared_export.display()
        );
        Ok(())
    }

    /// Reads and decodes the sequence at `path`.
    pub fn load(&self, path: &Path) -> Result<(InstructionTable, ScanSettings)> {
        if !path.exists() {
            return Err(SequencerError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path)?;
        let loaded = SequenceDocument::from_json(&text)?.decode()?;
        info!(
            "sequence loaded from {} ({} instructions, {} slots)",
            path.display(),
            loaded.0.len(),
            loaded.1.slots.len()
        );
        Ok(loaded)
    }
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARED_EXPORT)
    }
}

fn write_with_dirs(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, contents)?;
    Ok(())
}
