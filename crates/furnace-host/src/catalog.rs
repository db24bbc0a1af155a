//! Firing-Program Catalog
//!
//! Holds the built-in firing programs and the user-defined ones. User
//! programs are persisted as a single JSON document keyed by id and reloaded
//! at startup; entries that fail to parse or validate are skipped with a
//! warning so one corrupt program never bricks the furnace.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Highest setpoint the chamber is rated for, °C.
pub const MAX_TARGET_C: f64 = 1530.0;

/// One firing phase.
///
/// Serialized field names match the on-disk document: `temp` (°C), `time`,
/// `hold` and `ramp` (minutes), `vacuum` (kPa, ≤ 0 where negative means
/// vacuum at that magnitude and 0 means none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "temp")]
    pub target_temp: f64,
    #[serde(rename = "time")]
    pub duration_min: f64,
    #[serde(rename = "hold", default)]
    pub hold_min: f64,
    #[serde(rename = "ramp", default)]
    pub ramp_min: f64,
    #[serde(rename = "vacuum", default)]
    pub vacuum_kpa: f64,
}

impl Step {
    /// Total wall time of the step: ramp, then soak, then hold.
    pub fn total_seconds(&self) -> u64 {
        ((self.ramp_min + self.duration_min + self.hold_min) * 60.0).round() as u64
    }

    /// Whether this step fires under vacuum.
    pub fn wants_vacuum(&self) -> bool {
        self.vacuum_kpa < 0.0
    }

    /// Checks the step for physical plausibility.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            self.target_temp,
            self.duration_min,
            self.hold_min,
            self.ramp_min,
            self.vacuum_kpa,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err("all step fields must be finite numbers".into());
        }
        if self.target_temp <= 0.0 || self.target_temp > MAX_TARGET_C {
            return Err(format!(
                "target temperature must be within (0, {}] °C",
                MAX_TARGET_C
            ));
        }
        if self.duration_min < 0.0 || self.hold_min < 0.0 || self.ramp_min < 0.0 {
            return Err("step times must not be negative".into());
        }
        if self.vacuum_kpa > 0.0 {
            return Err("vacuum must be ≤ 0 kPa".into());
        }
        if self.total_seconds() == 0 {
            return Err("step must last longer than zero seconds".into());
        }
        Ok(())
    }
}

/// Where a program came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Builtin,
    User,
}

/// A firing program: an ordered, non-empty sequence of steps.
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub id: u32,
    pub name: String,
    pub steps: Vec<Step>,
    pub origin: Origin,
}

impl Program {
    /// Total wall time of the whole program in seconds.
    pub fn total_seconds(&self) -> u64 {
        self.steps.iter().map(Step::total_seconds).sum()
    }
}

/// Catalog operation failures.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("program {0} not found")]
    NotFound(u32),
    #[error("program {0} is built-in and cannot be deleted")]
    NotDeletable(u32),
    #[error("invalid program: {0}")]
    Invalid(String),
    #[error("failed to persist programs: {0}")]
    Persistence(String),
}

/// The on-disk shape of one user program.
#[derive(Debug, Serialize, Deserialize)]
struct StoredProgram {
    name: String,
    steps: Vec<Step>,
}

/// The built-in and user firing programs.
pub struct ProgramCatalog {
    builtin: BTreeMap<u32, Program>,
    user: BTreeMap<u32, Program>,
    store: Option<PathBuf>,
}

impl ProgramCatalog {
    /// Creates the catalog, loading user programs from `store` when given.
    pub fn load(store: Option<PathBuf>) -> Self {
        let mut catalog = Self {
            builtin: builtin_programs(),
            user: BTreeMap::new(),
            store,
        };
        if let Some(path) = catalog.store.clone() {
            if path.exists() {
                catalog.load_user_document(&path);
            }
        }
        catalog
    }

    fn load_user_document(&mut self, path: &Path) {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot read program store {:?}: {}", path, e);
                return;
            }
        };
        let document: BTreeMap<u32, serde_json::Value> = match serde_json::from_str(&text) {
            Ok(document) => document,
            Err(e) => {
                warn!("Program store {:?} is not valid JSON: {}", path, e);
                return;
            }
        };
        for (id, value) in document {
            match serde_json::from_value::<StoredProgram>(value) {
                Ok(stored) => match validate_program(&stored.name, &stored.steps) {
                    Ok(()) => {
                        self.user.insert(
                            id,
                            Program {
                                id,
                                name: stored.name,
                                steps: stored.steps,
                                origin: Origin::User,
                            },
                        );
                    }
                    Err(reason) => {
                        warn!("Skipping stored program {}: {}", id, reason);
                    }
                },
                Err(e) => {
                    warn!("Skipping unreadable stored program {}: {}", id, e);
                }
            }
        }
        info!("Loaded {} user program(s) from {:?}", self.user.len(), path);
    }

    /// All programs, built-in first, ordered by id.
    pub fn list(&self) -> Vec<Program> {
        self.builtin
            .values()
            .chain(self.user.values())
            .cloned()
            .collect()
    }

    /// Looks up a program by id.
    pub fn get(&self, id: u32) -> Option<&Program> {
        self.builtin.get(&id).or_else(|| self.user.get(&id))
    }

    /// Validates and stores a new user program, persisting the document.
    ///
    /// Returns the allocated id (one past the highest id in use).
    pub fn save_user(&mut self, name: &str, steps: Vec<Step>) -> Result<u32, CatalogError> {
        validate_program(name, &steps).map_err(CatalogError::Invalid)?;
        let id = self.next_id();
        self.user.insert(
            id,
            Program {
                id,
                name: name.trim().to_string(),
                steps,
                origin: Origin::User,
            },
        );
        self.persist()?;
        info!("Saved user program {} ({})", id, name.trim());
        Ok(id)
    }

    /// Deletes a user program. Built-in programs are refused.
    pub fn delete_user(&mut self, id: u32) -> Result<(), CatalogError> {
        if self.builtin.contains_key(&id) {
            return Err(CatalogError::NotDeletable(id));
        }
        if self.user.remove(&id).is_none() {
            return Err(CatalogError::NotFound(id));
        }
        self.persist()?;
        info!("Deleted user program {}", id);
        Ok(())
    }

    fn next_id(&self) -> u32 {
        let highest = self
            .builtin
            .keys()
            .chain(self.user.keys())
            .max()
            .copied()
            .unwrap_or(0);
        highest + 1
    }

    /// Rewrites the whole user-program document.
    fn persist(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let document: BTreeMap<u32, StoredProgram> = self
            .user
            .values()
            .map(|program| {
                (
                    program.id,
                    StoredProgram {
                        name: program.name.clone(),
                        steps: program.steps.clone(),
                    },
                )
            })
            .collect();
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| CatalogError::Persistence(e.to_string()))?;
        fs::write(path, json).map_err(|e| CatalogError::Persistence(e.to_string()))
    }
}

fn validate_program(name: &str, steps: &[Step]) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("program name must not be empty".into());
    }
    if steps.is_empty() {
        return Err("a program needs at least one step".into());
    }
    for (idx, step) in steps.iter().enumerate() {
        step.validate()
            .map_err(|reason| format!("step {}: {}", idx + 1, reason))?;
    }
    Ok(())
}

/// The factory firing programs shipped with the furnace.
pub fn builtin_programs() -> BTreeMap<u32, Program> {
    let step = |target_temp, duration_min, hold_min, ramp_min, vacuum_kpa| Step {
        target_temp,
        duration_min,
        hold_min,
        ramp_min,
        vacuum_kpa,
    };
    let program = |id, name: &str, steps| Program {
        id,
        name: name.to_string(),
        steps,
        origin: Origin::Builtin,
    };

    [
        program(
            1,
            "IPS e.max Crystallization",
            vec![step(850.0, 25.0, 5.0, 0.0, -70.0)],
        ),
        program(
            2,
            "Feldspathic Dentin",
            vec![
                step(450.0, 6.0, 0.0, 4.0, 0.0),
                step(930.0, 8.0, 1.0, 6.0, -70.0),
            ],
        ),
        program(
            3,
            "Oxidation Cycle",
            vec![
                step(650.0, 5.0, 0.0, 5.0, 0.0),
                step(1030.0, 10.0, 0.0, 8.0, 0.0),
            ],
        ),
        program(4, "Wash Bake", vec![step(950.0, 6.0, 1.0, 6.0, -70.0)]),
        program(5, "Glaze Fire", vec![step(770.0, 6.0, 1.0, 5.0, 0.0)]),
        program(
            6,
            "Stain & Characterize",
            vec![step(760.0, 5.0, 1.0, 5.0, 0.0)],
        ),
    ]
    .into_iter()
    .map(|program| (program.id, program))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_steps() -> Vec<Step> {
        vec![Step {
            target_temp: 700.0,
            duration_min: 10.0,
            hold_min: 2.0,
            ramp_min: 5.0,
            vacuum_kpa: 0.0,
        }]
    }

    #[test]
    fn id_allocation_is_max_plus_one() {
        let mut catalog = ProgramCatalog::load(None);
        // Six built-ins occupy 1..=6.
        let id = catalog.save_user("Test", simple_steps()).unwrap();
        assert_eq!(id, 7);
        let next = catalog.save_user("Test 2", simple_steps()).unwrap();
        assert_eq!(next, 8);
        // Deleting the highest frees its id for reuse.
        catalog.delete_user(8).unwrap();
        assert_eq!(catalog.save_user("Test 3", simple_steps()).unwrap(), 8);
    }

    #[test]
    fn builtin_programs_cannot_be_deleted() {
        let mut catalog = ProgramCatalog::load(None);
        assert!(matches!(
            catalog.delete_user(1),
            Err(CatalogError::NotDeletable(1))
        ));
    }

    #[test]
    fn deleting_a_missing_program_reports_not_found() {
        let mut catalog = ProgramCatalog::load(None);
        assert!(matches!(
            catalog.delete_user(99),
            Err(CatalogError::NotFound(99))
        ));
    }

    #[test]
    fn save_rejects_malformed_programs() {
        let mut catalog = ProgramCatalog::load(None);
        assert!(catalog.save_user("Empty", Vec::new()).is_err());
        assert!(catalog.save_user("", simple_steps()).is_err());

        let mut bad = simple_steps();
        bad[0].vacuum_kpa = 10.0;
        assert!(catalog.save_user("Positive vacuum", bad).is_err());

        let mut bad = simple_steps();
        bad[0].target_temp = 2000.0;
        assert!(catalog.save_user("Too hot", bad).is_err());
    }

    #[test]
    fn user_programs_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("programs.json");

        let saved_id = {
            let mut catalog = ProgramCatalog::load(Some(path.clone()));
            catalog.save_user("Overnight Bisque", simple_steps()).unwrap()
        };

        let reloaded = ProgramCatalog::load(Some(path));
        let program = reloaded.get(saved_id).expect("program survived restart");
        assert_eq!(program.name, "Overnight Bisque");
        assert_eq!(program.steps, simple_steps());
        assert_eq!(program.origin, Origin::User);
    }

    #[test]
    fn invalid_stored_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("programs.json");
        fs::write(
            &path,
            r#"{
                "7": {"name": "Good", "steps": [{"temp": 700.0, "time": 10.0}]},
                "8": {"name": "Bad", "steps": []},
                "9": {"name": "Mangled", "steps": "not a list"}
            }"#,
        )
        .unwrap();

        let catalog = ProgramCatalog::load(Some(path));
        assert!(catalog.get(7).is_some());
        assert!(catalog.get(8).is_none());
        assert!(catalog.get(9).is_none());
    }

    #[test]
    fn step_duration_converts_minutes_to_seconds() {
        let step = Step {
            target_temp: 850.0,
            duration_min: 25.0,
            hold_min: 5.0,
            ramp_min: 0.0,
            vacuum_kpa: -70.0,
        };
        assert_eq!(step.total_seconds(), 1800);
    }
}
