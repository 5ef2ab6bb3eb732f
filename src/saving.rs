//! Location backups: a whole location's experiment written to a gzip-compressed
//! bincode file and read back.

use bincode::{deserialize_from, serialize_into};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::info;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::catalog::TreatmentFilter;
use crate::error::{EntryError, Result};
use crate::model::{CellValue, DataType, EntryStatus, Scope, TreatmentFields};
use crate::observations::insert_observation;
use crate::store::{Store, purge_scope_rows};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTreatment {
    pub id: i64,
    pub fields: TreatmentFields,
    pub status: EntryStatus,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTrait {
    pub experiment_id: String,
    pub name: String,
    pub data_type: DataType,
    pub unit: String,
    pub active: bool,
}

/// Observation with its value split by kind; bincode cannot read untagged enums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedObservation {
    pub treatment_id: i64,
    pub trait_name: String,
    pub number: Option<f64>,
    pub text: Option<String>,
    pub recorded_by: String,
    pub recorded_at: String,
}

impl SavedObservation {
    fn value(&self) -> CellValue {
        match (self.number, &self.text) {
            (Some(n), _) => CellValue::Number(n),
            (None, Some(s)) => CellValue::Text(s.clone()),
            (None, None) => CellValue::Empty,
        }
    }
}

/// Everything one location owns at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub location_id: i64,
    pub taken_at: String,
    pub treatments: Vec<SavedTreatment>,
    pub traits: Vec<SavedTrait>,
    pub observations: Vec<SavedObservation>,
}

impl Store {
    pub fn snapshot(&self, scope: Scope) -> Result<ScopeSnapshot> {
        let treatments = self
            .catalog()
            .list_filtered(scope, TreatmentFilter::default())?
            .into_iter()
            .map(|t| SavedTreatment {
                id: t.id,
                fields: t.fields,
                status: t.status,
                active: t.active,
            })
            .collect();
        let traits = self
            .registry()
            .list(scope)?
            .into_iter()
            .map(|t| SavedTrait {
                experiment_id: t.experiment_id,
                name: t.name,
                data_type: t.data_type,
                unit: t.unit,
                active: t.active,
            })
            .collect();
        let observations = self
            .observations()
            .list(scope)?
            .into_iter()
            .map(|o| {
                let (number, text) = match o.value {
                    CellValue::Number(n) => (Some(n), None),
                    CellValue::Text(s) => (None, Some(s)),
                    CellValue::Empty => (None, None),
                };
                SavedObservation {
                    treatment_id: o.treatment_id,
                    trait_name: o.trait_name,
                    number,
                    text,
                    recorded_by: o.recorded_by,
                    recorded_at: o.recorded_at,
                }
            })
            .collect();

        Ok(ScopeSnapshot {
            location_id: scope.location_id,
            taken_at: Utc::now().to_rfc3339(),
            treatments,
            traits,
            observations,
        })
    }

    /// Replace everything `scope` owns with the contents of a snapshot.
    ///
    /// Treatments get fresh ids; observations follow their treatment. Either
    /// the whole snapshot lands or nothing changes.
    pub fn restore(&self, scope: Scope, snapshot: &ScopeSnapshot) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        purge_scope_rows(&tx, scope)?;

        let mut ids = HashMap::with_capacity(snapshot.treatments.len());
        for t in &snapshot.treatments {
            t.fields.validate()?;
            let f = &t.fields;
            tx.execute(
                "INSERT INTO treatments \
                 (location_id, exp_id, location, year, season, replication, block, treatment, entry_status, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    scope.location_id,
                    f.experiment_id,
                    f.location,
                    f.year,
                    f.season,
                    f.replication,
                    f.block,
                    f.treatment,
                    t.status.as_str(),
                    t.active
                ],
            )?;
            ids.insert(t.id, tx.last_insert_rowid());
        }

        for t in &snapshot.traits {
            tx.execute(
                "INSERT INTO traits (location_id, exp_id, trait_name, data_type, unit, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scope.location_id,
                    t.experiment_id,
                    t.name,
                    t.data_type.as_str(),
                    t.unit,
                    t.active
                ],
            )?;
        }

        for o in &snapshot.observations {
            let treatment_id = ids.get(&o.treatment_id).ok_or_else(|| {
                EntryError::Snapshot(format!(
                    "observation refers to unknown treatment {}",
                    o.treatment_id
                ))
            })?;
            insert_observation(
                &tx,
                scope,
                *treatment_id,
                &o.trait_name,
                &o.value(),
                &o.recorded_by,
                &o.recorded_at,
            )?;
        }

        tx.commit()?;
        info!(
            "restored snapshot of location {} taken {} into {}",
            snapshot.location_id, snapshot.taken_at, scope
        );
        Ok(())
    }
}

pub fn save_snapshot(snapshot: &ScopeSnapshot, path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut writer = BufWriter::new(encoder);

    serialize_into(&mut writer, snapshot)?;
    writer
        .into_inner()
        .map_err(|e| EntryError::Io(e.into_error()))?
        .finish()?
        .flush()?;

    Ok(())
}

pub fn load_snapshot(path: impl AsRef<Path>) -> Result<ScopeSnapshot> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut reader = BufReader::new(decoder);

    Ok(deserialize_from(&mut reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, Role};
    use crate::observations::CellEdit;

    fn fields(name: &str) -> TreatmentFields {
        TreatmentFields {
            experiment_id: "EXP1".into(),
            location: "Hisar".into(),
            year: "2024".into(),
            season: "Rabi".into(),
            replication: "1".into(),
            block: "1".into(),
            treatment: name.into(),
        }
    }

    fn seeded() -> (Store, Scope) {
        let store = Store::open_in_memory().unwrap();
        let scope = Scope::new(1);
        let t1 = store.catalog().add(scope, fields("T1")).unwrap();
        let t2 = store.catalog().add(scope, fields("T2")).unwrap();
        store.registry().define(scope, "Height", DataType::Number, "cm").unwrap();
        store.registry().define(scope, "Notes", DataType::Text, "").unwrap();
        let actor = Actor {
            username: "field1".into(),
            role: Role::User,
            location_id: Some(1),
        };
        store
            .observations()
            .save_wide(
                scope,
                &[
                    CellEdit::new(t1.id, "Height", 12.5),
                    CellEdit::new(t2.id, "Notes", "lodging"),
                ],
                &actor,
            )
            .unwrap();
        store.catalog().set_status(scope, t1.id, EntryStatus::Submitted).unwrap();
        store.catalog().set_active(scope, t2.id, false).unwrap();
        (store, scope)
    }

    #[test]
    fn snapshot_survives_a_file_round_trip() {
        let (store, scope) = seeded();
        let snapshot = store.snapshot(scope).unwrap();
        assert_eq!(snapshot.treatments.len(), 2);
        assert_eq!(snapshot.observations.len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loc1.bin.gz");
        save_snapshot(&snapshot, &path).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), snapshot);
    }

    #[test]
    fn restore_replaces_the_location_and_keeps_values() {
        let (store, scope) = seeded();
        let snapshot = store.snapshot(scope).unwrap();

        store.purge_scope(scope).unwrap();
        store.catalog().add(scope, fields("Stray")).unwrap();
        store.restore(scope, &snapshot).unwrap();

        let treatments = store.catalog().list(scope, None).unwrap();
        let names: Vec<_> = treatments.iter().map(|t| t.fields.treatment.as_str()).collect();
        assert_eq!(names, vec!["T1", "T2"]);
        assert_eq!(treatments[0].status, EntryStatus::Submitted);
        assert!(!treatments[1].active);

        let grid = store.observations().export_wide(scope, None).unwrap();
        assert_eq!(grid.value(treatments[0].id, "Height"), Some(&CellValue::Number(12.5)));
        assert_eq!(
            grid.value(treatments[1].id, "Notes"),
            Some(&CellValue::Text("lodging".into()))
        );
    }

    #[test]
    fn restore_into_another_location() {
        let (store, scope) = seeded();
        let snapshot = store.snapshot(scope).unwrap();
        let other = Scope::new(2);
        store.restore(other, &snapshot).unwrap();

        assert_eq!(store.catalog().list(other, None).unwrap().len(), 2);
        assert_eq!(store.catalog().list(scope, None).unwrap().len(), 2);
        assert!(store.observations().list(other).unwrap().iter().all(|o| o.scope == other));
    }

    #[test]
    fn dangling_observation_aborts_restore() {
        let (store, scope) = seeded();
        let mut snapshot = store.snapshot(scope).unwrap();
        snapshot.observations[0].treatment_id = 9999;

        assert!(matches!(
            store.restore(scope, &snapshot),
            Err(EntryError::Snapshot(_))
        ));
        assert_eq!(store.observations().list(scope).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_file_is_a_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin.gz");
        std::fs::write(&path, b"not gzip").unwrap();
        assert!(load_snapshot(&path).is_err());
    }
}
