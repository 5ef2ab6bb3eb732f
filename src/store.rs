use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

use crate::catalog::{Catalog, replace_rows};
use crate::error::{EntryError, Result};
use crate::loader::ExperimentUpload;
use crate::model::{DataType, Scope};
use crate::observations::Observations;
use crate::registry::{Registry, define_all};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    location_id INTEGER REFERENCES locations(id)
);

CREATE TABLE IF NOT EXISTS treatments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id INTEGER NOT NULL,
    exp_id TEXT NOT NULL,
    location TEXT NOT NULL,
    year TEXT NOT NULL,
    season TEXT NOT NULL,
    replication TEXT NOT NULL,
    block TEXT NOT NULL,
    treatment TEXT NOT NULL,
    entry_status TEXT NOT NULL DEFAULT 'Draft',
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_treatments_location ON treatments(location_id);

CREATE TABLE IF NOT EXISTS traits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id INTEGER NOT NULL,
    exp_id TEXT NOT NULL,
    trait_name TEXT NOT NULL,
    data_type TEXT NOT NULL DEFAULT 'number',
    unit TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (location_id, trait_name)
);

CREATE TABLE IF NOT EXISTS observations (
    treatment_id INTEGER NOT NULL REFERENCES treatments(id) ON DELETE CASCADE,
    trait_name TEXT NOT NULL,
    value_num REAL,
    value_text TEXT,
    location_id INTEGER NOT NULL,
    recorded_by TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (treatment_id, trait_name)
);
CREATE INDEX IF NOT EXISTS idx_observations_location ON observations(location_id);
"#;

/// Owner of the SQLite connection; hands out the three scoped components.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening database {}", path.display());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("schema ready");
        Ok(Store { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(&self.conn)
    }

    pub fn registry(&self) -> Registry<'_> {
        Registry::new(&self.conn)
    }

    pub fn observations(&self) -> Observations<'_> {
        Observations::new(&self.conn)
    }

    /// Initialize or replace the experiment of a location from an upload.
    ///
    /// Observations, traits and treatments of the location are discarded and
    /// the upload's treatments and number traits inserted, all in one
    /// transaction.
    pub fn replace_experiment(&self, scope: Scope, upload: &ExperimentUpload) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        purge_scope_rows(&tx, scope)?;
        replace_rows(&tx, scope, &upload.treatments)?;
        define_all(
            &tx,
            scope,
            &upload.experiment_id,
            &upload.traits,
            DataType::Number,
            "",
        )?;
        tx.commit()?;
        info!(
            "experiment {} replaced for {}: {} treatments, {} traits",
            upload.experiment_id,
            scope,
            upload.treatments.len(),
            upload.traits.len()
        );
        Ok(())
    }

    /// Danger zone: drop every observation, trait and treatment of a location.
    pub fn purge_scope(&self, scope: Scope) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        purge_scope_rows(&tx, scope)?;
        tx.commit()?;
        warn!("deleted all experiment data for {}", scope);
        Ok(())
    }
}

/// Deletes every row owned by `scope`. Callers provide the transaction.
pub(crate) fn purge_scope_rows(conn: &Connection, scope: Scope) -> Result<()> {
    conn.execute(
        "DELETE FROM observations WHERE location_id = ?1",
        params![scope.location_id],
    )?;
    conn.execute(
        "DELETE FROM traits WHERE location_id = ?1",
        params![scope.location_id],
    )?;
    conn.execute(
        "DELETE FROM treatments WHERE location_id = ?1",
        params![scope.location_id],
    )?;
    Ok(())
}

/// Resolve whether a missing row is absent or belongs to another location.
pub(crate) fn check_owner(conn: &Connection, table: &str, id: i64, scope: Scope) -> Result<()> {
    let sql = match table {
        "treatments" => "SELECT location_id FROM treatments WHERE id = ?1",
        "traits" => "SELECT location_id FROM traits WHERE id = ?1",
        _ => return Err(EntryError::NotFound(format!("{} {}", table, id))),
    };
    let owner: Option<i64> = conn
        .query_row(sql, params![id], |row| row.get(0))
        .optional()?;

    match owner {
        None => Err(EntryError::NotFound(format!("{} {}", table, id))),
        Some(location_id) if location_id != scope.location_id => Err(EntryError::Scope(format!(
            "{} {} does not belong to {}",
            table, id, scope
        ))),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TreatmentFields;

    fn fields(name: &str) -> TreatmentFields {
        TreatmentFields {
            experiment_id: "EXP1".into(),
            location: "Farm".into(),
            year: "2024".into(),
            season: "Rabi".into(),
            replication: "1".into(),
            block: "1".into(),
            treatment: name.into(),
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.connection().execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn purge_only_touches_one_location() {
        let store = Store::open_in_memory().unwrap();
        let a = Scope::new(1);
        let b = Scope::new(2);
        store.catalog().add(a, fields("T1")).unwrap();
        store.catalog().add(b, fields("T2")).unwrap();
        store.registry().define(a, "Height", DataType::Number, "cm").unwrap();

        store.purge_scope(a).unwrap();

        assert!(store.catalog().list(a, None).unwrap().is_empty());
        assert!(store.registry().list(a).unwrap().is_empty());
        assert_eq!(store.catalog().list(b, None).unwrap().len(), 1);
    }

    #[test]
    fn replacing_an_experiment_swaps_structure_and_drops_values() {
        let store = Store::open_in_memory().unwrap();
        let scope = Scope::new(1);
        let first = ExperimentUpload {
            experiment_id: "EXP1".into(),
            treatments: vec![fields("T1"), fields("T2")],
            traits: vec!["Height".into(), "Yield".into()],
        };
        store.replace_experiment(scope, &first).unwrap();
        let t1 = store.catalog().list(scope, None).unwrap()[0].id;
        let actor = crate::model::Actor {
            username: "u".into(),
            role: crate::model::Role::User,
            location_id: Some(1),
        };
        store
            .observations()
            .save_wide(scope, &[crate::observations::CellEdit::new(t1, "Height", 1.0)], &actor)
            .unwrap();

        let second = ExperimentUpload {
            experiment_id: "EXP2".into(),
            treatments: vec![fields("T9")],
            traits: vec!["Height".into()],
        };
        store.replace_experiment(scope, &second).unwrap();

        let treatments = store.catalog().list(scope, None).unwrap();
        assert_eq!(treatments.len(), 1);
        assert_eq!(treatments[0].fields.treatment, "T9");
        let traits = store.registry().list(scope).unwrap();
        assert_eq!(traits.len(), 1);
        assert_eq!(traits[0].experiment_id, "EXP2");
        assert!(store.observations().list(scope).unwrap().is_empty());
    }

    #[test]
    fn failed_replacement_keeps_the_old_experiment() {
        let store = Store::open_in_memory().unwrap();
        let scope = Scope::new(1);
        store.catalog().add(scope, fields("T1")).unwrap();
        let bad = ExperimentUpload {
            experiment_id: "EXP2".into(),
            treatments: vec![fields("T2")],
            traits: vec!["Height".into(), "Height".into()],
        };
        assert!(matches!(
            store.replace_experiment(scope, &bad),
            Err(EntryError::Validation(_))
        ));
        assert_eq!(store.catalog().list(scope, None).unwrap()[0].fields.treatment, "T1");
    }

    #[test]
    fn owner_check_distinguishes_missing_and_foreign() {
        let store = Store::open_in_memory().unwrap();
        let t = store.catalog().add(Scope::new(1), fields("T1")).unwrap();

        assert!(check_owner(store.connection(), "treatments", t.id, Scope::new(1)).is_ok());
        assert!(matches!(
            check_owner(store.connection(), "treatments", t.id, Scope::new(2)),
            Err(EntryError::Scope(_))
        ));
        assert!(matches!(
            check_owner(store.connection(), "treatments", 999, Scope::new(1)),
            Err(EntryError::NotFound(_))
        ));
    }
}
