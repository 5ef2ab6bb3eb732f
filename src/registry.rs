//! Trait registry: the observable columns (H onwards) of each location.
//!
//! Traits are never hard-deleted here; disabling one hides it from the entry
//! form while its recorded values stay in the observation table.

use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;

use crate::error::{EntryError, Result};
use crate::model::{DataType, MANUAL_EXPERIMENT, Scope, TraitDefinition};
use crate::store::check_owner;

const SELECT_TRAIT: &str =
    "SELECT id, location_id, exp_id, trait_name, data_type, unit, is_active FROM traits";

/// Address a trait either by id or by its name within the location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraitRef {
    Id(i64),
    Name(String),
}

impl From<i64> for TraitRef {
    fn from(id: i64) -> Self {
        TraitRef::Id(id)
    }
}

impl From<&str> for TraitRef {
    fn from(name: &str) -> Self {
        TraitRef::Name(name.to_string())
    }
}

pub struct Registry<'a> {
    conn: &'a Connection,
}

impl<'a> Registry<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Registry { conn }
    }

    /// Define one active trait per name with a shared type and unit.
    ///
    /// The whole batch is rejected if any name is blank, repeated in `names`
    /// or already defined in the location.
    pub fn bulk_define(
        &self,
        scope: Scope,
        experiment_id: &str,
        names: &[String],
        data_type: DataType,
        unit: &str,
    ) -> Result<Vec<TraitDefinition>> {
        let tx = self.conn.unchecked_transaction()?;
        let defined = define_all(&tx, scope, experiment_id, names, data_type, unit)?;
        tx.commit()?;
        info!("defined {} traits in {}", defined.len(), scope);
        Ok(defined)
    }

    pub fn define(&self, scope: Scope, name: &str, data_type: DataType, unit: &str) -> Result<TraitDefinition> {
        let mut defined = self.bulk_define(
            scope,
            MANUAL_EXPERIMENT,
            &[name.to_string()],
            data_type,
            unit,
        )?;
        defined
            .pop()
            .ok_or_else(|| EntryError::Validation("no trait defined".into()))
    }

    pub fn set_active(&self, scope: Scope, target: &TraitRef, active: bool) -> Result<()> {
        let changed = match target {
            TraitRef::Id(id) => self.conn.execute(
                "UPDATE traits SET is_active = ?1 WHERE id = ?2 AND location_id = ?3",
                params![active, id, scope.location_id],
            )?,
            TraitRef::Name(name) => self.conn.execute(
                "UPDATE traits SET is_active = ?1 WHERE trait_name = ?2 AND location_id = ?3",
                params![active, name, scope.location_id],
            )?,
        };
        if changed == 0 {
            match target {
                TraitRef::Id(id) => check_owner(self.conn, "traits", *id, scope)?,
                TraitRef::Name(name) => {
                    return Err(EntryError::NotFound(format!("trait '{}' in {}", name, scope)));
                }
            }
        }
        info!("trait {:?} active={}", target, active);
        Ok(())
    }

    /// Flip the active flag and return the new value.
    pub fn toggle(&self, scope: Scope, target: &TraitRef) -> Result<bool> {
        let current = self.get(scope, target)?;
        self.set_active(scope, &TraitRef::Id(current.id), !current.active)?;
        Ok(!current.active)
    }

    pub fn get(&self, scope: Scope, target: &TraitRef) -> Result<TraitDefinition> {
        let found = match target {
            TraitRef::Id(id) => self
                .conn
                .query_row(
                    &format!("{} WHERE id = ?1 AND location_id = ?2", SELECT_TRAIT),
                    params![id, scope.location_id],
                    map_trait,
                )
                .optional()?,
            TraitRef::Name(name) => self
                .conn
                .query_row(
                    &format!("{} WHERE trait_name = ?1 AND location_id = ?2", SELECT_TRAIT),
                    params![name, scope.location_id],
                    map_trait,
                )
                .optional()?,
        };
        match (found, target) {
            (Some(def), _) => Ok(def),
            (None, TraitRef::Id(id)) => {
                check_owner(self.conn, "traits", *id, scope)?;
                Err(EntryError::NotFound(format!("traits {}", id)))
            }
            (None, TraitRef::Name(name)) => {
                Err(EntryError::NotFound(format!("trait '{}' in {}", name, scope)))
            }
        }
    }

    /// Every trait of the location, active or not, ordered by id.
    pub fn list(&self, scope: Scope) -> Result<Vec<TraitDefinition>> {
        list_traits(self.conn, scope, false)
    }

    /// Traits offered in the entry form's column picker.
    pub fn list_active(&self, scope: Scope) -> Result<Vec<TraitDefinition>> {
        list_traits(self.conn, scope, true)
    }
}

pub(crate) fn define_all(
    conn: &Connection,
    scope: Scope,
    experiment_id: &str,
    names: &[String],
    data_type: DataType,
    unit: &str,
) -> Result<Vec<TraitDefinition>> {
    let mut seen = HashSet::new();
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            return Err(EntryError::Validation("trait names cannot be blank".into()));
        }
        if !seen.insert(name.to_string()) {
            return Err(EntryError::Validation(format!("trait '{}' is listed twice", name)));
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM traits WHERE location_id = ?1 AND trait_name = ?2",
                params![scope.location_id, name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(EntryError::Validation(format!(
                "trait '{}' already exists in {}",
                name, scope
            )));
        }
    }

    let mut defined = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        conn.execute(
            "INSERT INTO traits (location_id, exp_id, trait_name, data_type, unit, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![scope.location_id, experiment_id, name, data_type.as_str(), unit],
        )?;
        defined.push(TraitDefinition {
            id: conn.last_insert_rowid(),
            scope,
            experiment_id: experiment_id.to_string(),
            name: name.to_string(),
            data_type,
            unit: unit.to_string(),
            active: true,
        });
    }
    Ok(defined)
}

pub(crate) fn list_traits(conn: &Connection, scope: Scope, active_only: bool) -> Result<Vec<TraitDefinition>> {
    let sql = format!(
        "{} WHERE location_id = ?1 AND (?2 = 0 OR is_active = 1) ORDER BY id",
        SELECT_TRAIT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![scope.location_id, active_only], map_trait)?;
    let traits = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    debug!("listed {} traits in {}", traits.len(), scope);
    Ok(traits)
}

fn map_trait(row: &Row<'_>) -> rusqlite::Result<TraitDefinition> {
    let data_type: String = row.get(4)?;
    Ok(TraitDefinition {
        id: row.get(0)?,
        scope: Scope::new(row.get(1)?),
        experiment_id: row.get(2)?,
        name: row.get(3)?,
        data_type: data_type.parse().unwrap_or(DataType::Number),
        unit: row.get(5)?,
        active: row.get(6)?,
    })
}
