//! Observation store and the long/wide pivot.
//!
//! Observations are kept long-form, one row per (treatment, trait name). The
//! entry form, the admin history view and the download all read a wide grid:
//! one row per treatment, one column per requested trait.

use chrono::Utc;
use log::{debug, info};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::catalog::{TreatmentFilter, list_treatments, set_scope_status};
use crate::error::{EntryError, Result};
use crate::model::{
    Actor, CellValue, DataType, EntryStatus, FIXED_COLUMNS, ObservationValue, Scope,
    TraitDefinition, TreatmentFields, TreatmentRecord,
};
use crate::registry::list_traits;
use crate::store::check_owner;

/// One edited cell of a submitted grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEdit {
    pub treatment_id: i64,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub value: CellValue,
}

impl CellEdit {
    pub fn new(treatment_id: i64, trait_name: &str, value: impl Into<CellValue>) -> Self {
        CellEdit {
            treatment_id,
            trait_name: trait_name.to_string(),
            value: value.into(),
        }
    }
}

/// Who is looking at the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridView {
    /// Entry form: active treatments, active traits only.
    Entry,
    /// Admin history: every treatment; disabled traits stay visible while
    /// they still hold values.
    History,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitColumn {
    pub name: String,
    pub data_type: DataType,
    pub unit: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRow {
    pub treatment_id: i64,
    pub fields: TreatmentFields,
    pub status: EntryStatus,
    pub active: bool,
    /// One value per entry of [`WideGrid::traits`].
    pub values: Vec<CellValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WideGrid {
    pub traits: Vec<TraitColumn>,
    pub rows: Vec<WideRow>,
}

impl WideGrid {
    /// Fixed column names followed by the trait names.
    pub fn headers(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.traits.iter().map(|t| t.name.clone()))
            .collect()
    }

    pub fn column(&self, trait_name: &str) -> Option<usize> {
        self.traits.iter().position(|t| t.name == trait_name)
    }

    pub fn row(&self, treatment_id: i64) -> Option<&WideRow> {
        self.rows.iter().find(|r| r.treatment_id == treatment_id)
    }

    pub fn value(&self, treatment_id: i64, trait_name: &str) -> Option<&CellValue> {
        let col = self.column(trait_name)?;
        self.row(treatment_id)?.values.get(col)
    }
}

/// How unrecorded cells are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    Defaults,
    Blank,
}

pub struct Observations<'a> {
    conn: &'a Connection,
}

impl<'a> Observations<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Observations { conn }
    }

    /// Entry-form grid for the requested traits.
    pub fn load_wide(
        &self,
        scope: Scope,
        traits: &[String],
        status: Option<EntryStatus>,
    ) -> Result<WideGrid> {
        self.load_wide_as(scope, traits, status, GridView::Entry)
    }

    /// Admin history grid for the requested traits.
    pub fn load_history(
        &self,
        scope: Scope,
        traits: &[String],
        status: Option<EntryStatus>,
    ) -> Result<WideGrid> {
        self.load_wide_as(scope, traits, status, GridView::History)
    }

    pub fn load_wide_as(
        &self,
        scope: Scope,
        traits: &[String],
        status: Option<EntryStatus>,
        view: GridView,
    ) -> Result<WideGrid> {
        let recorded = recorded_trait_names(self.conn, scope)?;
        let definitions: HashMap<String, TraitDefinition> = list_traits(self.conn, scope, false)?
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        for name in traits {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match (definitions.get(name), view) {
                (Some(def), _) if def.active => columns.push(column_of(def)),
                (Some(def), GridView::History) if recorded.contains(name) => {
                    columns.push(column_of(def))
                }
                (Some(_), _) => debug!("skipping disabled trait '{}'", name),
                (None, GridView::History) if recorded.contains(name) => columns.push(TraitColumn {
                    name: name.clone(),
                    data_type: DataType::Number,
                    unit: String::new(),
                    active: false,
                }),
                (None, _) => {
                    return Err(EntryError::Validation(format!(
                        "trait '{}' is not defined in {}",
                        name, scope
                    )));
                }
            }
        }

        let filter = TreatmentFilter {
            status,
            active_only: view == GridView::Entry,
        };
        let treatments = list_treatments(self.conn, scope, filter)?;
        let grid = pivot(self.conn, scope, columns, treatments, Fill::Defaults)?;
        debug!(
            "loaded {}x{} grid for {}",
            grid.rows.len(),
            grid.traits.len(),
            scope
        );
        Ok(grid)
    }

    /// Download grid: every active trait as a column, unrecorded cells blank.
    /// Disabled traits never appear, even when they hold values.
    pub fn export_wide(&self, scope: Scope, status: Option<EntryStatus>) -> Result<WideGrid> {
        let columns = list_traits(self.conn, scope, true)?
            .iter()
            .map(column_of)
            .collect();
        let treatments = list_treatments(
            self.conn,
            scope,
            TreatmentFilter {
                status,
                active_only: false,
            },
        )?;
        pivot(self.conn, scope, columns, treatments, Fill::Blank)
    }

    /// Upsert every edited cell in one transaction; returns cells written.
    pub fn save_wide(&self, scope: Scope, edits: &[CellEdit], actor: &Actor) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let written = write_edits(&tx, scope, edits, actor)?;
        tx.commit()?;
        info!("{} saved {} cells in {}", actor.username, written, scope);
        Ok(written)
    }

    /// Save the edits and submit the whole location in one transaction.
    pub fn submit_wide(&self, scope: Scope, edits: &[CellEdit], actor: &Actor) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let written = write_edits(&tx, scope, edits, actor)?;
        let flipped = set_scope_status(&tx, scope, EntryStatus::Submitted)?;
        tx.commit()?;
        info!(
            "{} submitted {} cells in {} ({} treatments now Submitted)",
            actor.username, written, scope, flipped
        );
        Ok(written)
    }

    /// Move every treatment of the location to `status`.
    ///
    /// Submitting is open to anyone in the location; going back to Draft is
    /// the admin reopen. Returns the number of treatments that changed.
    pub fn transition(&self, scope: Scope, status: EntryStatus, actor: &Actor) -> Result<usize> {
        ensure_scope(actor, scope)?;
        if status == EntryStatus::Draft {
            actor.require_admin()?;
        }
        let changed = set_scope_status(self.conn, scope, status)?;
        info!("{} moved {} treatments in {} to {}", actor.username, changed, scope, status);
        Ok(changed)
    }

    /// Admin override: reopen every Submitted treatment of the location.
    pub fn reopen(&self, scope: Scope, actor: &Actor) -> Result<usize> {
        self.transition(scope, EntryStatus::Draft, actor)
    }

    /// Long-form rows of a location, ordered by treatment then trait.
    pub fn list(&self, scope: Scope) -> Result<Vec<ObservationValue>> {
        let mut stmt = self.conn.prepare(
            "SELECT treatment_id, trait_name, value_num, value_text, recorded_by, recorded_at \
             FROM observations WHERE location_id = ?1 ORDER BY treatment_id, trait_name",
        )?;
        let rows = stmt.query_map(params![scope.location_id], |row| {
            Ok(ObservationValue {
                treatment_id: row.get(0)?,
                trait_name: row.get(1)?,
                value: decode(row.get(2)?, row.get(3)?),
                scope,
                recorded_by: row.get(4)?,
                recorded_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn ensure_scope(actor: &Actor, scope: Scope) -> Result<()> {
    if actor.scope()? != scope {
        return Err(EntryError::Scope(format!(
            "'{}' cannot act on {}",
            actor.username, scope
        )));
    }
    Ok(())
}

fn column_of(def: &TraitDefinition) -> TraitColumn {
    TraitColumn {
        name: def.name.clone(),
        data_type: def.data_type,
        unit: def.unit.clone(),
        active: def.active,
    }
}

fn decode(number: Option<f64>, text: Option<String>) -> CellValue {
    match (number, text) {
        (Some(n), _) => CellValue::Number(n),
        (None, Some(s)) => CellValue::Text(s),
        (None, None) => CellValue::Empty,
    }
}

fn recorded_trait_names(conn: &Connection, scope: Scope) -> Result<HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT trait_name FROM observations WHERE location_id = ?1")?;
    let names = stmt.query_map(params![scope.location_id], |row| row.get(0))?;
    Ok(names.collect::<std::result::Result<HashSet<String>, _>>()?)
}

/// Left-outer grouping join of treatments × columns against the long table.
fn pivot(
    conn: &Connection,
    scope: Scope,
    columns: Vec<TraitColumn>,
    treatments: Vec<TreatmentRecord>,
    fill: Fill,
) -> Result<WideGrid> {
    let wanted: HashSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut latest: HashMap<(i64, String), CellValue> = HashMap::new();

    if !wanted.is_empty() {
        let mut stmt = conn.prepare(
            "SELECT treatment_id, trait_name, value_num, value_text FROM observations \
             WHERE location_id = ?1 ORDER BY recorded_at, rowid",
        )?;
        let rows = stmt.query_map(params![scope.location_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                decode(row.get(2)?, row.get(3)?),
            ))
        })?;
        for row in rows {
            let (treatment_id, trait_name, value) = row?;
            if wanted.contains(trait_name.as_str()) {
                // Later rows win.
                latest.insert((treatment_id, trait_name), value);
            }
        }
    }

    let rows = treatments
        .into_iter()
        .map(|t| {
            let values = columns
                .iter()
                .map(|c| match latest.remove(&(t.id, c.name.clone())) {
                    Some(v) => v,
                    None if fill == Fill::Defaults => c.data_type.default_value(),
                    None => CellValue::Empty,
                })
                .collect();
            WideRow {
                treatment_id: t.id,
                fields: t.fields,
                status: t.status,
                active: t.active,
                values,
            }
        })
        .collect();

    Ok(WideGrid {
        traits: columns,
        rows,
    })
}

/// Validate the full edit set, then replace each cell. Nothing is written
/// unless every edit is acceptable.
fn write_edits(conn: &Connection, scope: Scope, edits: &[CellEdit], actor: &Actor) -> Result<usize> {
    ensure_scope(actor, scope)?;

    let treatments: HashMap<i64, TreatmentRecord> =
        list_treatments(conn, scope, TreatmentFilter::default())?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
    let traits: HashMap<String, TraitDefinition> = list_traits(conn, scope, false)?
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect();

    let mut cells: BTreeMap<(i64, String), CellValue> = BTreeMap::new();
    for edit in edits {
        let Some(treatment) = treatments.get(&edit.treatment_id) else {
            check_owner(conn, "treatments", edit.treatment_id, scope)?;
            return Err(EntryError::NotFound(format!("treatments {}", edit.treatment_id)));
        };
        if treatment.status == EntryStatus::Submitted {
            return Err(EntryError::State(format!(
                "treatment {} '{}' is Submitted; ask an admin to reopen it",
                treatment.id, treatment.fields.treatment
            )));
        }
        if !treatment.active {
            return Err(EntryError::Validation(format!(
                "treatment {} is disabled",
                treatment.id
            )));
        }
        let def = traits.get(&edit.trait_name).ok_or_else(|| {
            EntryError::Validation(format!("trait '{}' is not defined in {}", edit.trait_name, scope))
        })?;
        if !def.active {
            return Err(EntryError::Validation(format!(
                "trait '{}' is disabled",
                def.name
            )));
        }
        let value = def.data_type.coerce(edit.value.clone()).map_err(|e| {
            EntryError::Validation(format!(
                "treatment {}, trait '{}': {}",
                edit.treatment_id, edit.trait_name, e
            ))
        })?;
        cells.insert((edit.treatment_id, edit.trait_name.clone()), value);
    }

    let recorded_at = Utc::now().to_rfc3339();
    for ((treatment_id, trait_name), value) in &cells {
        conn.execute(
            "DELETE FROM observations WHERE treatment_id = ?1 AND trait_name = ?2",
            params![treatment_id, trait_name],
        )?;
        insert_observation(conn, scope, *treatment_id, trait_name, value, &actor.username, &recorded_at)?;
    }
    Ok(cells.len())
}

pub(crate) fn insert_observation(
    conn: &Connection,
    scope: Scope,
    treatment_id: i64,
    trait_name: &str,
    value: &CellValue,
    recorded_by: &str,
    recorded_at: &str,
) -> Result<()> {
    let (number, text) = match value {
        CellValue::Number(n) => (Some(*n), None),
        CellValue::Text(s) => (None, Some(s.as_str())),
        CellValue::Empty => (None, None),
    };
    conn.execute(
        "INSERT INTO observations \
         (treatment_id, trait_name, value_num, value_text, location_id, recorded_by, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![treatment_id, trait_name, number, text, scope.location_id, recorded_by, recorded_at],
    )?;
    Ok(())
}
