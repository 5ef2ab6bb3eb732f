//! Experiment catalog: the treatment rows (fixed columns A–G) of each location
//! and their Draft/Submitted lifecycle.

use log::{debug, info, warn};
use rusqlite::{Connection, Row, params};

use crate::error::{EntryError, Result};
use crate::model::{EntryStatus, Scope, TreatmentFields, TreatmentRecord};
use crate::store::check_owner;

const SELECT_TREATMENT: &str = "SELECT id, location_id, exp_id, location, year, season, \
     replication, block, treatment, entry_status, is_active FROM treatments";

/// Which treatments a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreatmentFilter {
    pub status: Option<EntryStatus>,
    pub active_only: bool,
}

impl TreatmentFilter {
    pub fn status(status: EntryStatus) -> Self {
        TreatmentFilter {
            status: Some(status),
            active_only: false,
        }
    }

    pub fn active() -> Self {
        TreatmentFilter {
            status: None,
            active_only: true,
        }
    }
}

pub struct Catalog<'a> {
    conn: &'a Connection,
}

impl<'a> Catalog<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Catalog { conn }
    }

    /// Discard every treatment (and its observations) of `scope`, then insert
    /// `rows` as Draft and active. Nothing changes if `rows` is empty or invalid.
    pub fn replace_all(&self, scope: Scope, rows: &[TreatmentFields]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = replace_rows(&tx, scope, rows)?;
        tx.commit()?;
        info!("replaced catalog of {} with {} treatments", scope, inserted);
        Ok(inserted)
    }

    pub fn add(&self, scope: Scope, fields: TreatmentFields) -> Result<TreatmentRecord> {
        fields.validate()?;
        let id = insert_row(self.conn, scope, &fields)?;
        info!("added treatment {} '{}' to {}", id, fields.treatment, scope);
        Ok(TreatmentRecord {
            id,
            scope,
            fields,
            status: EntryStatus::Draft,
            active: true,
        })
    }

    pub fn get(&self, scope: Scope, id: i64) -> Result<TreatmentRecord> {
        let sql = format!("{} WHERE id = ?1 AND location_id = ?2", SELECT_TREATMENT);
        match self
            .conn
            .query_row(&sql, params![id, scope.location_id], map_treatment)
        {
            Ok(record) => Ok(record),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                check_owner(self.conn, "treatments", id, scope)?;
                Err(EntryError::NotFound(format!("treatments {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_active(&self, scope: Scope, id: i64, active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE treatments SET is_active = ?1 WHERE id = ?2 AND location_id = ?3",
            params![active, id, scope.location_id],
        )?;
        if changed == 0 {
            check_owner(self.conn, "treatments", id, scope)?;
        }
        info!("treatment {} active={}", id, active);
        Ok(())
    }

    /// Flip the active flag and return the new value.
    pub fn toggle_active(&self, scope: Scope, id: i64) -> Result<bool> {
        let record = self.get(scope, id)?;
        self.set_active(scope, id, !record.active)?;
        Ok(!record.active)
    }

    pub fn set_status(&self, scope: Scope, id: i64, status: EntryStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE treatments SET entry_status = ?1 WHERE id = ?2 AND location_id = ?3",
            params![status.as_str(), id, scope.location_id],
        )?;
        if changed == 0 {
            check_owner(self.conn, "treatments", id, scope)?;
        }
        info!("treatment {} status={}", id, status);
        Ok(())
    }

    /// Set the status of every treatment in the location; returns rows changed.
    pub fn set_scope_status(&self, scope: Scope, status: EntryStatus) -> Result<usize> {
        set_scope_status(self.conn, scope, status)
    }

    /// Delete one treatment together with its observations.
    pub fn remove(&self, scope: Scope, id: i64) -> Result<()> {
        check_owner(self.conn, "treatments", id, scope)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM observations WHERE treatment_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM treatments WHERE id = ?1", params![id])?;
        tx.commit()?;
        warn!("deleted treatment {} from {}", id, scope);
        Ok(())
    }

    /// Drop a treatment's observations and put it back into Draft.
    pub fn reset(&self, scope: Scope, id: i64) -> Result<()> {
        check_owner(self.conn, "treatments", id, scope)?;
        let tx = self.conn.unchecked_transaction()?;
        let cleared = tx.execute(
            "DELETE FROM observations WHERE treatment_id = ?1",
            params![id],
        )?;
        tx.execute(
            "UPDATE treatments SET entry_status = ?1 WHERE id = ?2",
            params![EntryStatus::Draft.as_str(), id],
        )?;
        tx.commit()?;
        warn!("reset treatment {} ({} observations cleared)", id, cleared);
        Ok(())
    }

    /// Treatments of a location ordered by id.
    pub fn list(&self, scope: Scope, status: Option<EntryStatus>) -> Result<Vec<TreatmentRecord>> {
        self.list_filtered(
            scope,
            TreatmentFilter {
                status,
                active_only: false,
            },
        )
    }

    pub fn list_filtered(&self, scope: Scope, filter: TreatmentFilter) -> Result<Vec<TreatmentRecord>> {
        list_treatments(self.conn, scope, filter)
    }
}

pub(crate) fn replace_rows(conn: &Connection, scope: Scope, rows: &[TreatmentFields]) -> Result<usize> {
    if rows.is_empty() {
        return Err(EntryError::Validation(
            "an experiment needs at least one treatment row".into(),
        ));
    }
    for (idx, fields) in rows.iter().enumerate() {
        fields
            .validate()
            .map_err(|e| EntryError::Validation(format!("row {}: {}", idx + 1, e)))?;
    }

    conn.execute(
        "DELETE FROM observations WHERE location_id = ?1",
        params![scope.location_id],
    )?;
    conn.execute(
        "DELETE FROM treatments WHERE location_id = ?1",
        params![scope.location_id],
    )?;
    for fields in rows {
        insert_row(conn, scope, fields)?;
    }
    Ok(rows.len())
}

pub(crate) fn set_scope_status(conn: &Connection, scope: Scope, status: EntryStatus) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE treatments SET entry_status = ?1 WHERE location_id = ?2 AND entry_status <> ?1",
        params![status.as_str(), scope.location_id],
    )?;
    debug!("{} treatments in {} moved to {}", changed, scope, status);
    Ok(changed)
}

pub(crate) fn list_treatments(
    conn: &Connection,
    scope: Scope,
    filter: TreatmentFilter,
) -> Result<Vec<TreatmentRecord>> {
    let sql = format!(
        "{} WHERE location_id = ?1 \
         AND (?2 IS NULL OR entry_status = ?2) \
         AND (?3 = 0 OR is_active = 1) ORDER BY id",
        SELECT_TREATMENT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            scope.location_id,
            filter.status.map(|s| s.as_str()),
            filter.active_only
        ],
        map_treatment,
    )?;
    let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    debug!("listed {} treatments in {}", records.len(), scope);
    Ok(records)
}

fn insert_row(conn: &Connection, scope: Scope, fields: &TreatmentFields) -> Result<i64> {
    conn.execute(
        "INSERT INTO treatments \
         (location_id, exp_id, location, year, season, replication, block, treatment, entry_status, is_active) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
        params![
            scope.location_id,
            fields.experiment_id,
            fields.location,
            fields.year,
            fields.season,
            fields.replication,
            fields.block,
            fields.treatment,
            EntryStatus::Draft.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_treatment(row: &Row<'_>) -> rusqlite::Result<TreatmentRecord> {
    let status: String = row.get(9)?;
    Ok(TreatmentRecord {
        id: row.get(0)?,
        scope: Scope::new(row.get(1)?),
        fields: TreatmentFields {
            experiment_id: row.get(2)?,
            location: row.get(3)?,
            year: row.get(4)?,
            season: row.get(5)?,
            replication: row.get(6)?,
            block: row.get(7)?,
            treatment: row.get(8)?,
        },
        // Only the two literals are ever written.
        status: if status == EntryStatus::Submitted.as_str() {
            EntryStatus::Submitted
        } else {
            EntryStatus::Draft
        },
        active: row.get(10)?,
    })
}
