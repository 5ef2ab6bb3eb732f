use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EntryError;

/// Names of the seven fixed treatment columns (A–G of an upload).
pub const FIXED_COLUMNS: [&str; 7] = [
    "exp_id",
    "location",
    "year",
    "season",
    "replication",
    "block",
    "treatment",
];

/// Trait experiment id used for traits added by hand instead of by upload.
pub const MANUAL_EXPERIMENT: &str = "MANUAL";

/// Location partition that every treatment, trait and observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub location_id: i64,
}

impl Scope {
    pub fn new(location_id: i64) -> Self {
        Scope { location_id }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "location {}", self.location_id)
    }
}

/// Lifecycle of a treatment's observation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Draft,
    Submitted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Draft => "Draft",
            EntryStatus::Submitted => "Submitted",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(EntryStatus::Draft),
            "submitted" => Ok(EntryStatus::Submitted),
            other => Err(EntryError::Validation(format!(
                "unknown entry status '{}'",
                other
            ))),
        }
    }
}

/// The seven descriptive fields shared by the upload, the catalog and every
/// wide grid row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentFields {
    pub experiment_id: String,
    pub location: String,
    pub year: String,
    pub season: String,
    pub replication: String,
    pub block: String,
    pub treatment: String,
}

impl TreatmentFields {
    /// Build the fields from the leading cells of a grid row.
    ///
    /// Fails when fewer than seven cells are present or when the experiment id
    /// or treatment name is blank.
    pub fn from_cells(cells: &[String]) -> Result<Self, EntryError> {
        if cells.len() < FIXED_COLUMNS.len() {
            return Err(EntryError::Validation(format!(
                "expected {} fixed fields, found {}",
                FIXED_COLUMNS.len(),
                cells.len()
            )));
        }

        let fields = TreatmentFields {
            experiment_id: cells[0].trim().to_string(),
            location: cells[1].trim().to_string(),
            year: cells[2].trim().to_string(),
            season: cells[3].trim().to_string(),
            replication: cells[4].trim().to_string(),
            block: cells[5].trim().to_string(),
            treatment: cells[6].trim().to_string(),
        };
        fields.validate()?;
        Ok(fields)
    }

    pub fn validate(&self) -> Result<(), EntryError> {
        if self.experiment_id.is_empty() {
            return Err(EntryError::Validation("experiment id is required".into()));
        }
        if self.treatment.is_empty() {
            return Err(EntryError::Validation("treatment name is required".into()));
        }
        Ok(())
    }

    /// Fixed fields in column order.
    pub fn as_cells(&self) -> [&str; 7] {
        [
            &self.experiment_id,
            &self.location,
            &self.year,
            &self.season,
            &self.replication,
            &self.block,
            &self.treatment,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentRecord {
    pub id: i64,
    pub scope: Scope,
    pub fields: TreatmentFields,
    pub status: EntryStatus,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    Text,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Number => "number",
            DataType::Text => "text",
        }
    }

    /// Value shown for a cell that has never been recorded.
    pub fn default_value(&self) -> CellValue {
        match self {
            DataType::Number => CellValue::Number(0.0),
            DataType::Text => CellValue::Text(String::new()),
        }
    }

    /// Coerce an incoming cell to this type.
    pub fn coerce(&self, value: CellValue) -> Result<CellValue, EntryError> {
        match (self, value) {
            (DataType::Number, CellValue::Number(n)) if n.is_finite() => Ok(CellValue::Number(n)),
            (DataType::Number, CellValue::Number(n)) => Err(EntryError::Validation(format!(
                "{} is not a finite number",
                n
            ))),
            (DataType::Number, CellValue::Text(s)) => match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(CellValue::Number(n)),
                _ => Err(EntryError::Validation(format!(
                    "'{}' is not a number",
                    s
                ))),
            },
            (DataType::Number, CellValue::Empty) => Ok(CellValue::Number(0.0)),
            (DataType::Text, CellValue::Text(s)) => Ok(CellValue::Text(s)),
            (DataType::Text, CellValue::Number(n)) => Ok(CellValue::Text(n.to_string())),
            (DataType::Text, CellValue::Empty) => Ok(CellValue::Text(String::new())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" => Ok(DataType::Number),
            "text" => Ok(DataType::Text),
            other => Err(EntryError::Validation(format!(
                "unknown data type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitDefinition {
    pub id: i64,
    pub scope: Scope,
    pub experiment_id: String,
    pub name: String,
    pub data_type: DataType,
    pub unit: String,
    pub active: bool,
}

/// One cell of a wide grid.
///
/// `Empty` only appears in exports, where unrecorded cells stay blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Empty => Ok(()),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

/// Long-form observation row keyed by (treatment, trait name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationValue {
    pub treatment_id: i64,
    pub trait_name: String,
    pub value: CellValue,
    pub scope: Scope,
    pub recorded_by: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "super_admin" => Ok(Role::SuperAdmin),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(EntryError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// Authenticated caller, as supplied by the login boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub role: Role,
    pub location_id: Option<i64>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin | Role::SuperAdmin)
    }

    /// Scope this actor operates in.
    pub fn scope(&self) -> Result<Scope, EntryError> {
        self.location_id.map(Scope::new).ok_or_else(|| {
            EntryError::Scope(format!("user '{}' has no location assigned", self.username))
        })
    }

    pub fn require_admin(&self) -> Result<(), EntryError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EntryError::Forbidden(format!(
                "'{}' requires the admin role",
                self.username
            )))
        }
    }

    pub fn require_super_admin(&self) -> Result<(), EntryError> {
        if self.role == Role::SuperAdmin {
            Ok(())
        } else {
            Err(EntryError::Forbidden(format!(
                "'{}' requires the super_admin role",
                self.username
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
}

/// User row without the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub location_id: Option<i64>,
    pub location: Option<String>,
}
