use trialsheet::loader::{ExperimentUpload, from_csv};
use trialsheet::model::{Actor, CellValue, EntryStatus, Role, Scope};
use trialsheet::observations::CellEdit;
use trialsheet::registry::TraitRef;
use trialsheet::{EntryError, Store};

const LAYOUT: &str = "\
exp_id,location,year,season,replication,block,treatment,Height,Yield
EXP1,Hisar,2024,Rabi,1,1,T1,,
EXP1,Hisar,2024,Rabi,1,2,T2,,
";

fn actor(role: Role, location_id: i64) -> Actor {
    Actor {
        username: format!("{}-{}", role, location_id),
        role,
        location_id: Some(location_id),
    }
}

fn setup() -> (Store, Scope, i64, i64) {
    let store = Store::open_in_memory().unwrap();
    let scope = Scope::new(1);
    let upload = ExperimentUpload::from_grid(&from_csv(LAYOUT.as_bytes()).unwrap()).unwrap();
    store.replace_experiment(scope, &upload).unwrap();
    let ids: Vec<i64> = store
        .catalog()
        .list(scope, None)
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    (store, scope, ids[0], ids[1])
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn empty_trait_selection_gives_one_row_per_active_treatment() {
    let (store, scope, _, t2) = setup();
    store.catalog().set_active(scope, t2, false).unwrap();

    let grid = store.observations().load_wide(scope, &[], None).unwrap();
    assert_eq!(grid.rows.len(), 1);
    assert!(grid.traits.is_empty());
    assert!(grid.rows[0].values.is_empty());
}

#[test]
fn saved_values_come_back_with_defaults_elsewhere() {
    let (store, scope, t1, t2) = setup();
    let user = actor(Role::User, 1);
    store
        .observations()
        .save_wide(
            scope,
            &[CellEdit::new(t1, "Height", 12.5), CellEdit::new(t1, "Yield", 3.0)],
            &user,
        )
        .unwrap();

    let grid = store
        .observations()
        .load_wide(scope, &names(&["Height", "Yield"]), None)
        .unwrap();
    assert_eq!(grid.value(t1, "Height"), Some(&CellValue::Number(12.5)));
    assert_eq!(grid.value(t1, "Yield"), Some(&CellValue::Number(3.0)));
    assert_eq!(grid.value(t2, "Height"), Some(&CellValue::Number(0.0)));
    assert_eq!(grid.value(t2, "Yield"), Some(&CellValue::Number(0.0)));

    // Saving again overwrites instead of duplicating.
    store
        .observations()
        .save_wide(scope, &[CellEdit::new(t1, "Height", 13.0)], &user)
        .unwrap();
    assert_eq!(store.observations().list(scope).unwrap().len(), 2);
}

#[test]
fn submitted_location_is_locked_until_reopened() {
    let (store, scope, t1, _) = setup();
    let user = actor(Role::User, 1);
    let admin = actor(Role::Admin, 1);

    store
        .observations()
        .transition(scope, EntryStatus::Submitted, &user)
        .unwrap();
    let edit = [CellEdit::new(t1, "Height", 1.0)];
    assert!(matches!(
        store.observations().save_wide(scope, &edit, &user),
        Err(EntryError::State(_))
    ));
    assert!(matches!(
        store.observations().reopen(scope, &user),
        Err(EntryError::Forbidden(_))
    ));

    assert_eq!(store.observations().reopen(scope, &admin).unwrap(), 2);
    store.observations().save_wide(scope, &edit, &user).unwrap();
}

#[test]
fn disabled_trait_leaves_entry_and_export_but_stays_in_history() {
    let (store, scope, t1, _) = setup();
    let user = actor(Role::User, 1);
    store
        .observations()
        .submit_wide(
            scope,
            &[CellEdit::new(t1, "Height", 12.5), CellEdit::new(t1, "Yield", 3.0)],
            &user,
        )
        .unwrap();
    store
        .registry()
        .set_active(scope, &TraitRef::from("Yield"), false)
        .unwrap();

    let entry = store
        .observations()
        .load_wide(scope, &names(&["Height", "Yield"]), None)
        .unwrap();
    assert_eq!(entry.column("Yield"), None);

    let export = store
        .observations()
        .export_wide(scope, Some(EntryStatus::Submitted))
        .unwrap();
    assert_eq!(export.column("Yield"), None);
    assert_eq!(export.value(t1, "Height"), Some(&CellValue::Number(12.5)));

    let history = store
        .observations()
        .load_history(scope, &names(&["Height", "Yield"]), None)
        .unwrap();
    assert_eq!(history.value(t1, "Yield"), Some(&CellValue::Number(3.0)));
}

#[test]
fn deleted_treatment_disappears_with_its_values() {
    let (store, scope, t1, t2) = setup();
    let user = actor(Role::User, 1);
    store
        .observations()
        .save_wide(
            scope,
            &[CellEdit::new(t1, "Height", 5.0), CellEdit::new(t2, "Height", 6.0)],
            &user,
        )
        .unwrap();

    store.catalog().remove(scope, t1).unwrap();

    let grid = store
        .observations()
        .load_history(scope, &names(&["Height"]), None)
        .unwrap();
    assert!(grid.row(t1).is_none());
    assert!(store
        .observations()
        .list(scope)
        .unwrap()
        .iter()
        .all(|o| o.treatment_id != t1));
}

#[test]
fn locations_never_see_each_other() {
    let (store, scope, t1, _) = setup();
    let other = Scope::new(2);
    let outsider = actor(Role::User, 2);

    assert!(store.observations().load_wide(other, &[], None).unwrap().rows.is_empty());
    assert!(matches!(
        store
            .observations()
            .save_wide(other, &[CellEdit::new(t1, "Height", 1.0)], &outsider),
        Err(EntryError::Scope(_))
    ));
    assert!(matches!(
        store
            .observations()
            .save_wide(scope, &[CellEdit::new(t1, "Height", 1.0)], &outsider),
        Err(EntryError::Scope(_))
    ));
    assert!(matches!(store.catalog().get(other, t1), Err(EntryError::Scope(_))));
}
