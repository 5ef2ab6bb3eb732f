/*!
# Trialsheet

Data entry for multi-location agricultural field trials, built in Rust.

## Overview

An admin uploads an experiment layout for their location: seven fixed
columns (experiment id, location, year, season, replication, block,
treatment) followed by one column per observable trait. Field users then fill
in trait values treatment by treatment in a wide grid and submit; admins can
reopen, reset or remove treatments, disable traits, review history and
download the results.

## Architecture

### Storage Layer
- **Technologies**: SQLite through rusqlite
- **Components**:
  - Experiment Catalog - treatment rows and their Draft/Submitted status
  - Trait Registry - trait columns, with enable/disable
  - Observation Store - long-form values and the long/wide pivot

Every row is owned by a location; the store never returns or changes a row
outside the caller's location.

### Boundary Layer
- **Technologies**: axum, argon2, calamine, rust_xlsxwriter
- **Components**:
  - Login - locations, users, password hashing and sessions
  - Loader - CSV/XLSX uploads into treatments and trait names
  - Downloader - CSV/XLSX exports of a wide grid
  - App - JSON routes with role checks

### Persistence
- SQLite database file
- Per-location backups with Gzip compression and bincode serialization

## Roles

- **super_admin**: manages locations and users
- **admin**: manages the experiment of their own location
- **user**: enters and submits observations for their own location

## Modules

- **model**: shared value types (scope, status, traits, cells, actors)
- **error**: the crate error type
- **store**: connection owner and schema
- **catalog**, **registry**, **observations**: the three scoped components
- **loader**, **downloader**: tabular file import and export
- **login**: accounts and sessions
- **saving**: location snapshots
- **config**: server settings
- **app**: routing (feature `web`)

## REST API Endpoints

- `POST /login`, `POST /logout`, `GET /api/me`
- `GET|POST /api/locations`, `GET|POST /api/users`
- `POST /api/experiment/upload`
- `GET|POST /api/traits`, `POST /api/traits/:id/toggle`
- `GET|POST /api/treatments`, `POST /api/treatments/:id/toggle`,
  `POST /api/treatments/:id/reset`, `DELETE /api/treatments/:id`
- `POST /api/reopen`, `GET /api/history`, `GET /api/export`,
  `POST /api/danger/purge`
- `GET /api/entry/traits`, `GET|POST /api/entry`
*/

pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod loader;
pub mod login;
pub mod model;
pub mod observations;
pub mod registry;
pub mod saving;
pub mod store;

#[cfg(feature = "web")]
pub mod app;

pub use error::{EntryError, Result};
pub use store::Store;
