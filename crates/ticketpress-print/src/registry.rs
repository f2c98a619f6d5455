// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer registry: CRUD over printer profiles, persisted in SQLite.
//
// Profiles are soft-deactivated rather than deleted so that stored jobs keep
// pointing at something meaningful. At most one profile carries the default
// flag; changing it happens in a single transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, instrument};

use ticketpress_core::config::PrinterConfig;
use ticketpress_core::error::{RegistryError, Result, TicketpressError};
use ticketpress_core::types::{Capabilities, ConnectionParams, PrintSettings, PrinterProfile, ProfileId};

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS printers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        connection TEXT NOT NULL,
        capabilities TEXT NOT NULL,
        settings TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        is_default INTEGER NOT NULL DEFAULT 0,
        auto_reconnect INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

const SELECT_COLUMNS: &str = "SELECT id, name, connection, capabilities, settings, active,
        is_default, auto_reconnect, created_at, updated_at
     FROM printers";

fn db_err(what: &str) -> impl FnOnce(rusqlite::Error) -> TicketpressError + '_ {
    move |e| TicketpressError::Database(format!("{what}: {e}"))
}

pub struct PrinterRegistry {
    conn: Connection,
}

impl PrinterRegistry {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("WAL pragma"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        info!("printer registry opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory"))?;
        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(db_err("create table"))?;
        Ok(Self { conn })
    }

    /// Register a new profile. A profile flagged default takes the flag from
    /// whichever profile held it.
    #[instrument(skip(self, profile), fields(printer = %profile.id))]
    pub fn add(&mut self, profile: &PrinterProfile) -> Result<()> {
        if self.get(&profile.id)?.is_some() {
            return Err(RegistryError::Duplicate(profile.id.clone()).into());
        }
        let tx = self.conn.transaction().map_err(db_err("begin"))?;
        if profile.is_default {
            tx.execute("UPDATE printers SET is_default = 0", [])
                .map_err(db_err("clear default"))?;
        }
        tx.execute(
            "INSERT INTO printers (id, name, connection, capabilities, settings, active,
             is_default, auto_reconnect, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                profile.id.as_str(),
                profile.name,
                serde_json::to_string(&profile.connection)?,
                serde_json::to_string(&profile.capabilities)?,
                serde_json::to_string(&profile.settings)?,
                profile.active,
                profile.is_default,
                profile.auto_reconnect,
                ts(&profile.created_at),
                ts(&profile.updated_at),
            ],
        )
        .map_err(db_err("insert printer"))?;
        tx.commit().map_err(db_err("commit"))?;
        info!(name = %profile.name, transport = %profile.transport_kind(), "printer registered");
        Ok(())
    }

    /// Replace a profile's name, connection, capabilities, settings and
    /// reconnect flag. Active and default flags have their own operations.
    #[instrument(skip(self, profile), fields(printer = %profile.id))]
    pub fn update(&mut self, profile: &PrinterProfile) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE printers SET name = ?1, connection = ?2, capabilities = ?3,
                 settings = ?4, auto_reconnect = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    profile.name,
                    serde_json::to_string(&profile.connection)?,
                    serde_json::to_string(&profile.capabilities)?,
                    serde_json::to_string(&profile.settings)?,
                    profile.auto_reconnect,
                    ts(&Utc::now()),
                    profile.id.as_str(),
                ],
            )
            .map_err(db_err("update printer"))?;
        if rows == 0 {
            return Err(RegistryError::NotFound(profile.id.clone()).into());
        }
        debug!("printer profile updated");
        Ok(())
    }

    /// Add the profile, or update it and apply its active/default flags if it
    /// already exists. Used to seed profiles from configuration.
    pub fn upsert(&mut self, profile: &PrinterProfile) -> Result<()> {
        if self.get(&profile.id)?.is_none() {
            return self.add(profile);
        }
        self.update(profile)?;
        self.set_active(&profile.id, profile.active)?;
        if profile.is_default {
            self.set_default(&profile.id)?;
        }
        Ok(())
    }

    pub fn upsert_from_config(&mut self, printers: &[PrinterConfig]) -> Result<()> {
        for printer in printers {
            self.upsert(&printer.to_profile())?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(printer = %id))]
    pub fn get(&self, id: &ProfileId) -> Result<Option<PrinterProfile>> {
        self.conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.as_str()],
                row_to_profile,
            )
            .optional()
            .map_err(db_err("get printer"))
    }

    /// Like [`get`](Self::get) but a missing profile is an error.
    pub fn require(&self, id: &ProfileId) -> Result<PrinterProfile> {
        self.get(id)?
            .ok_or_else(|| RegistryError::NotFound(id.clone()).into())
    }

    pub fn list(&self, active_only: bool) -> Result<Vec<PrinterProfile>> {
        let sql = if active_only {
            format!("{SELECT_COLUMNS} WHERE active = 1 ORDER BY id")
        } else {
            format!("{SELECT_COLUMNS} ORDER BY id")
        };
        let mut stmt = self.conn.prepare(&sql).map_err(db_err("prepare list"))?;
        stmt.query_map([], row_to_profile)
            .map_err(db_err("query list"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err("collect rows"))
    }

    /// Make `id` the only default profile.
    #[instrument(skip(self), fields(printer = %id))]
    pub fn set_default(&mut self, id: &ProfileId) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err("begin"))?;
        let rows = tx
            .execute(
                "UPDATE printers SET is_default = (id = ?1), updated_at = ?2",
                params![id.as_str(), ts(&Utc::now())],
            )
            .map_err(db_err("set default"))?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM printers WHERE id = ?1)",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err("check printer"))?;
        if rows == 0 || !exists {
            // Dropping the transaction rolls back.
            return Err(RegistryError::NotFound(id.clone()).into());
        }
        tx.commit().map_err(db_err("commit"))?;
        info!("default printer changed");
        Ok(())
    }

    pub fn default_profile(&self) -> Result<Option<PrinterProfile>> {
        self.conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE is_default = 1"),
                [],
                row_to_profile,
            )
            .optional()
            .map_err(db_err("default printer"))
    }

    /// Block new submissions to `id`. Jobs already queued keep their target.
    pub fn deactivate(&mut self, id: &ProfileId) -> Result<()> {
        self.set_active(id, false)
    }

    pub fn reactivate(&mut self, id: &ProfileId) -> Result<()> {
        self.set_active(id, true)
    }

    #[instrument(skip(self), fields(printer = %id))]
    fn set_active(&mut self, id: &ProfileId, active: bool) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE printers SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, ts(&Utc::now()), id.as_str()],
            )
            .map_err(db_err("set active"))?;
        if rows == 0 {
            return Err(RegistryError::NotFound(id.clone()).into());
        }
        info!(active, "printer activation changed");
        Ok(())
    }

    /// Delete a profile outright. Callers must check that no job references
    /// it first; see `PrintService::remove_printer`.
    #[instrument(skip(self), fields(printer = %id))]
    pub fn remove(&mut self, id: &ProfileId) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM printers WHERE id = ?1", params![id.as_str()])
            .map_err(db_err("delete printer"))?;
        if rows == 0 {
            return Err(RegistryError::NotFound(id.clone()).into());
        }
        info!("printer profile removed");
        Ok(())
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrinterProfile> {
    fn json<T: serde::de::DeserializeOwned>(row: &rusqlite::Row<'_>, i: usize) -> rusqlite::Result<T> {
        serde_json::from_str(&row.get::<_, String>(i)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Text, Box::new(e))
        })
    }
    fn time(row: &rusqlite::Row<'_>, i: usize) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&row.get::<_, String>(i)?)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Text, Box::new(e))
            })
    }

    let connection: ConnectionParams = json(row, 2)?;
    let capabilities: Capabilities = json(row, 3)?;
    let settings: PrintSettings = json(row, 4)?;
    Ok(PrinterProfile {
        id: ProfileId(row.get(0)?),
        name: row.get(1)?,
        connection,
        capabilities,
        settings,
        active: row.get(5)?,
        is_default: row.get(6)?,
        auto_reconnect: row.get(7)?,
        created_at: time(row, 8)?,
        updated_at: time(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(id: &str) -> PrinterProfile {
        PrinterProfile::new(
            id,
            format!("Printer {id}"),
            ConnectionParams::Usb {
                device_path: "/dev/usb/lp0".into(),
            },
        )
    }

    #[test]
    fn add_and_get_round_trips_profile() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        let profile = usb("gate-1");
        reg.add(&profile).expect("add");

        let got = reg.require(&profile.id).expect("found");
        assert_eq!(got.name, "Printer gate-1");
        assert_eq!(got.connection, profile.connection);
        assert_eq!(got.capabilities, profile.capabilities);
        assert!(got.active);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        reg.add(&usb("gate-1")).expect("add");
        let err = reg.add(&usb("gate-1")).expect_err("duplicate");
        assert!(matches!(err, TicketpressError::Registry(RegistryError::Duplicate(_))));
    }

    #[test]
    fn only_one_default_at_a_time() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        let mut first = usb("gate-1");
        first.is_default = true;
        reg.add(&first).expect("add");
        reg.add(&usb("gate-2")).expect("add");

        reg.set_default(&ProfileId::from("gate-2")).expect("set default");

        let defaults: Vec<ProfileId> = reg
            .list(false)
            .expect("list")
            .into_iter()
            .filter(|p| p.is_default)
            .map(|p| p.id)
            .collect();
        assert_eq!(defaults, vec![ProfileId::from("gate-2")]);
        assert_eq!(
            reg.default_profile().expect("default").map(|p| p.id),
            Some(ProfileId::from("gate-2"))
        );
    }

    #[test]
    fn set_default_on_unknown_profile_keeps_old_default() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        let mut first = usb("gate-1");
        first.is_default = true;
        reg.add(&first).expect("add");

        let err = reg.set_default(&ProfileId::from("nope")).expect_err("unknown");
        assert!(matches!(err, TicketpressError::Registry(RegistryError::NotFound(_))));
        assert_eq!(
            reg.default_profile().expect("default").map(|p| p.id),
            Some(ProfileId::from("gate-1"))
        );
    }

    #[test]
    fn deactivated_profiles_hidden_from_active_list() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        reg.add(&usb("gate-1")).expect("add");
        reg.add(&usb("gate-2")).expect("add");
        reg.deactivate(&ProfileId::from("gate-1")).expect("deactivate");

        assert_eq!(reg.list(true).expect("list").len(), 1);
        assert_eq!(reg.list(false).expect("list").len(), 2);

        reg.reactivate(&ProfileId::from("gate-1")).expect("reactivate");
        assert_eq!(reg.list(true).expect("list").len(), 2);
    }

    #[test]
    fn upsert_updates_existing_profile() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        reg.add(&usb("gate-1")).expect("add");

        let mut changed = usb("gate-1");
        changed.name = "Main gate".into();
        changed.capabilities = Capabilities::escpos(32);
        changed.is_default = true;
        reg.upsert(&changed).expect("upsert");

        let got = reg.require(&changed.id).expect("found");
        assert_eq!(got.name, "Main gate");
        assert_eq!(got.capabilities.line_width, 32);
        assert!(got.is_default);
    }

    #[test]
    fn remove_unknown_profile_is_not_found() {
        let mut reg = PrinterRegistry::open_in_memory().expect("open");
        let err = reg.remove(&ProfileId::from("nope")).expect_err("unknown");
        assert!(matches!(err, TicketpressError::Registry(RegistryError::NotFound(_))));
    }
}
