//! MS-SQL persistence for received records.
//!
//! The writer owns a single lazily-opened connection (the dispatcher is
//! its only caller, so access is single-threaded by construction). On
//! every open it reads the existing table names and creates whatever
//! part of the reference schema is missing, which makes bootstrap
//! idempotent. Units, alarm types, recorders and current-value tag rows
//! are interned into reference tables through in-process caches with an
//! insert-then-select on each miss.
//!
//! Every 60th call the held connection is closed and reopened — a cheap
//! validity probe against silently broken connections on long-running
//! receivers.
//!
//! Every SQL failure is logged SEVERE and the call abandoned; cadence
//! counters in the adapters advance regardless, so a database outage
//! shifts nothing.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use tiberius::{AuthMethod, Client, Config, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::error;

use crate::codec::DataPoint;
use crate::error::{DiodeError, Result};
use crate::settings::Settings;

type SqlClient = Client<Compat<TcpStream>>;

const DEFAULT_SQL_PORT: u16 = 1433;

/// Calls between forced connection reopens.
const RECONNECT_PROBE_CALLS: u32 = 60;

/// Connection parameters for the historian database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    /// Build from persisted settings plus the externally supplied
    /// password. The URL is `host` or `host:port`.
    pub fn from_settings(settings: &Settings, password: String) -> Result<Self> {
        let url = settings.db_url.trim();
        if url.is_empty() {
            return Err(DiodeError::config("database URL is not configured"));
        }
        let (host, port) = match url.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| DiodeError::config(format!("bad database port in {url}: {e}")))?;
                (host.to_string(), port)
            }
            None => (url.to_string(), DEFAULT_SQL_PORT),
        };
        Ok(Self {
            host,
            port,
            username: settings.db_username.clone(),
            password,
        })
    }
}

/// Identity of a recorder for the `RecordersTbl` reference table.
#[derive(Debug, Clone)]
pub struct RecorderInfo {
    pub model: String,
    pub ip: String,
    pub unit_id: u8,
    pub config_file: String,
}

/// The receive-side database writer.
pub struct Database {
    config: DbConfig,
    client: Option<SqlClient>,
    tables: HashSet<String>,
    tag_ids: HashMap<String, i32>,
    unit_ids: HashMap<String, i32>,
    alarm_type_ids: HashMap<String, i32>,
    recorder_ids: HashMap<String, i32>,
    call_count: u32,
}

impl Database {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            client: None,
            tables: HashSet::new(),
            tag_ids: HashMap::new(),
            unit_ids: HashMap::new(),
            alarm_type_ids: HashMap::new(),
            recorder_ids: HashMap::new(),
            call_count: 0,
        }
    }

    /// Refresh the current value of one recorder tag.
    pub async fn update_current_value(&mut self, tag: &str, point: &DataPoint, time: NaiveDateTime) {
        if let Err(e) = self.try_update_current_value(tag, point, time).await {
            error!("Database error updating current values for {tag}: {e}");
        }
    }

    /// Historical cycle for one recorder tag: refresh the current value
    /// and append a row to the per-tag table (creating the table and
    /// its `ListTagsTbl` entry on first use).
    pub async fn add_tag_record(
        &mut self,
        time: NaiveDateTime,
        point: &DataPoint,
        tag: &str,
        recorder: &RecorderInfo,
        units: &str,
        alarm_types: &[String; 4],
    ) {
        self.update_current_value(tag, point, time).await;
        if let Err(e) = self
            .try_add_historical(time, point, tag, recorder, units, alarm_types)
            .await
        {
            error!("Database error adding new data row to {tag} table: {e}");
        }
    }

    /// Historical cycle for a generic Modbus device: refresh the current
    /// table and append one wide row.
    pub async fn update_modbus_record(
        &mut self,
        device_name: &str,
        tags: &[String],
        time: NaiveDateTime,
        values: &[f64],
    ) {
        self.update_modbus_current(device_name, tags, time, values)
            .await;
        if let Err(e) = self
            .try_modbus_record(device_name, tags, time, values)
            .await
        {
            error!("Database error adding new data row to {device_name} table: {e}");
        }
    }

    /// Refresh the single-row current table of a generic Modbus device.
    pub async fn update_modbus_current(
        &mut self,
        device_name: &str,
        tags: &[String],
        time: NaiveDateTime,
        values: &[f64],
    ) {
        if let Err(e) = self
            .try_modbus_current(device_name, tags, time, values)
            .await
        {
            error!("Database error updating current values for {device_name}: {e}");
        }
    }

    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                error!("Database error while trying to close connection: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------

    async fn ensure_connected(&mut self) -> Result<()> {
        self.call_count += 1;
        if self.client.is_some() {
            if self.call_count >= RECONNECT_PROBE_CALLS {
                self.call_count = 0;
                self.close().await;
            } else {
                return Ok(());
            }
        }

        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.authentication(AuthMethod::sql_server(
            &self.config.username,
            &self.config.password,
        ));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| DiodeError::database(format!("connecting to {}: {e}", self.config.host)))?;
        tcp.set_nodelay(true)
            .map_err(|e| DiodeError::database(e.to_string()))?;
        let client = Client::connect(config, tcp.compat_write()).await?;
        self.client = Some(client);

        self.load_tables().await?;
        self.create_schema().await?;
        Ok(())
    }

    fn client(&mut self) -> Result<&mut SqlClient> {
        self.client
            .as_mut()
            .ok_or_else(|| DiodeError::database("not connected"))
    }

    async fn load_tables(&mut self) -> Result<()> {
        let client = self.client()?;
        let rows = client
            .query("SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES", &[])
            .await?
            .into_first_result()
            .await?;
        self.tables.clear();
        for row in rows {
            if let Some(name) = row.get::<&str, _>(0) {
                self.tables.insert(name.to_string());
            }
        }
        Ok(())
    }

    /// Create whatever part of the reference schema does not exist yet.
    /// Rerunning against a populated database performs zero DDL.
    async fn create_schema(&mut self) -> Result<()> {
        for (name, ddl) in REFERENCE_SCHEMA {
            if !self.tables.contains(*name) {
                self.client()?.execute(*ddl, &[]).await?;
                self.tables.insert(name.to_string());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reference interning (cache, then select, then insert-and-select)
    // ------------------------------------------------------------------

    async fn units_id(&mut self, units: &str) -> Option<i32> {
        if let Some(id) = self.unit_ids.get(units) {
            return Some(*id);
        }
        match self
            .intern(
                "SELECT id FROM UnitsTbl WHERE Units = @P1",
                "INSERT INTO UnitsTbl(Units) VALUES(@P1)",
                units,
            )
            .await
        {
            Ok(Some(id)) => {
                self.unit_ids.insert(units.to_string(), id);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Database error getting units ID: {e}");
                None
            }
        }
    }

    async fn alarm_type_id(&mut self, alarm_type: &str) -> Option<i32> {
        if let Some(id) = self.alarm_type_ids.get(alarm_type) {
            return Some(*id);
        }
        match self
            .intern(
                "SELECT id FROM AlarmTypeTbl WHERE Type = @P1",
                "INSERT INTO AlarmTypeTbl(Type) VALUES(@P1)",
                alarm_type,
            )
            .await
        {
            Ok(Some(id)) => {
                self.alarm_type_ids.insert(alarm_type.to_string(), id);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Database error getting alarm type ID: {e}");
                None
            }
        }
    }

    /// Select-or-insert one string key against a reference table.
    async fn intern(&mut self, select: &str, insert: &str, key: &str) -> Result<Option<i32>> {
        if let Some(id) = self.select_id(select, &[&key]).await? {
            return Ok(Some(id));
        }
        self.client()?.execute(insert, &[&key]).await?;
        self.select_id(select, &[&key]).await
    }

    async fn select_id(&mut self, select: &str, params: &[&dyn ToSql]) -> Result<Option<i32>> {
        let row = self.client()?.query(select, params).await?.into_row().await?;
        Ok(row.and_then(|r| r.get::<i32, _>(0)))
    }

    async fn recorder_id(&mut self, recorder: &RecorderInfo) -> Option<i32> {
        let key = format!("{}|{}|{}", recorder.model, recorder.ip, recorder.unit_id);
        if let Some(id) = self.recorder_ids.get(&key) {
            return Some(*id);
        }
        match self.try_recorder_id(recorder).await {
            Ok(Some(id)) => {
                self.recorder_ids.insert(key, id);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Database error getting recorder ID: {e}");
                None
            }
        }
    }

    async fn try_recorder_id(&mut self, recorder: &RecorderInfo) -> Result<Option<i32>> {
        const SELECT: &str =
            "SELECT id FROM RecordersTbl WHERE Model = @P1 AND IPAddress = @P2 AND UnitID = @P3";
        let unit_id = recorder.unit_id as i32;
        if let Some(id) = self
            .select_id(SELECT, &[&recorder.model.as_str(), &recorder.ip.as_str(), &unit_id])
            .await?
        {
            return Ok(Some(id));
        }
        self.client()?
            .execute(
                "INSERT INTO RecordersTbl(Model, IPAddress, UnitID, ConfigFile) VALUES(@P1, @P2, @P3, @P4)",
                &[
                    &recorder.model.as_str(),
                    &recorder.ip.as_str(),
                    &unit_id,
                    &recorder.config_file.as_str(),
                ],
            )
            .await?;
        self.select_id(SELECT, &[&recorder.model.as_str(), &recorder.ip.as_str(), &unit_id])
            .await
    }

    /// Id of a tag's row in `CurrentValuesTbl`, inserting a blank row on
    /// first sight. `tag_name` arrives bracket-quoted.
    async fn tag_id(&mut self, tag_name: &str) -> Result<i32> {
        if let Some(id) = self.tag_ids.get(tag_name) {
            return Ok(*id);
        }
        const SELECT: &str = "SELECT id FROM CurrentValuesTbl WHERE TagName = @P1";
        let id = match self.select_id(SELECT, &[&tag_name]).await? {
            Some(id) => id,
            None => {
                self.client()?
                    .execute(
                        "INSERT INTO CurrentValuesTbl(TagName) VALUES(@P1)",
                        &[&tag_name],
                    )
                    .await?;
                self.select_id(SELECT, &[&tag_name])
                    .await?
                    .ok_or_else(|| {
                        DiodeError::database(format!("no id for tag {tag_name} after insert"))
                    })?
            }
        };
        self.tag_ids.insert(tag_name.to_string(), id);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Recorder tag writes
    // ------------------------------------------------------------------

    async fn try_update_current_value(
        &mut self,
        tag: &str,
        point: &DataPoint,
        time: NaiveDateTime,
    ) -> Result<()> {
        self.ensure_connected().await?;
        let tag_name = bracket(tag);
        let tag_id = self.tag_id(&tag_name).await?;
        let alarms = split_alarms(point);
        self.client()?
            .execute(
                "UPDATE CurrentValuesTbl SET Timestamp = @P1, Value = @P2, \
                 Alarm1Status = @P3, Alarm2Status = @P4, Alarm3Status = @P5, Alarm4Status = @P6 \
                 WHERE id = @P7",
                &[
                    &time, &point.value, &alarms[0], &alarms[1], &alarms[2], &alarms[3], &tag_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn try_add_historical(
        &mut self,
        time: NaiveDateTime,
        point: &DataPoint,
        tag: &str,
        recorder: &RecorderInfo,
        units: &str,
        alarm_types: &[String; 4],
    ) -> Result<()> {
        self.ensure_connected().await?;
        let tag_name = bracket(tag);

        if !self.tables.contains(tag) {
            let ddl = tag_table_ddl(&tag_name);
            self.client()?.execute(ddl.as_str(), &[]).await?;
            self.tables.insert(tag.to_string());
            self.list_tag(&tag_name, recorder, units, alarm_types).await;
        }

        let alarms = split_alarms(point);
        let insert = format!(
            "INSERT INTO {tag_name}(Timestamp, Value, Alarm1Status, Alarm2Status, \
             Alarm3Status, Alarm4Status) VALUES(@P1, @P2, @P3, @P4, @P5, @P6)"
        );
        self.client()?
            .execute(
                insert.as_str(),
                &[
                    &time, &point.value, &alarms[0], &alarms[1], &alarms[2], &alarms[3],
                ],
            )
            .await?;
        Ok(())
    }

    /// Register a newly seen tag in `ListTagsTbl` with its reference
    /// ids. Failed lookups degrade to NULL references.
    async fn list_tag(
        &mut self,
        tag_name: &str,
        recorder: &RecorderInfo,
        units: &str,
        alarm_types: &[String; 4],
    ) {
        let units_id = self.units_id(units).await;
        let recorder_id = self.recorder_id(recorder).await;
        let mut alarm_ids = [None; 4];
        for (slot, alarm_type) in alarm_types.iter().enumerate() {
            alarm_ids[slot] = self.alarm_type_id(alarm_type).await;
        }

        let result = async {
            self.client()?
                .execute(
                    "INSERT INTO ListTagsTbl(TagName, Units, Recorder, Alarm1Type, \
                     Alarm2Type, Alarm3Type, Alarm4Type) VALUES(@P1, @P2, @P3, @P4, @P5, @P6, @P7)",
                    &[
                        &tag_name,
                        &units_id,
                        &recorder_id,
                        &alarm_ids[0],
                        &alarm_ids[1],
                        &alarm_ids[2],
                        &alarm_ids[3],
                    ],
                )
                .await?;
            Ok::<(), DiodeError>(())
        }
        .await;
        if let Err(e) = result {
            error!("Database error adding {tag_name} to ListTagsTbl: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Generic Modbus device writes
    // ------------------------------------------------------------------

    async fn try_modbus_record(
        &mut self,
        device_name: &str,
        tags: &[String],
        time: NaiveDateTime,
        values: &[f64],
    ) -> Result<()> {
        self.ensure_connected().await?;
        let table = bracket(device_name);

        if !self.tables.contains(device_name) {
            let ddl = modbus_table_ddl(&table, tags);
            self.client()?.execute(ddl.as_str(), &[]).await?;
            self.tables.insert(device_name.to_string());
        }

        let insert = modbus_insert_sql(&table, tags);
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(values.len() + 1);
        params.push(&time);
        for value in values {
            params.push(value);
        }
        self.client()?.execute(insert.as_str(), &params).await?;
        Ok(())
    }

    async fn try_modbus_current(
        &mut self,
        device_name: &str,
        tags: &[String],
        time: NaiveDateTime,
        values: &[f64],
    ) -> Result<()> {
        self.ensure_connected().await?;
        let current_name = format!("{device_name} Current");
        let table = bracket(&current_name);

        if !self.tables.contains(&current_name) {
            let ddl = modbus_table_ddl(&table, tags);
            self.client()?.execute(ddl.as_str(), &[]).await?;
            // Seed the single updatable row.
            let seed = format!("INSERT INTO {table}(Timestamp) VALUES(NULL)");
            self.client()?.execute(seed.as_str(), &[]).await?;
            self.tables.insert(current_name.clone());
        }

        let update = modbus_update_sql(&table, tags);
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(values.len() + 1);
        params.push(&time);
        for value in values {
            params.push(value);
        }
        self.client()?.execute(update.as_str(), &params).await?;
        Ok(())
    }
}

/// Quote an identifier with brackets so tags may carry arbitrary
/// characters.
fn bracket(name: &str) -> String {
    format!("[{name}]")
}

fn split_alarms(point: &DataPoint) -> [Option<i32>; 4] {
    match point.alarms {
        Some(alarms) => alarms.map(Some),
        None => [None; 4],
    }
}

/// Per-tag historical table.
fn tag_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE {table} \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         Timestamp DATETIME, \
         Value DECIMAL(20,4), \
         Alarm1Status INT, \
         Alarm2Status INT, \
         Alarm3Status INT, \
         Alarm4Status INT)"
    )
}

/// Wide table for a generic Modbus device, one column per tag.
fn modbus_table_ddl(table: &str, tags: &[String]) -> String {
    let mut sql = format!(
        "CREATE TABLE {table} \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         Timestamp DATETIME"
    );
    for tag in tags {
        sql.push_str(&format!(", {} DECIMAL(20,4)", bracket(tag)));
    }
    sql.push(')');
    sql
}

fn modbus_insert_sql(table: &str, tags: &[String]) -> String {
    let mut sql = format!("INSERT INTO {table}(Timestamp");
    for tag in tags {
        sql.push_str(&format!(", {}", bracket(tag)));
    }
    sql.push_str(") VALUES(@P1");
    for i in 0..tags.len() {
        sql.push_str(&format!(", @P{}", i + 2));
    }
    sql.push(')');
    sql
}

fn modbus_update_sql(table: &str, tags: &[String]) -> String {
    let mut sql = format!("UPDATE {table} SET Timestamp = @P1");
    for (i, tag) in tags.iter().enumerate() {
        sql.push_str(&format!(", {} = @P{}", bracket(tag), i + 2));
    }
    sql
}

/// Reference tables created on bootstrap when missing.
const REFERENCE_SCHEMA: &[(&str, &str)] = &[
    (
        "RecordersTbl",
        "CREATE TABLE RecordersTbl \
         (id INTEGER NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         Model VARCHAR(255), \
         IPAddress VARCHAR(255), \
         UnitID INTEGER, \
         ConfigFile VARCHAR(255))",
    ),
    (
        "UnitsTbl",
        "CREATE TABLE UnitsTbl \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         Units VARCHAR(255))",
    ),
    (
        "AlarmTypeTbl",
        "CREATE TABLE AlarmTypeTbl \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         Type VARCHAR(255))",
    ),
    (
        "ListTagsTbl",
        "CREATE TABLE ListTagsTbl \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         TagName VARCHAR(255) NOT NULL, \
         Units INT REFERENCES UnitsTbl(id), \
         Recorder INT REFERENCES RecordersTbl(id), \
         Alarm1Type INT REFERENCES AlarmTypeTbl(id), \
         Alarm2Type INT REFERENCES AlarmTypeTbl(id), \
         Alarm3Type INT REFERENCES AlarmTypeTbl(id), \
         Alarm4Type INT REFERENCES AlarmTypeTbl(id))",
    ),
    (
        "CurrentValuesTbl",
        "CREATE TABLE CurrentValuesTbl \
         (id INT NOT NULL PRIMARY KEY IDENTITY(1, 1), \
         TagName VARCHAR(255) NOT NULL, \
         Timestamp DATETIME, \
         Value DECIMAL(20,4), \
         Alarm1Status INT, \
         Alarm2Status INT, \
         Alarm3Status INT, \
         Alarm4Status INT)",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_bracket_quoted() {
        assert_eq!(bracket("T_BOILER_1"), "[T_BOILER_1]");
        assert_eq!(bracket("tag with spaces"), "[tag with spaces]");
    }

    #[test]
    fn modbus_current_update_sql_names_each_tag() {
        let tags = vec!["temp1".to_string(), "temp2".to_string()];
        let sql = modbus_update_sql(&bracket("Boiler PLC Current"), &tags);
        assert_eq!(
            sql,
            "UPDATE [Boiler PLC Current] SET Timestamp = @P1, [temp1] = @P2, [temp2] = @P3"
        );
    }

    #[test]
    fn modbus_insert_sql_parameter_positions() {
        let tags = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let sql = modbus_insert_sql(&bracket("Dev"), &tags);
        assert_eq!(
            sql,
            "INSERT INTO [Dev](Timestamp, [a], [b], [c]) VALUES(@P1, @P2, @P3, @P4)"
        );
    }

    #[test]
    fn modbus_ddl_brackets_tag_columns() {
        let tags = vec!["flow rate".to_string()];
        let ddl = modbus_table_ddl(&bracket("Dev"), &tags);
        assert!(ddl.starts_with("CREATE TABLE [Dev]"));
        assert!(ddl.contains("[flow rate] DECIMAL(20,4)"));
        assert!(ddl.contains("IDENTITY(1, 1)"));
    }

    #[test]
    fn tag_table_ddl_carries_alarm_columns() {
        let ddl = tag_table_ddl(&bracket("T1"));
        for column in ["Alarm1Status", "Alarm2Status", "Alarm3Status", "Alarm4Status"] {
            assert!(ddl.contains(column));
        }
        assert!(ddl.contains("Value DECIMAL(20,4)"));
    }

    #[test]
    fn db_config_parses_host_and_optional_port() {
        let settings = Settings {
            gather_interval: 1000,
            db_url: "10.0.0.9:14330".to_string(),
            db_username: "historian".to_string(),
        };
        let config = DbConfig::from_settings(&settings, "secret".to_string()).unwrap();
        assert_eq!(config.host, "10.0.0.9");
        assert_eq!(config.port, 14330);
        assert_eq!(config.username, "historian");

        let settings = Settings {
            db_url: "sqlhost".to_string(),
            ..settings
        };
        let config = DbConfig::from_settings(&settings, String::new()).unwrap();
        assert_eq!(config.port, DEFAULT_SQL_PORT);
    }

    #[test]
    fn empty_db_url_is_rejected() {
        let settings = Settings::default();
        assert!(DbConfig::from_settings(&settings, String::new()).is_err());
    }

    #[test]
    fn alarm_split_preserves_absence() {
        let point = DataPoint::new(1.0);
        assert_eq!(split_alarms(&point), [None; 4]);
        let point = DataPoint::with_alarms(1.0, [1, 0, 0, 1]);
        assert_eq!(
            split_alarms(&point),
            [Some(1), Some(0), Some(0), Some(1)]
        );
    }

    #[test]
    fn reference_schema_covers_all_five_tables() {
        let names: Vec<&str> = REFERENCE_SCHEMA.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "RecordersTbl",
                "UnitsTbl",
                "AlarmTypeTbl",
                "ListTagsTbl",
                "CurrentValuesTbl"
            ]
        );
    }
}
