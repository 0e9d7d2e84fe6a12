//! SQLite-backed instrument table with a row-level change feed.
//!
//! Stands in for the hosted relational backend: the bulk read is a plain
//! `SELECT` filtered on maturity, and every `upsert` that lands in the table is
//! announced to subscribers the way a realtime channel would.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::instrument::{parse_maturity_date, RawInstrument, MATURITY_DATE_FORMAT};
use crate::source::{
    BatchFilter, ChangeEvent, ChangeFeed, ChangeKind, DataSource, DataSourceError, FeedHub,
    SubscriptionError,
};

const COLUMNS: &str = "ticker, segment, maturity_date, price, tir, days_to_maturity, \
     modified_duration, tna, tem, parity, used_previous_close, last_updated";

pub struct SqliteDataSource {
    conn: Arc<Mutex<Connection>>,
    table: String,
    hub: FeedHub,
}

impl SqliteDataSource {
    pub fn open(path: &Path, table: &str) -> Result<Self, DataSourceError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self, DataSourceError> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, DataSourceError> {
        validate_table_name(table)?;
        create_table(&conn, table)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            hub: FeedHub::new(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Write a full row and announce it on the change feed.
    pub fn upsert(&self, record: &RawInstrument) -> Result<ChangeKind, DataSourceError> {
        let ticker = record
            .ticker_hint()
            .ok_or_else(|| DataSourceError::Query("upsert requires a ticker".to_string()))?
            .to_string();

        let kind = {
            let mut conn = self.conn.lock().expect("sqlite lock should not be poisoned");
            let tx = conn.transaction()?;
            let existed: Option<i64> = tx
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE ticker = ?1", self.table),
                    params![ticker],
                    |row| row.get(0),
                )
                .optional()?;
            upsert_row(&tx, &self.table, &ticker, record)?;
            tx.commit()?;

            if existed.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            }
        };

        let mut announced = record.clone();
        announced.ticker = Some(ticker);
        self.hub.publish(ChangeEvent {
            table: self.table.clone(),
            kind,
            record: announced,
        });
        Ok(kind)
    }

    /// Load rows in one transaction without touching the change feed.
    pub fn seed(&self, records: &[RawInstrument]) -> Result<usize, DataSourceError> {
        let mut conn = self.conn.lock().expect("sqlite lock should not be poisoned");
        let tx = conn.transaction()?;
        let mut written = 0;
        for record in records {
            let Some(ticker) = record.ticker_hint() else {
                continue;
            };
            upsert_row(&tx, &self.table, ticker, record)?;
            written += 1;
        }
        tx.commit()?;

        info!(
            component = "sqlite_source",
            event = "sqlite.seed",
            table = %self.table,
            written
        );
        Ok(written)
    }

    pub fn count(&self) -> Result<u64, DataSourceError> {
        let conn = self.conn.lock().expect("sqlite lock should not be poisoned");
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl DataSource for SqliteDataSource {
    fn fetch_batch(
        &self,
        filter: &BatchFilter,
    ) -> impl Future<Output = Result<Vec<RawInstrument>, DataSourceError>> + Send {
        let conn = Arc::clone(&self.conn);
        let table = self.table.clone();
        let filter = filter.clone();

        async move {
            if filter.table != table {
                return Err(DataSourceError::Query(format!(
                    "table {} is not served by this source",
                    filter.table
                )));
            }

            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().expect("sqlite lock should not be poisoned");
                select_maturing_after(&conn, &table, &filter)
            })
            .await
            .map_err(|err| DataSourceError::Task(err.to_string()))?
        }
    }

    fn subscribe(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<ChangeFeed, SubscriptionError>> + Send {
        let result = if table == self.table {
            Ok(self.hub.subscribe(table))
        } else {
            Err(SubscriptionError::UnknownTable(table.to_string()))
        };
        std::future::ready(result)
    }
}

fn validate_table_name(table: &str) -> Result<(), DataSourceError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DataSourceError::InvalidTable(table.to_string()))
    }
}

fn create_table(conn: &Connection, table: &str) -> Result<(), DataSourceError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            ticker TEXT PRIMARY KEY NOT NULL,
            segment TEXT,
            maturity_date TEXT,
            price REAL,
            tir REAL,
            days_to_maturity REAL,
            modified_duration REAL,
            tna REAL,
            tem REAL,
            parity REAL,
            used_previous_close INTEGER,
            last_updated TEXT
        );
        CREATE INDEX IF NOT EXISTS {table}_maturity_idx ON {table} (maturity_date);
        "
    ))?;
    Ok(())
}

fn upsert_row(
    conn: &Connection,
    table: &str,
    ticker: &str,
    record: &RawInstrument,
) -> Result<(), DataSourceError> {
    // Stored as plain `YYYY-MM-DD` so the cutoff comparison stays lexical.
    let maturity_date = record.maturity_date.as_deref().map(|raw| {
        parse_maturity_date(raw)
            .map(|date| date.format(MATURITY_DATE_FORMAT).to_string())
            .unwrap_or_else(|| raw.to_string())
    });
    conn.execute(
        &format!(
            "
            INSERT INTO {table} ({COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(ticker) DO UPDATE SET
                segment = excluded.segment,
                maturity_date = excluded.maturity_date,
                price = excluded.price,
                tir = excluded.tir,
                days_to_maturity = excluded.days_to_maturity,
                modified_duration = excluded.modified_duration,
                tna = excluded.tna,
                tem = excluded.tem,
                parity = excluded.parity,
                used_previous_close = excluded.used_previous_close,
                last_updated = excluded.last_updated
            "
        ),
        params![
            ticker,
            record.segment,
            maturity_date,
            record.price,
            record.yield_to_maturity,
            record.days_to_maturity,
            record.modified_duration,
            record.tna,
            record.tem,
            record.parity,
            record.used_previous_close,
            record.last_updated,
        ],
    )?;
    Ok(())
}

fn select_maturing_after(
    conn: &Connection,
    table: &str,
    filter: &BatchFilter,
) -> Result<Vec<RawInstrument>, DataSourceError> {
    let cutoff = filter.maturing_after.format(MATURITY_DATE_FORMAT).to_string();
    // Rows written by other tools may carry a time part after the date.
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM {table} \
         WHERE substr(maturity_date, 1, 10) > ?1 \
         ORDER BY substr(maturity_date, 1, 10), ticker"
    ))?;
    let rows = stmt
        .query_map(params![cutoff], raw_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawInstrument> {
    Ok(RawInstrument {
        ticker: row.get(0)?,
        segment: row.get(1)?,
        maturity_date: row.get(2)?,
        price: row.get(3)?,
        yield_to_maturity: row.get(4)?,
        days_to_maturity: row.get(5)?,
        modified_duration: row.get(6)?,
        tna: row.get(7)?,
        tem: row.get(8)?,
        parity: row.get(9)?,
        used_previous_close: row.get(10)?,
        last_updated: row.get(11)?,
    })
}
