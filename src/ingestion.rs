use crate::error::{PortfolioError, Result};
use crate::schema::{
    AssetType, CashflowRecord, CashflowType, LoanStatus, SnapshotRecord, VehicleExpenseRecord,
    VehiclePaymentRecord, VehicleStateRecord,
};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

pub type RawRow = BTreeMap<String, String>;

/// Accepted values per column of one table. Anything else is a warning.
pub type AllowedValues = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn new(name: impl Into<String>, headers: &[&str], rows: &[&[&str]]) -> Self {
        let headers: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let rows = rows
            .iter()
            .map(|cells| {
                headers
                    .iter()
                    .cloned()
                    .zip(cells.iter().map(|c| c.to_string()))
                    .collect()
            })
            .collect();
        Self {
            name: name.into(),
            headers,
            rows,
        }
    }
}

/// Column layout of one input feed.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub required_columns: &'static [&'static str],
    pub optional_columns: &'static [&'static str],
}

pub const BALANCE_SHEET: TableSpec = TableSpec {
    name: "Balance Sheet",
    required_columns: &["Platform", "Asset", "Value", "Timestamp"],
    optional_columns: &["Token Amount"],
};

pub const PENSION_CASHFLOWS: TableSpec = TableSpec {
    name: "Pension Cashflows",
    required_columns: &["Platform", "Asset", "Value", "Timestamp", "Cashflow Type"],
    optional_columns: &["Description", "Notes"],
};

pub const VEHICLE_STATE: TableSpec = TableSpec {
    name: "Car Assets",
    required_columns: &["Timestamp", "Asset", "Car_Value", "Loan_Balance"],
    optional_columns: &["Loan_Status", "Mileage", "Platform", "Notes"],
};

pub const VEHICLE_PAYMENTS: TableSpec = TableSpec {
    name: "Car Payments",
    required_columns: &["Timestamp", "Asset", "Payment_Amount", "Payment_Type"],
    optional_columns: &["Platform", "Notes"],
};

pub const VEHICLE_EXPENSES: TableSpec = TableSpec {
    name: "Car Expenses",
    required_columns: &["Timestamp", "Asset", "Amount", "Expense_Type"],
    optional_columns: &["Platform/Provider", "Notes"],
};

pub const ALL_TABLES: [TableSpec; 5] = [
    BALANCE_SHEET,
    PENSION_CASHFLOWS,
    VEHICLE_STATE,
    VEHICLE_PAYMENTS,
    VEHICLE_EXPENSES,
];

impl TableSpec {
    pub fn find(name: &str) -> Option<TableSpec> {
        ALL_TABLES.iter().copied().find(|spec| spec.name == name)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.required_columns
            .iter()
            .chain(self.optional_columns)
            .any(|c| *c == column)
    }
}

/// An external provider of raw tables (spreadsheet, CSV export, API).
pub trait RecordSource {
    fn source_id(&self) -> &str;

    /// Fetches a whole table. An unreachable source is a fatal error.
    fn fetch(&self, spec: &TableSpec) -> Result<RawTable>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    id: String,
    tables: BTreeMap<String, RawTable>,
}

impl InMemorySource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, table: RawTable) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }
}

impl RecordSource for InMemorySource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, spec: &TableSpec) -> Result<RawTable> {
        self.tables.get(spec.name).cloned().ok_or_else(|| {
            PortfolioError::SourceUnavailable(format!(
                "table '{}' not found in source '{}'",
                spec.name, self.id
            ))
        })
    }
}

/// Reads each table from its own CSV export.
#[derive(Debug, Clone, Default)]
pub struct CsvSource {
    id: String,
    files: BTreeMap<String, PathBuf>,
}

impl CsvSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, table_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(table_name.into(), path.into());
        self
    }
}

impl RecordSource for CsvSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, spec: &TableSpec) -> Result<RawTable> {
        let path = self.files.get(spec.name).ok_or_else(|| {
            PortfolioError::SourceUnavailable(format!(
                "no CSV file registered for table '{}'",
                spec.name
            ))
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| {
                PortfolioError::SourceUnavailable(format!("{}: {}", path.display(), e))
            })?;

        // Cells are decoded lossily; undecodable rows are reported by the loaders.
        let headers: Vec<String> = reader
            .byte_headers()?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for record in reader.byte_records() {
            let record = record?;
            let row: RawRow = headers
                .iter()
                .cloned()
                .zip(record.iter().map(|c| String::from_utf8_lossy(c).into_owned()))
                .collect();
            rows.push(row);
        }

        debug!("Read {} rows from {}", rows.len(), path.display());

        Ok(RawTable {
            name: spec.name.to_string(),
            headers,
            rows,
        })
    }
}

/// Fetches on a worker thread and gives up after `timeout`.
pub fn fetch_with_timeout(
    source: Arc<dyn RecordSource + Send + Sync>,
    spec: TableSpec,
    timeout: Duration,
) -> Result<RawTable> {
    let (tx, rx) = mpsc::channel();
    let worker_source = Arc::clone(&source);
    std::thread::spawn(move || {
        let _ = tx.send(worker_source.fetch(&spec));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(PortfolioError::SourceTimeout {
            source_id: source.source_id().to_string(),
            seconds: timeout.as_secs(),
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(PortfolioError::SourceUnavailable(
            format!("worker for source '{}' exited", source.source_id()),
        )),
    }
}

/// Fails when the table carries none of its required columns or lacks any of them.
pub fn check_schema(table: &RawTable, spec: &TableSpec) -> Result<()> {
    let present: BTreeSet<&str> = table.headers.iter().map(|h| h.trim()).collect();
    let missing: Vec<String> = spec
        .required_columns
        .iter()
        .filter(|c| !present.contains(**c))
        .map(|c| c.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PortfolioError::SchemaMismatch {
            table: spec.name.to_string(),
            missing,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WarningKind {
    MissingValue,
    InvalidNumber(String),
    InvalidTimestamp(String),
    InvalidCategory(String),
    UnexpectedValue(String),
    InvalidEncoding(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowWarning {
    /// 0-based data row index (header excluded).
    pub row: usize,
    pub column: String,
    pub kind: WarningKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub table: String,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub rows_dropped: usize,
    pub warnings: Vec<RowWarning>,
}

impl LoadReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Warning counts grouped by column.
    pub fn warning_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for warning in &self.warnings {
            *counts.entry(warning.column.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} rows read, {} kept, {} dropped, {} warnings",
            self.table,
            self.rows_read,
            self.rows_kept,
            self.rows_dropped,
            self.warnings.len()
        )
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d %b %Y", "%d %B %Y", "%Y/%m/%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Parses the date representations found in hand-maintained spreadsheets.
/// Day-first forms win over month-first ones. The time of day is discarded.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }

    // "Jan 2024" / "January 2024"
    for fmt in ["%d %b %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("1 {}", s), fmt) {
            return Some(date);
        }
    }

    parse_serial_date(s)
}

/// Spreadsheet serial day numbers count from 1899-12-30.
fn parse_serial_date(s: &str) -> Option<NaiveDate> {
    let serial: f64 = s.parse().ok()?;
    if !serial.is_finite() || !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Parses a currency cell such as `£1,234.56`, `-12.5` or `(300.00)`.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '£' | '$' | '€' | ',' | ' ' | '\u{a0}'))
        .collect();

    let negative = s.starts_with('(') && s.ends_with(')');
    if negative {
        s = s[1..s.len() - 1].to_string();
    }

    let value: f64 = s.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

struct RowCursor<'a> {
    index: usize,
    row: &'a RawRow,
    warnings: Vec<RowWarning>,
}

impl<'a> RowCursor<'a> {
    fn new(index: usize, row: &'a RawRow) -> Self {
        Self {
            index,
            row,
            warnings: Vec::new(),
        }
    }

    fn cell(&self, column: &str) -> Option<&'a str> {
        self.row
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn warn(&mut self, column: &str, kind: WarningKind) {
        self.warnings.push(RowWarning {
            row: self.index,
            column: column.to_string(),
            kind,
        });
    }

    fn text(&mut self, column: &str) -> Option<String> {
        match self.cell(column) {
            Some(v) => Some(v.to_string()),
            None => {
                self.warn(column, WarningKind::MissingValue);
                None
            }
        }
    }

    fn optional_text(&self, column: &str) -> Option<String> {
        self.cell(column).map(|v| v.to_string())
    }

    fn date(&mut self, column: &str) -> Option<NaiveDate> {
        match self.cell(column) {
            Some(v) => {
                let parsed = parse_timestamp(v);
                if parsed.is_none() {
                    self.warn(column, WarningKind::InvalidTimestamp(v.to_string()));
                }
                parsed
            }
            None => {
                self.warn(column, WarningKind::MissingValue);
                None
            }
        }
    }

    fn currency(&mut self, column: &str) -> Option<f64> {
        match self.cell(column) {
            Some(v) => {
                let parsed = parse_currency(v);
                if parsed.is_none() {
                    self.warn(column, WarningKind::InvalidNumber(v.to_string()));
                }
                parsed
            }
            None => {
                self.warn(column, WarningKind::MissingValue);
                None
            }
        }
    }

    /// A bad optional number is reported but never drops the row.
    fn optional_number(&mut self, column: &str) -> Option<f64> {
        let v = self.cell(column)?;
        let parsed = parse_currency(v);
        if parsed.is_none() {
            self.warn(column, WarningKind::InvalidNumber(v.to_string()));
        }
        parsed
    }

    fn check_allowed(&mut self, allowed: &AllowedValues) {
        for (column, values) in allowed {
            if let Some(v) = self.cell(column) {
                if !values.iter().any(|a| a == v) {
                    self.warn(column, WarningKind::UnexpectedValue(v.to_string()));
                }
            }
        }
    }

    /// Flags cells that held bytes the source could not decode as UTF-8.
    fn check_encoding(&mut self) -> bool {
        let row = self.row;
        let mut clean = true;
        for (column, v) in row {
            if v.contains(char::REPLACEMENT_CHARACTER) {
                self.warn(column, WarningKind::InvalidEncoding(v.clone()));
                clean = false;
            }
        }
        clean
    }
}

/// Applies `convert` to every row. `None` drops the row; its warnings are kept either way.
/// Rows with undecodable cells are dropped before conversion.
fn load_rows<T>(
    table: &RawTable,
    spec: &TableSpec,
    allowed: &AllowedValues,
    mut convert: impl FnMut(&mut RowCursor) -> Option<T>,
) -> (Vec<T>, LoadReport) {
    let mut report = LoadReport::new(spec.name);
    let mut out = Vec::with_capacity(table.rows.len());

    for (index, row) in table.rows.iter().enumerate() {
        report.rows_read += 1;
        let mut cursor = RowCursor::new(index, row);
        let converted = if cursor.check_encoding() {
            cursor.check_allowed(allowed);
            convert(&mut cursor)
        } else {
            None
        };
        report.warnings.append(&mut cursor.warnings);

        match converted {
            Some(item) => {
                out.push(item);
                report.rows_kept += 1;
            }
            None => report.rows_dropped += 1,
        }
    }

    if report.rows_dropped > 0 {
        warn!(
            "Dropped {} of {} rows from '{}'",
            report.rows_dropped, report.rows_read, spec.name
        );
    }
    debug!("{}", report.summary());

    (out, report)
}

/// Converts the primary asset feed. Records leave with `AssetType::Other`;
/// classification happens in the next stage.
pub fn load_snapshots(
    table: &RawTable,
    allowed_values: &AllowedValues,
) -> Result<(Vec<SnapshotRecord>, LoadReport)> {
    check_schema(table, &BALANCE_SHEET)?;

    let (records, report) = load_rows(table, &BALANCE_SHEET, allowed_values, |cur| {
        let platform = cur.text("Platform");
        let asset_name = cur.text("Asset");
        let value = cur.currency("Value");
        let timestamp = cur.date("Timestamp");
        let token_amount = cur.optional_number("Token Amount");

        Some(SnapshotRecord {
            platform: platform?,
            asset_name: asset_name?,
            asset_type: AssetType::Other,
            value: value?,
            timestamp: timestamp?,
            token_amount,
        })
    });

    info!("Loaded {} snapshot records", records.len());
    Ok((records, report))
}

pub fn load_cashflows(
    table: &RawTable,
    allowed_values: &AllowedValues,
) -> Result<(Vec<CashflowRecord>, LoadReport)> {
    check_schema(table, &PENSION_CASHFLOWS)?;

    let (records, report) = load_rows(table, &PENSION_CASHFLOWS, allowed_values, |cur| {
        let platform = cur.text("Platform");
        let asset_name = cur.text("Asset");
        let value = cur.currency("Value");
        let timestamp = cur.date("Timestamp");
        let cashflow_type = cur.text("Cashflow Type").map(|t| CashflowType::parse(&t));
        let description = cur
            .optional_text("Description")
            .or_else(|| cur.optional_text("Notes"));

        Some(CashflowRecord {
            platform: platform?,
            asset_name: asset_name?,
            value: value?,
            timestamp: timestamp?,
            cashflow_type: cashflow_type?,
            description,
        })
    });

    info!("Loaded {} pension cashflow records", records.len());
    Ok((records, report))
}

pub fn load_vehicle_states(
    table: &RawTable,
    allowed_values: &AllowedValues,
) -> Result<(Vec<VehicleStateRecord>, LoadReport)> {
    check_schema(table, &VEHICLE_STATE)?;

    let (records, report) = load_rows(table, &VEHICLE_STATE, allowed_values, |cur| {
        let timestamp = cur.date("Timestamp");
        let asset_name = cur.text("Asset");
        let car_value = cur.currency("Car_Value");
        let loan_balance = cur.currency("Loan_Balance");
        let mileage = cur.optional_number("Mileage");
        let loan_status = match cur.optional_text("Loan_Status") {
            Some(raw) => {
                let status = LoanStatus::parse(&raw);
                if status.is_none() {
                    cur.warn("Loan_Status", WarningKind::InvalidCategory(raw));
                }
                status
            }
            None => None,
        };

        Some(VehicleStateRecord {
            timestamp: timestamp?,
            asset_name: asset_name?,
            car_value: car_value?,
            loan_balance: loan_balance?,
            loan_status,
            mileage,
        })
    });

    Ok((records, report))
}

pub fn load_vehicle_payments(
    table: &RawTable,
    allowed_values: &AllowedValues,
) -> Result<(Vec<VehiclePaymentRecord>, LoadReport)> {
    check_schema(table, &VEHICLE_PAYMENTS)?;

    let (records, report) = load_rows(table, &VEHICLE_PAYMENTS, allowed_values, |cur| {
        let timestamp = cur.date("Timestamp");
        let asset_name = cur.text("Asset");
        let payment_amount = cur.currency("Payment_Amount");
        let payment_type = cur.text("Payment_Type");

        Some(VehiclePaymentRecord {
            timestamp: timestamp?,
            asset_name: asset_name?,
            payment_amount: payment_amount?,
            payment_type: payment_type?,
        })
    });

    Ok((records, report))
}

pub fn load_vehicle_expenses(
    table: &RawTable,
    allowed_values: &AllowedValues,
) -> Result<(Vec<VehicleExpenseRecord>, LoadReport)> {
    check_schema(table, &VEHICLE_EXPENSES)?;

    let (records, report) = load_rows(table, &VEHICLE_EXPENSES, allowed_values, |cur| {
        let timestamp = cur.date("Timestamp");
        let asset_name = cur.text("Asset");
        let amount = cur.currency("Amount");
        let expense_type = cur.text("Expense_Type");

        Some(VehicleExpenseRecord {
            timestamp: timestamp?,
            asset_name: asset_name?,
            amount: amount?,
            expense_type: expense_type?,
        })
    });

    Ok((records, report))
}

/// Keeps records whose timestamp lies within the optional inclusive bounds.
pub fn filter_by_date_range(
    records: &[SnapshotRecord],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<SnapshotRecord> {
    records
        .iter()
        .filter(|r| start.map_or(true, |s| r.timestamp >= s))
        .filter(|r| end.map_or(true, |e| r.timestamp <= e))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2024-01-05"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("05/01/2024"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("05-01-2024"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("05.01.2024"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("5 Jan 2024"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("2024-01-05 17:30:00"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("2024-01-05T17:30:00+01:00"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("Jan 2024"), Some(date(2024, 1, 1)));
        assert_eq!(parse_timestamp("45296"), Some(date(2024, 1, 5)));
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("£1,234.56"), Some(1234.56));
        assert_eq!(parse_currency(" -12.5 "), Some(-12.5));
        assert_eq!(parse_currency("(300.00)"), Some(-300.0));
        assert_eq!(parse_currency("n/a"), None);
        assert_eq!(parse_currency(""), None);
        assert_eq!(parse_currency("inf"), None);
    }

    #[test]
    fn test_load_snapshots_drops_bad_rows_with_warnings() {
        let table = RawTable::new(
            "Balance Sheet",
            &["Timestamp", "Platform", "Asset", "Value", "Token Amount"],
            &[
                &["05/01/2024", "IBKR", "Portfolio", "£1,000.00", ""],
                &["garbage", "IBKR", "Portfolio", "1100", ""],
                &["20/01/2024", "Coinbase", "BTC", "", "0.5"],
                &["20/01/2024", "Coinbase", "BTC", "2,500", "abc"],
            ],
        );

        let (records, report) = load_snapshots(&table, &AllowedValues::new()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_kept, 2);
        assert_eq!(report.rows_dropped, 2);
        assert_eq!(report.warnings.len(), 3);
        assert_eq!(records[0].value, 1000.0);
        assert_eq!(records[0].asset_type, AssetType::Other);
        assert_eq!(records[1].token_amount, None);
        assert_eq!(
            report.warnings[0],
            RowWarning {
                row: 1,
                column: "Timestamp".to_string(),
                kind: WarningKind::InvalidTimestamp("garbage".to_string()),
            }
        );
    }

    #[test]
    fn test_missing_value_is_never_zero() {
        let table = RawTable::new(
            "Balance Sheet",
            &["Timestamp", "Platform", "Asset", "Value"],
            &[&["2024-01-05", "HSBC", "Saver", "  "]],
        );
        let (records, report) = load_snapshots(&table, &AllowedValues::new()).unwrap();
        assert!(records.is_empty());
        assert_eq!(report.warnings[0].kind, WarningKind::MissingValue);
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let table = RawTable::new("Balance Sheet", &["Date", "Amount"], &[&["2024-01-01", "1"]]);
        match load_snapshots(&table, &AllowedValues::new()) {
            Err(PortfolioError::SchemaMismatch { missing, .. }) => {
                assert_eq!(missing, vec!["Platform", "Asset", "Value", "Timestamp"]);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_values_warn_without_dropping() {
        let mut allowed = BTreeMap::new();
        allowed.insert("Platform".to_string(), vec!["IBKR".to_string()]);

        let table = RawTable::new(
            "Balance Sheet",
            &["Timestamp", "Platform", "Asset", "Value"],
            &[&["2024-01-05", "Revolut", "Vault", "50"]],
        );
        let (records, report) = load_snapshots(&table, &allowed).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            report.warnings[0].kind,
            WarningKind::UnexpectedValue("Revolut".to_string())
        );
    }

    #[test]
    fn test_load_cashflows() {
        let table = RawTable::new(
            "Pension Cashflows",
            &["Timestamp", "Platform", "Asset", "Value", "Cashflow Type", "Description"],
            &[
                &["2024-01-31", "Wahed", "Wahed SIPP", "500", "Contribution", "Monthly"],
                &["2024-01-31", "Wahed", "Wahed SIPP", "12.5", "Fee", ""],
                &["2024-02-29", "Wahed", "Wahed SIPP", "500", "", ""],
            ],
        );
        let (records, report) = load_cashflows(&table, &AllowedValues::new()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(records[0].cashflow_type, CashflowType::Contribution);
        assert_eq!(records[0].description.as_deref(), Some("Monthly"));
        assert_eq!(records[1].description, None);
    }

    #[test]
    fn test_load_vehicle_states_flags_unknown_status() {
        let table = RawTable::new(
            "Car Assets",
            &["Timestamp", "Asset", "Car_Value", "Loan_Balance", "Loan_Status", "Mileage"],
            &[&["2024-01-31", "Taycan", "70,000", "40,000", "Leased", "12000"]],
        );
        let (records, report) = load_vehicle_states(&table, &AllowedValues::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].loan_status, None);
        assert_eq!(records[0].mileage, Some(12000.0));
        assert_eq!(
            report.warnings[0].kind,
            WarningKind::InvalidCategory("Leased".to_string())
        );
    }

    #[test]
    fn test_padded_headers_still_match() {
        let table = RawTable::new(
            "Balance Sheet",
            &["Platform", "Asset", "Value ", " Timestamp"],
            &[&["Monzo", "Current Account", "250", "2024-01-31"]],
        );
        let (records, report) = load_snapshots(&table, &AllowedValues::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 250.0);
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_undecodable_row_is_dropped_and_reported() {
        let garbled = format!("Mon{}zo", char::REPLACEMENT_CHARACTER);
        let table = RawTable::new(
            "Balance Sheet",
            &["Timestamp", "Platform", "Asset", "Value"],
            &[
                &["2024-01-31", "Monzo", "Current Account", "100"],
                &["2024-02-29", garbled.as_str(), "Current Account", "110"],
            ],
        );
        let (records, report) = load_snapshots(&table, &AllowedValues::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(report.warnings[0].row, 1);
        assert_eq!(report.warnings[0].column, "Platform");
        assert_eq!(report.warnings[0].kind, WarningKind::InvalidEncoding(garbled));
    }

    #[test]
    fn test_allowed_values_apply_to_vehicle_feeds() {
        let mut allowed = AllowedValues::new();
        allowed.insert(
            "Expense_Type".to_string(),
            vec!["Fuel".to_string(), "Insurance".to_string()],
        );
        let table = RawTable::new(
            "Car Expenses",
            &["Timestamp", "Asset", "Amount", "Expense_Type"],
            &[
                &["2024-01-10", "Golf", "60", "Fuel"],
                &["2024-01-12", "Golf", "15", "Snacks"],
            ],
        );
        let (records, report) = load_vehicle_expenses(&table, &allowed).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(
            report.warnings[0].kind,
            WarningKind::UnexpectedValue("Snacks".to_string())
        );
    }

    #[test]
    fn test_table_spec_lookup() {
        let spec = TableSpec::find("Car Assets").unwrap();
        assert!(spec.has_column("Loan_Status"));
        assert!(!spec.has_column("Amount"));
        assert!(TableSpec::find("Crypto Wallets").is_none());
    }

    #[test]
    fn test_in_memory_source_missing_table() {
        let source = InMemorySource::new("mem");
        assert!(matches!(
            source.fetch(&BALANCE_SHEET),
            Err(PortfolioError::SourceUnavailable(_))
        ));
    }

    struct SlowSource;

    impl RecordSource for SlowSource {
        fn source_id(&self) -> &str {
            "slow"
        }

        fn fetch(&self, _spec: &TableSpec) -> Result<RawTable> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(RawTable::default())
        }
    }

    #[test]
    fn test_fetch_with_timeout() {
        let result = fetch_with_timeout(Arc::new(SlowSource), BALANCE_SHEET, Duration::from_millis(20));
        assert!(matches!(result, Err(PortfolioError::SourceTimeout { .. })));

        let source = InMemorySource::new("mem").with_table(RawTable::new(
            "Balance Sheet",
            &["Timestamp", "Platform", "Asset", "Value"],
            &[],
        ));
        let table = fetch_with_timeout(Arc::new(source), BALANCE_SHEET, Duration::from_secs(5)).unwrap();
        assert_eq!(table.headers.len(), 4);
    }

    #[test]
    fn test_filter_by_date_range() {
        let record = |d: NaiveDate| SnapshotRecord {
            platform: "P".to_string(),
            asset_name: "A".to_string(),
            asset_type: AssetType::Cash,
            value: 1.0,
            timestamp: d,
            token_amount: None,
        };
        let records = vec![record(date(2024, 1, 1)), record(date(2024, 2, 1)), record(date(2024, 3, 1))];
        let filtered = filter_by_date_range(&records, Some(date(2024, 1, 15)), Some(date(2024, 3, 1)));
        assert_eq!(filtered.len(), 2);
        assert_eq!(filter_by_date_range(&records, None, None).len(), 3);
    }
}
