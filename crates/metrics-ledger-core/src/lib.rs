use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

/// 1-based physical row of the first data row; row 1 holds the header.
pub const FIRST_DATA_ROW: u32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl Display for WriteOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("a record already exists for date {date} and unit {unit_id}")]
    DuplicateRecord { date: String, unit_id: String },
    #[error("rowIndex is required")]
    MissingIdentifier,
    #[error("no record at row {0}")]
    RecordNotFound(u32),
    #[error("tab not found in spreadsheet: {0}")]
    TabNotFound(String),
    #[error("row {0} no longer holds the expected record")]
    StaleRowIndex(u32),
    #[error("invalid date format: {0:?}")]
    InvalidDateFormat(String),
    #[error("invalid value for field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("invalid request payload: {0}")]
    InvalidPayload(String),
    #[error("store read failed: {0}")]
    StoreRead(String),
    #[error("store {op} failed: {message}")]
    StoreWrite { op: WriteOp, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DuplicateRecord { .. } | Self::StaleRowIndex(_) => 409,
            Self::MissingIdentifier
            | Self::InvalidDateFormat(_)
            | Self::InvalidField { .. }
            | Self::InvalidPayload(_) => 400,
            Self::RecordNotFound(_) | Self::TabNotFound(_) => 404,
            Self::StoreRead(_) | Self::StoreWrite { .. } | Self::Internal(_) => 500,
        }
    }

    /// Short localized message shown to the person filling the form.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::DuplicateRecord { .. } => {
                "Já existe um registro para esta data e unidade".to_string()
            }
            Self::MissingIdentifier => "Índice da linha é obrigatório".to_string(),
            Self::RecordNotFound(_) => "Registro não encontrado".to_string(),
            Self::TabNotFound(_) => "Aba não encontrada na planilha".to_string(),
            Self::StaleRowIndex(_) => {
                "O registro foi alterado por outro usuário; recarregue a lista".to_string()
            }
            Self::InvalidDateFormat(_) => "Formato de data inválido".to_string(),
            Self::InvalidField { field, .. } => format!("Valor inválido para o campo {field}"),
            Self::InvalidPayload(_) => "Requisição inválida".to_string(),
            Self::StoreRead(_) => "Erro ao ler dados da planilha".to_string(),
            Self::StoreWrite { op, .. } => match op {
                WriteOp::Create => "Erro ao salvar dados na planilha".to_string(),
                WriteOp::Update => "Erro ao atualizar dados na planilha".to_string(),
                WriteOp::Delete => "Erro ao excluir registro da planilha".to_string(),
            },
            Self::Internal(_) => "Erro interno".to_string(),
        }
    }

    fn invalid_field(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField { field: field.to_string(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

fn split_date_parts(value: &str, separator: char) -> Result<[&str; 3], LedgerError> {
    let mut parts = value.trim().split(separator);
    let (Some(first), Some(second), Some(third), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(LedgerError::InvalidDateFormat(value.to_string()));
    };

    let numeric = [first, second, third]
        .iter()
        .all(|part| !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit()));
    if !numeric {
        return Err(LedgerError::InvalidDateFormat(value.to_string()));
    }

    Ok([first, second, third])
}

/// Convert a date-picker value (`YYYY-MM-DD`) into the stored `DD/MM/YYYY` form.
///
/// # Errors
/// Returns [`LedgerError::InvalidDateFormat`] unless the value has exactly three
/// numeric parts separated by `-`.
pub fn iso_to_display(value: &str) -> Result<String, LedgerError> {
    let [year, month, day] = split_date_parts(value, '-')?;
    Ok(format!("{day:0>2}/{month:0>2}/{year}"))
}

/// Convert a stored `DD/MM/YYYY` date into the `YYYY-MM-DD` date-picker form.
///
/// # Errors
/// Returns [`LedgerError::InvalidDateFormat`] unless the value has exactly three
/// numeric parts separated by `/`.
pub fn display_to_iso(value: &str) -> Result<String, LedgerError> {
    let [day, month, year] = split_date_parts(value, '/')?;
    Ok(format!("{year}-{month:0>2}-{day:0>2}"))
}

/// Bring a date in either representation to the canonical stored form.
///
/// Values containing `-` are read as `YYYY-MM-DD`; everything else must be
/// `DD/MM/YYYY`, with single-digit day or month allowed. The year must have four
/// digits and the result must be a real calendar date.
///
/// # Errors
/// Returns [`LedgerError::InvalidDateFormat`] when neither form parses.
pub fn normalize_date(value: &str) -> Result<String, LedgerError> {
    let [day, month, year] = if value.contains('-') {
        let [year, month, day] = split_date_parts(value, '-')?;
        [day, month, year]
    } else {
        split_date_parts(value, '/')?
    };
    if year.len() != 4 || day.len() > 2 || month.len() > 2 {
        return Err(LedgerError::InvalidDateFormat(value.to_string()));
    }
    calendar_date(year, month, day)
        .map(format_display_date)
        .ok_or_else(|| LedgerError::InvalidDateFormat(value.to_string()))
}

fn calendar_date(year: &str, month: &str, day: &str) -> Option<Date> {
    let year = year.parse::<i32>().ok()?;
    let month = Month::try_from(month.parse::<u8>().ok()?).ok()?;
    let day = day.parse::<u8>().ok()?;
    Date::from_calendar_date(year, month, day).ok()
}

/// Parse a stored `DD/MM/YYYY` value into a calendar date.
#[must_use]
pub fn parse_display_date(value: &str) -> Option<Date> {
    let [day, month, year] = split_date_parts(value, '/').ok()?;
    calendar_date(year, month, day)
}

/// Parse a `YYYY-MM-DD` filter bound into a calendar date.
///
/// # Errors
/// Returns [`LedgerError::InvalidDateFormat`] for malformed or impossible dates.
pub fn parse_iso_date(value: &str) -> Result<Date, LedgerError> {
    let [year, month, day] = split_date_parts(value, '-')?;
    calendar_date(year, month, day).ok_or_else(|| LedgerError::InvalidDateFormat(value.to_string()))
}

#[must_use]
pub fn format_display_date(date: Date) -> String {
    format!("{:02}/{:02}/{}", date.day(), u8::from(date.month()), date.year())
}

#[must_use]
pub fn today_display() -> String {
    format_display_date(OffsetDateTime::now_utc().date())
}

// ---------------------------------------------------------------------------
// Cells and table layout
// ---------------------------------------------------------------------------

/// One value written to the spreadsheet. Numbers stay numbers so the sheet can sum them.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Number(u64),
    Text(String),
}

impl CellValue {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(text) if text.is_empty())
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    DailyMetrics,
    PlanMetrics,
}

const DAILY_METRIC_FIELDS: &[&str] = &[
    "leadsReceived",
    "trialsScheduled",
    "classesHeld",
    "sales",
    "partnerAScheduled",
    "partnerAAttended",
    "partnerBScheduled",
    "partnerBAttended",
];

const PLAN_METRIC_FIELDS: &[&str] =
    &["delinquentCount", "planCount", "partnerBCount", "partnerACount"];

impl TableKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DailyMetrics => "daily_metrics",
            Self::PlanMetrics => "plan_metrics",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily_metrics" => Some(Self::DailyMetrics),
            "plan_metrics" => Some(Self::PlanMetrics),
            _ => None,
        }
    }

    /// Wire names of the metric columns, in column order starting at C.
    #[must_use]
    pub fn metric_fields(self) -> &'static [&'static str] {
        match self {
            Self::DailyMetrics => DAILY_METRIC_FIELDS,
            Self::PlanMetrics => PLAN_METRIC_FIELDS,
        }
    }

    #[must_use]
    pub fn column_count(self) -> usize {
        2 + self.metric_fields().len()
    }

    #[must_use]
    pub fn last_column(self) -> char {
        match self {
            Self::DailyMetrics => 'J',
            Self::PlanMetrics => 'F',
        }
    }

    #[must_use]
    pub fn header_row(self) -> Vec<CellValue> {
        ["date", "unitId"]
            .iter()
            .chain(self.metric_fields())
            .map(|name| CellValue::text(*name))
            .collect()
    }
}

impl Display for TableKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the tabs backing each logical table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SheetLayout {
    pub daily_tab: String,
    pub plan_tab: String,
    pub units_tab: String,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            daily_tab: "Comercial".to_string(),
            plan_tab: "app".to_string(),
            units_tab: "Unidades".to_string(),
        }
    }
}

impl SheetLayout {
    #[must_use]
    pub fn tab(&self, kind: TableKind) -> &str {
        match kind {
            TableKind::DailyMetrics => &self.daily_tab,
            TableKind::PlanMetrics => &self.plan_tab,
        }
    }
}

// ---------------------------------------------------------------------------
// Request payload validation
// ---------------------------------------------------------------------------

/// A metric as sent by a form: either a JSON number or a numeric string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CountValue {
    Number(serde_json::Number),
    Text(String),
}

impl From<u64> for CountValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

/// Coerce an optional form value into a non-negative integer. Absent and empty mean 0.
///
/// # Errors
/// Returns [`LedgerError::InvalidField`] for negative, fractional, or non-numeric input.
pub fn coerce_count(field: &str, value: Option<&CountValue>) -> Result<u64, LedgerError> {
    match value {
        None => Ok(0),
        Some(CountValue::Number(number)) => number
            .as_u64()
            .ok_or_else(|| LedgerError::invalid_field(field, "must be a non-negative integer")),
        Some(CountValue::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed
                .parse::<u64>()
                .map_err(|_| LedgerError::invalid_field(field, "must be a non-negative integer"))
        }
    }
}

fn require_unit_id(value: Option<String>) -> Result<String, LedgerError> {
    let unit_id = value.map(|value| value.trim().to_string()).unwrap_or_default();
    if unit_id.is_empty() {
        return Err(LedgerError::invalid_field("unitId", "must be provided"));
    }
    Ok(unit_id)
}

fn require_row_index(value: Option<u32>) -> Result<u32, LedgerError> {
    match value {
        None | Some(0) => Err(LedgerError::MissingIdentifier),
        Some(row_index) => Ok(row_index),
    }
}

fn reject_row_index(value: Option<u32>) -> Result<(), LedgerError> {
    if value.is_some() {
        return Err(LedgerError::invalid_field("rowIndex", "is assigned by the store on create"));
    }
    Ok(())
}

fn create_date(value: Option<&str>, today: &str) -> Result<String, LedgerError> {
    match value.map(str::trim) {
        None | Some("") => Ok(today.to_string()),
        Some(date) => normalize_date(date),
    }
}

fn update_date(value: Option<&str>) -> Result<String, LedgerError> {
    match value.map(str::trim) {
        None | Some("") => Err(LedgerError::invalid_field("date", "must be provided")),
        Some(date) => normalize_date(date),
    }
}

fn text_cell(row: &[String], index: usize) -> String {
    row.get(index).cloned().unwrap_or_default()
}

fn metric_cell(row: &[String], index: usize) -> String {
    match row.get(index) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => "0".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// The uniqueness key of a record within its table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RecordKey<'a> {
    pub date: &'a str,
    pub unit_id: &'a str,
}

/// Table-independent view of a decoded row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordView<'a> {
    pub row_index: u32,
    pub date: &'a str,
    pub unit_id: &'a str,
    pub metrics: Vec<&'a str>,
}

/// Schema and codec of one logical table.
pub trait MetricsTable: Send + Sync + 'static {
    const KIND: TableKind;

    type Payload: Serialize + DeserializeOwned + Clone + Debug + Send + 'static;
    type Input: Clone + Debug + PartialEq + Send + 'static;
    type Record: Serialize + DeserializeOwned + Clone + Debug + PartialEq + Send + 'static;

    /// Validate a create payload; `today` (`DD/MM/YYYY`) fills a missing date.
    ///
    /// # Errors
    /// Returns a 4xx-class [`LedgerError`] when the payload is not acceptable.
    fn validate_create(payload: Self::Payload, today: &str) -> Result<Self::Input, LedgerError>;

    /// Validate an update payload and return its target row alongside the new content.
    ///
    /// # Errors
    /// Returns [`LedgerError::MissingIdentifier`] before any other check when
    /// `rowIndex` is absent or zero.
    fn validate_update(payload: Self::Payload) -> Result<(u32, Self::Input), LedgerError>;

    fn key(input: &Self::Input) -> RecordKey<'_>;

    fn to_row(input: &Self::Input) -> Vec<CellValue>;

    fn from_row(row: &[String], row_index: u32) -> Self::Record;

    fn view(record: &Self::Record) -> RecordView<'_>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DailyMetrics;

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanMetrics;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DailyMetricsPayload {
    #[serde(default)]
    pub row_index: Option<u32>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "unidade")]
    pub unit_id: Option<String>,
    #[serde(default, alias = "leadsRecebidos")]
    pub leads_received: Option<CountValue>,
    #[serde(default, alias = "experimentaisAgendadas")]
    pub trials_scheduled: Option<CountValue>,
    #[serde(default, alias = "aulasRealizadas")]
    pub classes_held: Option<CountValue>,
    #[serde(default, alias = "vendas")]
    pub sales: Option<CountValue>,
    #[serde(default, alias = "totalpassAgendamentos")]
    pub partner_a_scheduled: Option<CountValue>,
    #[serde(default, alias = "totalpassPresencas")]
    pub partner_a_attended: Option<CountValue>,
    #[serde(default, alias = "wellhubAgendamentos")]
    pub partner_b_scheduled: Option<CountValue>,
    #[serde(default, alias = "wellhubPresenca")]
    pub partner_b_attended: Option<CountValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyMetricsInput {
    pub date: String,
    pub unit_id: String,
    pub leads_received: u64,
    pub trials_scheduled: u64,
    pub classes_held: u64,
    pub sales: u64,
    pub partner_a_scheduled: u64,
    pub partner_a_attended: u64,
    pub partner_b_scheduled: u64,
    pub partner_b_attended: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DailyMetricsRecord {
    pub row_index: u32,
    pub date: String,
    pub unit_id: String,
    pub leads_received: String,
    pub trials_scheduled: String,
    pub classes_held: String,
    pub sales: String,
    pub partner_a_scheduled: String,
    pub partner_a_attended: String,
    pub partner_b_scheduled: String,
    pub partner_b_attended: String,
}

impl DailyMetricsPayload {
    fn into_input(self, date: String) -> Result<DailyMetricsInput, LedgerError> {
        Ok(DailyMetricsInput {
            date,
            unit_id: require_unit_id(self.unit_id)?,
            leads_received: coerce_count("leadsReceived", self.leads_received.as_ref())?,
            trials_scheduled: coerce_count("trialsScheduled", self.trials_scheduled.as_ref())?,
            classes_held: coerce_count("classesHeld", self.classes_held.as_ref())?,
            sales: coerce_count("sales", self.sales.as_ref())?,
            partner_a_scheduled: coerce_count(
                "partnerAScheduled",
                self.partner_a_scheduled.as_ref(),
            )?,
            partner_a_attended: coerce_count("partnerAAttended", self.partner_a_attended.as_ref())?,
            partner_b_scheduled: coerce_count(
                "partnerBScheduled",
                self.partner_b_scheduled.as_ref(),
            )?,
            partner_b_attended: coerce_count("partnerBAttended", self.partner_b_attended.as_ref())?,
        })
    }
}

impl MetricsTable for DailyMetrics {
    const KIND: TableKind = TableKind::DailyMetrics;

    type Payload = DailyMetricsPayload;
    type Input = DailyMetricsInput;
    type Record = DailyMetricsRecord;

    fn validate_create(payload: Self::Payload, today: &str) -> Result<Self::Input, LedgerError> {
        reject_row_index(payload.row_index)?;
        let date = create_date(payload.date.as_deref(), today)?;
        payload.into_input(date)
    }

    fn validate_update(payload: Self::Payload) -> Result<(u32, Self::Input), LedgerError> {
        let row_index = require_row_index(payload.row_index)?;
        let date = update_date(payload.date.as_deref())?;
        Ok((row_index, payload.into_input(date)?))
    }

    fn key(input: &Self::Input) -> RecordKey<'_> {
        RecordKey { date: &input.date, unit_id: &input.unit_id }
    }

    fn to_row(input: &Self::Input) -> Vec<CellValue> {
        vec![
            CellValue::text(input.date.as_str()),
            CellValue::text(input.unit_id.as_str()),
            CellValue::Number(input.leads_received),
            CellValue::Number(input.trials_scheduled),
            CellValue::Number(input.classes_held),
            CellValue::Number(input.sales),
            CellValue::Number(input.partner_a_scheduled),
            CellValue::Number(input.partner_a_attended),
            CellValue::Number(input.partner_b_scheduled),
            CellValue::Number(input.partner_b_attended),
        ]
    }

    fn from_row(row: &[String], row_index: u32) -> Self::Record {
        DailyMetricsRecord {
            row_index,
            date: text_cell(row, 0),
            unit_id: text_cell(row, 1),
            leads_received: metric_cell(row, 2),
            trials_scheduled: metric_cell(row, 3),
            classes_held: metric_cell(row, 4),
            sales: metric_cell(row, 5),
            partner_a_scheduled: metric_cell(row, 6),
            partner_a_attended: metric_cell(row, 7),
            partner_b_scheduled: metric_cell(row, 8),
            partner_b_attended: metric_cell(row, 9),
        }
    }

    fn view(record: &Self::Record) -> RecordView<'_> {
        RecordView {
            row_index: record.row_index,
            date: &record.date,
            unit_id: &record.unit_id,
            metrics: vec![
                record.leads_received.as_str(),
                record.trials_scheduled.as_str(),
                record.classes_held.as_str(),
                record.sales.as_str(),
                record.partner_a_scheduled.as_str(),
                record.partner_a_attended.as_str(),
                record.partner_b_scheduled.as_str(),
                record.partner_b_attended.as_str(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanMetricsPayload {
    #[serde(default)]
    pub row_index: Option<u32>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "unidade")]
    pub unit_id: Option<String>,
    #[serde(default, alias = "inadimplentes")]
    pub delinquent_count: Option<CountValue>,
    #[serde(default, alias = "plano")]
    pub plan_count: Option<CountValue>,
    #[serde(default, alias = "wellhub")]
    pub partner_b_count: Option<CountValue>,
    #[serde(default, alias = "totalpass")]
    pub partner_a_count: Option<CountValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanMetricsInput {
    pub date: String,
    pub unit_id: String,
    pub delinquent_count: u64,
    pub plan_count: u64,
    pub partner_b_count: u64,
    pub partner_a_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetricsRecord {
    pub row_index: u32,
    pub date: String,
    pub unit_id: String,
    pub delinquent_count: String,
    pub plan_count: String,
    pub partner_b_count: String,
    pub partner_a_count: String,
}

impl PlanMetricsPayload {
    fn into_input(self, date: String) -> Result<PlanMetricsInput, LedgerError> {
        Ok(PlanMetricsInput {
            date,
            unit_id: require_unit_id(self.unit_id)?,
            delinquent_count: coerce_count("delinquentCount", self.delinquent_count.as_ref())?,
            plan_count: coerce_count("planCount", self.plan_count.as_ref())?,
            partner_b_count: coerce_count("partnerBCount", self.partner_b_count.as_ref())?,
            partner_a_count: coerce_count("partnerACount", self.partner_a_count.as_ref())?,
        })
    }
}

impl MetricsTable for PlanMetrics {
    const KIND: TableKind = TableKind::PlanMetrics;

    type Payload = PlanMetricsPayload;
    type Input = PlanMetricsInput;
    type Record = PlanMetricsRecord;

    fn validate_create(payload: Self::Payload, today: &str) -> Result<Self::Input, LedgerError> {
        reject_row_index(payload.row_index)?;
        let date = create_date(payload.date.as_deref(), today)?;
        payload.into_input(date)
    }

    fn validate_update(payload: Self::Payload) -> Result<(u32, Self::Input), LedgerError> {
        let row_index = require_row_index(payload.row_index)?;
        let date = update_date(payload.date.as_deref())?;
        Ok((row_index, payload.into_input(date)?))
    }

    fn key(input: &Self::Input) -> RecordKey<'_> {
        RecordKey { date: &input.date, unit_id: &input.unit_id }
    }

    fn to_row(input: &Self::Input) -> Vec<CellValue> {
        vec![
            CellValue::text(input.date.as_str()),
            CellValue::text(input.unit_id.as_str()),
            CellValue::Number(input.delinquent_count),
            CellValue::Number(input.plan_count),
            CellValue::Number(input.partner_b_count),
            CellValue::Number(input.partner_a_count),
        ]
    }

    fn from_row(row: &[String], row_index: u32) -> Self::Record {
        PlanMetricsRecord {
            row_index,
            date: text_cell(row, 0),
            unit_id: text_cell(row, 1),
            delinquent_count: metric_cell(row, 2),
            plan_count: metric_cell(row, 3),
            partner_b_count: metric_cell(row, 4),
            partner_a_count: metric_cell(row, 5),
        }
    }

    fn view(record: &Self::Record) -> RecordView<'_> {
        RecordView {
            row_index: record.row_index,
            date: &record.date,
            unit_id: &record.unit_id,
            metrics: vec![
                record.delinquent_count.as_str(),
                record.plan_count.as_str(),
                record.partner_b_count.as_str(),
                record.partner_a_count.as_str(),
            ],
        }
    }
}

/// Decode every data row returned for `Tab!A2:<last>` in store order.
#[must_use]
pub fn decode_rows<T: MetricsTable>(rows: &[Vec<String>]) -> Vec<T::Record> {
    rows.iter().zip(FIRST_DATA_ROW..).map(|(row, row_index)| T::from_row(row, row_index)).collect()
}

/// A row in the units tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: String,
    #[serde(alias = "nome")]
    pub display_name: String,
}

impl Unit {
    /// Rows missing either the id or the name cell are not units.
    #[must_use]
    pub fn from_row(row: &[String]) -> Option<Self> {
        match (row.first(), row.get(1)) {
            (Some(id), Some(display_name)) if !id.is_empty() && !display_name.is_empty() => {
                Some(Self { id: id.clone(), display_name: display_name.clone() })
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// List views
// ---------------------------------------------------------------------------

/// Date order for list views. Without one, records keep sheet order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListQuery {
    #[serde(default)]
    pub unit_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub order: Option<SortOrder>,
}

impl ListQuery {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unit_id.is_none() && self.from.is_none() && self.to.is_none() && self.order.is_none()
    }
}

fn optional_bound(value: Option<&str>) -> Result<Option<Date>, LedgerError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(date) => parse_iso_date(date).map(Some),
    }
}

/// Rows whose stored date does not parse sort and filter as 01/01/1970.
fn sort_date(date: &str) -> Date {
    parse_display_date(date).unwrap_or(OffsetDateTime::UNIX_EPOCH.date())
}

/// Filter by unit and inclusive date range, then sort by date when an order is requested.
///
/// # Errors
/// Returns [`LedgerError::InvalidDateFormat`] when a range bound is not `YYYY-MM-DD`.
pub fn apply_list_query<T: MetricsTable>(
    records: Vec<T::Record>,
    query: &ListQuery,
) -> Result<Vec<T::Record>, LedgerError> {
    let from = optional_bound(query.from.as_deref())?;
    let to = optional_bound(query.to.as_deref())?;
    let unit_id = query.unit_id.as_deref().map(str::trim).filter(|unit| !unit.is_empty());

    let mut selected = records
        .into_iter()
        .filter(|record| {
            let view = T::view(record);
            if unit_id.is_some_and(|unit| view.unit_id != unit) {
                return false;
            }
            let date = sort_date(view.date);
            from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
        })
        .collect::<Vec<_>>();

    if let Some(order) = query.order {
        selected.sort_by(|left, right| {
            let ordering: Ordering = sort_date(T::view(left).date).cmp(&sort_date(T::view(right).date));
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
    }

    Ok(selected)
}

/// Sum each metric column across `records`; cells that are not integers count as 0.
#[must_use]
pub fn metric_totals<T: MetricsTable>(records: &[T::Record]) -> BTreeMap<&'static str, u64> {
    let mut totals = T::KIND
        .metric_fields()
        .iter()
        .map(|field| (*field, 0_u64))
        .collect::<BTreeMap<_, _>>();

    for record in records {
        let view = T::view(record);
        for (field, value) in T::KIND.metric_fields().iter().zip(view.metrics) {
            let amount = value.trim().parse::<u64>().unwrap_or(0);
            if let Some(total) = totals.get_mut(field) {
                *total = total.saturating_add(amount);
            }
        }
    }

    totals
}
