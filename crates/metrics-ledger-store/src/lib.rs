use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use metrics_ledger_core::{CellValue, TableKind, FIRST_DATA_ROW};

mod google;
mod workbook;

pub use google::{GoogleSheetsConfig, GoogleSheetsStore, DEFAULT_SHEETS_API_BASE};
pub use workbook::{FileWorkbookStore, MemoryWorkbook, WorkbookData, WorkbookTab};

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// A rectangular block of a tab in A1 notation, e.g. `Comercial!A2:J`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A1Range {
    pub tab: String,
    pub first_column: char,
    pub last_column: char,
    pub first_row: u32,
    /// `None` leaves the range open to the end of the tab.
    pub last_row: Option<u32>,
}

impl A1Range {
    /// Every data row of a table tab.
    #[must_use]
    pub fn table_rows(tab: &str, kind: TableKind) -> Self {
        Self {
            tab: tab.to_string(),
            first_column: 'A',
            last_column: kind.last_column(),
            first_row: FIRST_DATA_ROW,
            last_row: None,
        }
    }

    /// Exactly one physical row of a table tab.
    #[must_use]
    pub fn table_row(tab: &str, kind: TableKind, row: u32) -> Self {
        Self {
            tab: tab.to_string(),
            first_column: 'A',
            last_column: kind.last_column(),
            first_row: row,
            last_row: Some(row),
        }
    }

    #[must_use]
    pub fn units(tab: &str) -> Self {
        Self {
            tab: tab.to_string(),
            first_column: 'A',
            last_column: 'B',
            first_row: FIRST_DATA_ROW,
            last_row: None,
        }
    }

    /// Zero-based column offsets covered by this range, inclusive.
    #[must_use]
    pub fn column_span(&self) -> (usize, usize) {
        (column_offset(self.first_column), column_offset(self.last_column))
    }
}

fn column_offset(column: char) -> usize {
    let column = column.to_ascii_uppercase();
    if column.is_ascii_uppercase() {
        (u32::from(column) - u32::from('A')) as usize
    } else {
        0
    }
}

fn tab_needs_quotes(tab: &str) -> bool {
    tab.is_empty() || !tab.chars().all(|ch| ch.is_alphanumeric() || ch == '_')
}

impl Display for A1Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if tab_needs_quotes(&self.tab) {
            write!(f, "'{}'", self.tab.replace('\'', "''"))?;
        } else {
            f.write_str(&self.tab)?;
        }
        write!(f, "!{}{}:{}", self.first_column, self.first_row, self.last_column)?;
        if let Some(last_row) = self.last_row {
            write!(f, "{last_row}")?;
        }
        Ok(())
    }
}

/// Cell-level access to a spreadsheet.
///
/// Reads return formatted cell text with trailing empty cells and trailing empty rows
/// omitted. Interior empty rows are returned as empty vectors so that the position of
/// every row still maps to its physical row number.
pub trait SheetStore: Send + Sync {
    /// # Errors
    /// Returns an error when the range cannot be read, including when its tab is missing.
    fn read_range(&self, range: &A1Range) -> Result<Vec<Vec<String>>>;

    /// Overwrite the cells of `range` starting at its top-left corner.
    ///
    /// # Errors
    /// Returns an error when the write is rejected or cannot be delivered.
    fn write_range(&self, range: &A1Range, rows: &[Vec<CellValue>]) -> Result<()>;

    /// Resolve the numeric id of a tab, `None` when no tab has that title.
    ///
    /// # Errors
    /// Returns an error when the workbook metadata cannot be read.
    fn sheet_id(&self, tab: &str) -> Result<Option<i64>>;

    /// Delete physical rows `[start_index, end_index)`, zero-based, shifting later rows up.
    ///
    /// # Errors
    /// Returns an error when the structural update fails.
    fn delete_rows(&self, sheet_id: i64, start_index: u32, end_index: u32) -> Result<()>;
}

/// Where the ledger lives.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// A local JSON workbook file, used for development and tests.
    Workbook { path: PathBuf },
    GoogleSheets(GoogleSheetsConfig),
}

impl StoreBackend {
    /// Pick a backend from the configured values. A spreadsheet id wins over a workbook path.
    ///
    /// # Errors
    /// Returns an error when neither backend is configured or the Google backend lacks a token.
    pub fn resolve(
        workbook: Option<PathBuf>,
        spreadsheet_id: Option<String>,
        access_token: Option<String>,
        http_timeout_secs: u64,
    ) -> Result<Self> {
        match (spreadsheet_id.filter(|id| !id.trim().is_empty()), workbook) {
            (Some(spreadsheet_id), _) => {
                let access_token = access_token
                    .filter(|token| !token.trim().is_empty())
                    .ok_or_else(|| anyhow!("an access token is required for spreadsheet {spreadsheet_id}"))?;
                Ok(Self::GoogleSheets(GoogleSheetsConfig::new(
                    spreadsheet_id,
                    access_token,
                    Duration::from_secs(http_timeout_secs),
                )?))
            }
            (None, Some(path)) => Ok(Self::Workbook { path }),
            (None, None) => Err(anyhow!("configure either a spreadsheet id or a workbook path")),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Workbook { path } => format!("workbook:{}", path.display()),
            Self::GoogleSheets(config) => format!("google-sheets:{}", config.spreadsheet_id),
        }
    }
}

/// Open a handle for `backend`.
///
/// # Errors
/// Returns an error when the Google client cannot be built.
pub fn open_store(backend: &StoreBackend) -> Result<Arc<dyn SheetStore>> {
    match backend {
        StoreBackend::Workbook { path } => Ok(Arc::new(FileWorkbookStore::new(path.clone()))),
        StoreBackend::GoogleSheets(config) => Ok(Arc::new(GoogleSheetsStore::new(config.clone())?)),
    }
}
