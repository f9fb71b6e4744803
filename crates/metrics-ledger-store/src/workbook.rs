use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics_ledger_core::{CellValue, SheetLayout, TableKind};
use serde::{Deserialize, Serialize};

use crate::{A1Range, SheetStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkbookTab {
    pub sheet_id: i64,
    /// Physical rows; index 0 is row 1.
    pub rows: Vec<Vec<String>>,
}

/// Plain-data workbook with spreadsheet-like range semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkbookData {
    pub tabs: BTreeMap<String, WorkbookTab>,
}

fn trim_row(row: &mut Vec<String>) {
    while row.last().is_some_and(String::is_empty) {
        row.pop();
    }
}

fn trim_rows(rows: &mut Vec<Vec<String>>) {
    for row in rows.iter_mut() {
        trim_row(row);
    }
    while rows.last().is_some_and(Vec::is_empty) {
        rows.pop();
    }
}

fn text_row(cells: &[CellValue]) -> Vec<String> {
    cells.iter().map(ToString::to_string).collect()
}

fn row_offset(row: u32) -> Result<usize> {
    let row = usize::try_from(row).context("row number out of range")?;
    row.checked_sub(1).ok_or_else(|| anyhow!("row numbers start at 1"))
}

impl WorkbookData {
    /// An empty workbook holding the ledger tabs with their header rows.
    #[must_use]
    pub fn with_layout(layout: &SheetLayout) -> Self {
        let mut data = Self::default();
        for kind in [TableKind::DailyMetrics, TableKind::PlanMetrics] {
            data.add_tab(layout.tab(kind)).rows.push(text_row(&kind.header_row()));
        }
        data.add_tab(&layout.units_tab).rows.push(vec!["id".to_string(), "name".to_string()]);
        data
    }

    /// Add a tab, or return the existing one with that title.
    pub fn add_tab(&mut self, title: &str) -> &mut WorkbookTab {
        let next_id = self.tabs.values().map(|tab| tab.sheet_id + 1).max().unwrap_or(0);
        self.tabs
            .entry(title.to_string())
            .or_insert_with(|| WorkbookTab { sheet_id: next_id, rows: Vec::new() })
    }

    /// Append data rows below the current content of `title`.
    ///
    /// # Errors
    /// Returns an error when the tab does not exist.
    pub fn push_rows(&mut self, title: &str, rows: &[&[&str]]) -> Result<()> {
        let tab = self.tabs.get_mut(title).ok_or_else(|| anyhow!("unknown tab {title}"))?;
        tab.rows.extend(rows.iter().map(|row| row.iter().map(|cell| (*cell).to_string()).collect()));
        trim_rows(&mut tab.rows);
        Ok(())
    }

    fn tab(&self, title: &str) -> Result<&WorkbookTab> {
        self.tabs.get(title).ok_or_else(|| anyhow!("unable to parse range: tab {title} does not exist"))
    }

    fn read(&self, range: &A1Range) -> Result<Vec<Vec<String>>> {
        let tab = self.tab(&range.tab)?;
        let (first_col, last_col) = range.column_span();
        let start = row_offset(range.first_row)?;
        let end = match range.last_row {
            Some(last_row) => row_offset(last_row)?.saturating_add(1).min(tab.rows.len()),
            None => tab.rows.len(),
        };

        let mut rows = tab
            .rows
            .get(start..end.max(start))
            .unwrap_or_default()
            .iter()
            .map(|row| {
                row.iter().skip(first_col).take(last_col + 1 - first_col).cloned().collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        trim_rows(&mut rows);
        Ok(rows)
    }

    fn write(&mut self, range: &A1Range, values: &[Vec<CellValue>]) -> Result<()> {
        let (first_col, last_col) = range.column_span();
        let start = row_offset(range.first_row)?;
        let tab = self
            .tabs
            .get_mut(&range.tab)
            .ok_or_else(|| anyhow!("unable to parse range: tab {} does not exist", range.tab))?;

        for (offset, cells) in values.iter().enumerate() {
            if cells.len() > last_col + 1 - first_col {
                return Err(anyhow!("row of {} cells does not fit range {range}", cells.len()));
            }
            let target = start + offset;
            if tab.rows.len() <= target {
                tab.rows.resize_with(target + 1, Vec::new);
            }
            let row = &mut tab.rows[target];
            if row.len() < first_col + cells.len() {
                row.resize(first_col + cells.len(), String::new());
            }
            for (column, cell) in cells.iter().enumerate() {
                row[first_col + column] = cell.to_string();
            }
        }

        trim_rows(&mut tab.rows);
        Ok(())
    }

    fn sheet_id(&self, title: &str) -> Option<i64> {
        self.tabs.get(title).map(|tab| tab.sheet_id)
    }

    fn delete_rows(&mut self, sheet_id: i64, start_index: u32, end_index: u32) -> Result<()> {
        let tab = self
            .tabs
            .values_mut()
            .find(|tab| tab.sheet_id == sheet_id)
            .ok_or_else(|| anyhow!("no sheet with id {sheet_id}"))?;
        let start = usize::try_from(start_index).context("start index out of range")?;
        let end = usize::try_from(end_index).context("end index out of range")?;
        if start >= end {
            return Err(anyhow!("empty row range {start_index}..{end_index}"));
        }
        if start < tab.rows.len() {
            tab.rows.drain(start..end.min(tab.rows.len()));
        }
        Ok(())
    }
}

/// In-process workbook. Counts write calls so callers can assert that a rejected
/// operation left the store untouched.
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    data: Mutex<WorkbookData>,
    writes: AtomicUsize,
}

impl MemoryWorkbook {
    #[must_use]
    pub fn new(data: WorkbookData) -> Self {
        Self { data: Mutex::new(data), writes: AtomicUsize::new(0) }
    }

    #[must_use]
    pub fn with_layout(layout: &SheetLayout) -> Self {
        Self::new(WorkbookData::with_layout(layout))
    }

    /// # Errors
    /// Returns an error when the workbook lock is poisoned.
    pub fn snapshot(&self) -> Result<WorkbookData> {
        Ok(self.lock()?.clone())
    }

    /// Number of `write_range` and `delete_rows` calls made so far.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WorkbookData>> {
        self.data.lock().map_err(|_| anyhow!("workbook lock poisoned"))
    }
}

impl SheetStore for MemoryWorkbook {
    fn read_range(&self, range: &A1Range) -> Result<Vec<Vec<String>>> {
        self.lock()?.read(range)
    }

    fn write_range(&self, range: &A1Range, rows: &[Vec<CellValue>]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.write(range, rows)
    }

    fn sheet_id(&self, tab: &str) -> Result<Option<i64>> {
        Ok(self.lock()?.sheet_id(tab))
    }

    fn delete_rows(&self, sheet_id: i64, start_index: u32, end_index: u32) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.delete_rows(sheet_id, start_index, end_index)
    }
}

/// Workbook persisted as a JSON file, loaded and saved around every operation.
#[derive(Debug)]
pub struct FileWorkbookStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileWorkbookStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, guard: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a workbook file holding the ledger tabs with headers.
    ///
    /// # Errors
    /// Returns an error when the file exists and `overwrite` is false, or on I/O failure.
    pub fn init(path: &Path, layout: &SheetLayout, overwrite: bool) -> Result<WorkbookData> {
        if path.exists() && !overwrite {
            return Err(anyhow!("workbook already exists at {}", path.display()));
        }
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for workbook {}", path.display())
            })?;
        }
        let data = WorkbookData::with_layout(layout);
        save(path, &data)?;
        Ok(data)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(&self) -> Result<WorkbookData> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read workbook {}", self.path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse workbook {}", self.path.display()))
    }

    fn modify<T>(&self, apply: impl FnOnce(&mut WorkbookData) -> Result<T>) -> Result<T> {
        let _guard = self.guard.lock().map_err(|_| anyhow!("workbook lock poisoned"))?;
        let mut data = self.load()?;
        let value = apply(&mut data)?;
        save(&self.path, &data)?;
        Ok(value)
    }
}

fn save(path: &Path, data: &WorkbookData) -> Result<()> {
    let json = serde_json::to_vec_pretty(data).context("failed to serialize workbook")?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json)
        .with_context(|| format!("failed to write workbook staging file {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to replace workbook {}", path.display()))
}

impl SheetStore for FileWorkbookStore {
    fn read_range(&self, range: &A1Range) -> Result<Vec<Vec<String>>> {
        let _guard = self.guard.lock().map_err(|_| anyhow!("workbook lock poisoned"))?;
        self.load()?.read(range)
    }

    fn write_range(&self, range: &A1Range, rows: &[Vec<CellValue>]) -> Result<()> {
        self.modify(|data| data.write(range, rows))
    }

    fn sheet_id(&self, tab: &str) -> Result<Option<i64>> {
        let _guard = self.guard.lock().map_err(|_| anyhow!("workbook lock poisoned"))?;
        Ok(self.load()?.sheet_id(tab))
    }

    fn delete_rows(&self, sheet_id: i64, start_index: u32, end_index: u32) -> Result<()> {
        self.modify(|data| data.delete_rows(sheet_id, start_index, end_index))
    }
}
