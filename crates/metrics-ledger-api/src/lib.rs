use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use metrics_ledger_core::{
    apply_list_query, decode_rows, metric_totals, normalize_date, today_display, LedgerError,
    ListQuery, MetricsTable, SheetLayout, TableKind, Unit, WriteOp, FIRST_DATA_ROW,
};
use metrics_ledger_store::{A1Range, SheetStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateResult {
    pub success: bool,
    /// Physical row the record was written to.
    pub row: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteAck {
    pub success: bool,
}

impl WriteAck {
    const OK: Self = Self { success: true };
}

/// Delete by physical row. `date` and `unitId`, when sent, must still match the row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteRequest {
    #[serde(default)]
    pub row_index: Option<u32>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "unidade")]
    pub unit_id: Option<String>,
}

/// One write lock per logical table. Reads never take it.
#[derive(Debug, Default)]
struct TableLocks {
    daily: Mutex<()>,
    plan: Mutex<()>,
}

impl TableLocks {
    fn acquire(&self, kind: TableKind) -> Result<MutexGuard<'_, ()>, LedgerError> {
        let lock = match kind {
            TableKind::DailyMetrics => &self.daily,
            TableKind::PlanMetrics => &self.plan,
        };
        lock.lock().map_err(|_| LedgerError::Internal(format!("{kind} write lock poisoned")))
    }
}

fn read_failed(err: &anyhow::Error) -> LedgerError {
    LedgerError::StoreRead(format!("{err:#}"))
}

fn write_failed(op: WriteOp, err: &anyhow::Error) -> LedgerError {
    LedgerError::StoreWrite { op, message: format!("{err:#}") }
}

fn target_row(row_index: Option<u32>) -> Result<u32, LedgerError> {
    match row_index {
        None | Some(0) => Err(LedgerError::MissingIdentifier),
        Some(row) if row < FIRST_DATA_ROW => Err(LedgerError::RecordNotFound(row)),
        Some(row) => Ok(row),
    }
}

fn guard_value(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Persistence protocol of the ledger over a [`SheetStore`].
#[derive(Clone)]
pub struct MetricsLedgerApi {
    store: Arc<dyn SheetStore>,
    layout: SheetLayout,
    locks: Arc<TableLocks>,
}

impl Debug for MetricsLedgerApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsLedgerApi").field("layout", &self.layout).finish_non_exhaustive()
    }
}

impl MetricsLedgerApi {
    #[must_use]
    pub fn new(store: Arc<dyn SheetStore>, layout: SheetLayout) -> Self {
        Self { store, layout, locks: Arc::new(TableLocks::default()) }
    }

    #[must_use]
    pub fn layout(&self) -> &SheetLayout {
        &self.layout
    }

    fn read_table_rows(&self, kind: TableKind) -> Result<Vec<Vec<String>>, LedgerError> {
        let range = A1Range::table_rows(self.layout.tab(kind), kind);
        self.store.read_range(&range).map_err(|err| read_failed(&err))
    }

    /// Read the single row at `row_index`; an empty row means there is no record there.
    fn read_existing_row(&self, kind: TableKind, row_index: u32) -> Result<Vec<String>, LedgerError> {
        let range = A1Range::table_row(self.layout.tab(kind), kind, row_index);
        let rows = self.store.read_range(&range).map_err(|err| read_failed(&err))?;
        match rows.into_iter().next() {
            Some(row) if row.iter().any(|cell| !cell.is_empty()) => Ok(row),
            _ => Err(LedgerError::RecordNotFound(row_index)),
        }
    }

    /// Every record of table `T` in store order.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreRead`] when the tab cannot be read.
    pub fn read_all<T: MetricsTable>(&self) -> Result<Vec<T::Record>, LedgerError> {
        let rows = self.read_table_rows(T::KIND)?;
        Ok(decode_rows::<T>(&rows))
    }

    /// Records of table `T` narrowed and ordered by `query`.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidDateFormat`] for malformed range bounds and
    /// [`LedgerError::StoreRead`] when the tab cannot be read.
    pub fn list<T: MetricsTable>(&self, query: &ListQuery) -> Result<Vec<T::Record>, LedgerError> {
        let records = self.read_all::<T>()?;
        apply_list_query::<T>(records, query)
    }

    /// Per-metric sums over the records selected by `query`.
    ///
    /// # Errors
    /// Same as [`MetricsLedgerApi::list`].
    pub fn totals<T: MetricsTable>(
        &self,
        query: &ListQuery,
    ) -> Result<BTreeMap<&'static str, u64>, LedgerError> {
        let records = self.list::<T>(query)?;
        Ok(metric_totals::<T>(&records))
    }

    /// Append a record below the last data row unless its `(date, unitId)` already exists.
    ///
    /// # Errors
    /// Returns validation errors before touching the store, [`LedgerError::DuplicateRecord`]
    /// without writing anything, or a store error.
    pub fn create<T: MetricsTable>(&self, payload: T::Payload) -> Result<CreateResult, LedgerError> {
        let input = T::validate_create(payload, &today_display())?;
        let key = T::key(&input);

        let _guard = self.locks.acquire(T::KIND)?;
        let rows = self.read_table_rows(T::KIND)?;

        let duplicate = rows.iter().any(|row| {
            row.first().map(String::as_str) == Some(key.date)
                && row.get(1).map(String::as_str) == Some(key.unit_id)
        });
        if duplicate {
            return Err(LedgerError::DuplicateRecord {
                date: key.date.to_string(),
                unit_id: key.unit_id.to_string(),
            });
        }

        let next_row = u32::try_from(rows.len())
            .ok()
            .and_then(|count| count.checked_add(FIRST_DATA_ROW))
            .ok_or_else(|| LedgerError::Internal("table has too many rows".to_string()))?;
        let range = A1Range::table_row(self.layout.tab(T::KIND), T::KIND, next_row);
        self.store
            .write_range(&range, &[T::to_row(&input)])
            .map_err(|err| write_failed(WriteOp::Create, &err))?;

        tracing::info!(table = %T::KIND, row = next_row, date = key.date, unit_id = key.unit_id, "record created");
        Ok(CreateResult { success: true, row: next_row })
    }

    /// Overwrite the record at the payload's `rowIndex`.
    ///
    /// # Errors
    /// Returns [`LedgerError::MissingIdentifier`] without `rowIndex`,
    /// [`LedgerError::RecordNotFound`] when the row is empty, or a store error.
    pub fn update<T: MetricsTable>(&self, payload: T::Payload) -> Result<WriteAck, LedgerError> {
        let (row_index, input) = T::validate_update(payload)?;
        let row_index = target_row(Some(row_index))?;

        let _guard = self.locks.acquire(T::KIND)?;
        self.read_existing_row(T::KIND, row_index)?;

        let range = A1Range::table_row(self.layout.tab(T::KIND), T::KIND, row_index);
        self.store
            .write_range(&range, &[T::to_row(&input)])
            .map_err(|err| write_failed(WriteOp::Update, &err))?;

        tracing::info!(table = %T::KIND, row = row_index, "record updated");
        Ok(WriteAck::OK)
    }

    /// Remove the physical row at `rowIndex`; later rows shift up by one.
    ///
    /// # Errors
    /// Returns [`LedgerError::MissingIdentifier`], [`LedgerError::RecordNotFound`],
    /// [`LedgerError::StaleRowIndex`] when the guard fields no longer match,
    /// [`LedgerError::TabNotFound`], or a store error.
    pub fn delete<T: MetricsTable>(&self, request: &DeleteRequest) -> Result<WriteAck, LedgerError> {
        let row_index = target_row(request.row_index)?;
        let expected_date = guard_value(request.date.as_deref()).map(normalize_date).transpose()?;
        let expected_unit = guard_value(request.unit_id.as_deref());

        let _guard = self.locks.acquire(T::KIND)?;
        let row = self.read_existing_row(T::KIND, row_index)?;

        let record = T::from_row(&row, row_index);
        let view = T::view(&record);
        let stored_date = normalize_date(view.date).unwrap_or_else(|_| view.date.to_string());
        let date_moved = expected_date.as_deref().is_some_and(|date| date != stored_date);
        let unit_moved = expected_unit.is_some_and(|unit| unit != view.unit_id);
        if date_moved || unit_moved {
            return Err(LedgerError::StaleRowIndex(row_index));
        }

        let tab = self.layout.tab(T::KIND);
        let sheet_id = self
            .store
            .sheet_id(tab)
            .map_err(|err| read_failed(&err))?
            .ok_or_else(|| LedgerError::TabNotFound(tab.to_string()))?;
        self.store
            .delete_rows(sheet_id, row_index - 1, row_index)
            .map_err(|err| write_failed(WriteOp::Delete, &err))?;

        tracing::info!(table = %T::KIND, row = row_index, "record deleted");
        Ok(WriteAck::OK)
    }

    /// Business units that have both an id and a name.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreRead`] when the units tab cannot be read.
    pub fn list_units(&self) -> Result<Vec<Unit>, LedgerError> {
        let rows = self
            .store
            .read_range(&A1Range::units(&self.layout.units_tab))
            .map_err(|err| read_failed(&err))?;
        Ok(rows.iter().filter_map(|row| Unit::from_row(row)).collect())
    }
}
