use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics_ledger_api::{DeleteRequest, MetricsLedgerApi};
use metrics_ledger_core::{
    DailyMetrics, LedgerError, ListQuery, MetricsTable, PlanMetrics, SheetLayout, SortOrder,
};
use metrics_ledger_store::{open_store, FileWorkbookStore, StoreBackend, DEFAULT_HTTP_TIMEOUT_SECS};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ml")]
#[command(about = "Metrics Ledger CLI")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct StoreArgs {
    /// Local JSON workbook, used when no spreadsheet id is configured.
    #[arg(long, global = true, env = "METRICS_LEDGER_WORKBOOK")]
    workbook: Option<PathBuf>,
    #[arg(long, global = true, env = "METRICS_LEDGER_SPREADSHEET_ID")]
    spreadsheet_id: Option<String>,
    #[arg(long, global = true, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, global = true, env = "METRICS_LEDGER_DAILY_TAB", default_value = "Comercial")]
    daily_tab: String,
    #[arg(long, global = true, env = "METRICS_LEDGER_PLAN_TAB", default_value = "app")]
    plan_tab: String,
    #[arg(long, global = true, env = "METRICS_LEDGER_UNITS_TAB", default_value = "Unidades")]
    units_tab: String,
    #[arg(
        long,
        global = true,
        env = "METRICS_LEDGER_HTTP_TIMEOUT_SECS",
        default_value_t = DEFAULT_HTTP_TIMEOUT_SECS
    )]
    http_timeout_secs: u64,
}

impl StoreArgs {
    fn layout(&self) -> SheetLayout {
        SheetLayout {
            daily_tab: self.daily_tab.clone(),
            plan_tab: self.plan_tab.clone(),
            units_tab: self.units_tab.clone(),
        }
    }

    fn open_api(&self) -> Result<MetricsLedgerApi> {
        let backend = StoreBackend::resolve(
            self.workbook.clone(),
            self.spreadsheet_id.clone(),
            self.access_token.clone(),
            self.http_timeout_secs,
        )?;
        tracing::debug!(store = %backend.describe(), "opening store");
        Ok(MetricsLedgerApi::new(open_store(&backend)?, self.layout()))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    Workbook {
        #[command(subcommand)]
        command: Box<WorkbookCommand>,
    },
    Records {
        #[command(subcommand)]
        command: Box<RecordsCommand>,
    },
    Units {
        #[command(subcommand)]
        command: Box<UnitsCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum WorkbookCommand {
    /// Create a local workbook file with the ledger tabs and header rows.
    Init(WorkbookInitArgs),
}

#[derive(Debug, Args)]
struct WorkbookInitArgs {
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum RecordsCommand {
    List(ListArgs),
    Totals(ListArgs),
    Create(PayloadArgs),
    Update(PayloadArgs),
    Delete(DeleteArgs),
}

#[derive(Debug, Subcommand)]
enum UnitsCommand {
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TableArg {
    Daily,
    Plan,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Asc,
    Desc,
}

impl From<OrderArg> for SortOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Asc => Self::Asc,
            OrderArg::Desc => Self::Desc,
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum)]
    table: TableArg,
    #[arg(long)]
    unit_id: Option<String>,
    /// Inclusive lower bound, `YYYY-MM-DD`.
    #[arg(long)]
    from: Option<String>,
    /// Inclusive upper bound, `YYYY-MM-DD`.
    #[arg(long)]
    to: Option<String>,
    #[arg(long, value_enum)]
    order: Option<OrderArg>,
}

impl ListArgs {
    fn query(&self) -> ListQuery {
        ListQuery {
            unit_id: self.unit_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            order: self.order.map(SortOrder::from),
        }
    }
}

#[derive(Debug, Args)]
struct PayloadArgs {
    #[arg(long, value_enum)]
    table: TableArg,
    /// JSON object in the same shape the HTTP endpoints accept.
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long, value_enum)]
    table: TableArg,
    #[arg(long)]
    row_index: u32,
    /// Expected date at the row; the delete is refused when the row holds something else.
    #[arg(long)]
    date: Option<String>,
    /// Expected unit id at the row.
    #[arg(long)]
    unit_id: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Log a ledger failure and turn it into a process error carrying the short message.
fn ledger_failure(err: LedgerError) -> anyhow::Error {
    if err.status_code() >= 500 {
        tracing::error!(error = %err, "command failed");
    } else {
        tracing::warn!(error = %err, "command rejected");
    }
    let message = err.user_message();
    anyhow::Error::new(err).context(message)
}

fn init_tracing() {
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Workbook { command } => run_workbook(*command, &cli.store),
        Command::Records { command } => {
            let api = cli.store.open_api()?;
            run_records(*command, &api)
        }
        Command::Units { command } => {
            let api = cli.store.open_api()?;
            run_units(&command, &api)
        }
    }
}

fn run_workbook(command: WorkbookCommand, store: &StoreArgs) -> Result<()> {
    match command {
        WorkbookCommand::Init(args) => {
            let path = store
                .workbook
                .clone()
                .ok_or_else(|| anyhow!("workbook init needs --workbook or METRICS_LEDGER_WORKBOOK"))?;
            let data = FileWorkbookStore::init(&path, &store.layout(), args.force)?;
            tracing::info!(path = %path.display(), "workbook initialised");
            emit_json(serde_json::json!({
                "path": path.display().to_string(),
                "tabs": data.tabs.keys().collect::<Vec<_>>(),
            }))
        }
    }
}

fn run_records(command: RecordsCommand, api: &MetricsLedgerApi) -> Result<()> {
    match command {
        RecordsCommand::List(args) => match args.table {
            TableArg::Daily => run_list::<DailyMetrics>(api, &args),
            TableArg::Plan => run_list::<PlanMetrics>(api, &args),
        },
        RecordsCommand::Totals(args) => match args.table {
            TableArg::Daily => run_totals::<DailyMetrics>(api, &args),
            TableArg::Plan => run_totals::<PlanMetrics>(api, &args),
        },
        RecordsCommand::Create(args) => match args.table {
            TableArg::Daily => run_create::<DailyMetrics>(api, &args),
            TableArg::Plan => run_create::<PlanMetrics>(api, &args),
        },
        RecordsCommand::Update(args) => match args.table {
            TableArg::Daily => run_update::<DailyMetrics>(api, &args),
            TableArg::Plan => run_update::<PlanMetrics>(api, &args),
        },
        RecordsCommand::Delete(args) => match args.table {
            TableArg::Daily => run_delete::<DailyMetrics>(api, &args),
            TableArg::Plan => run_delete::<PlanMetrics>(api, &args),
        },
    }
}

fn parse_payload<T: MetricsTable>(args: &PayloadArgs) -> Result<T::Payload> {
    serde_json::from_str(&args.payload)
        .map_err(|err| ledger_failure(LedgerError::InvalidPayload(err.to_string())))
}

fn run_list<T: MetricsTable>(api: &MetricsLedgerApi, args: &ListArgs) -> Result<()> {
    let records = api.list::<T>(&args.query()).map_err(ledger_failure)?;
    emit_json(serde_json::json!({
        "table": T::KIND.as_str(),
        "count": records.len(),
        "records": serde_json::to_value(&records).context("failed to serialize records")?,
    }))
}

fn run_totals<T: MetricsTable>(api: &MetricsLedgerApi, args: &ListArgs) -> Result<()> {
    let totals = api.totals::<T>(&args.query()).map_err(ledger_failure)?;
    emit_json(serde_json::json!({
        "table": T::KIND.as_str(),
        "totals": totals,
    }))
}

fn run_create<T: MetricsTable>(api: &MetricsLedgerApi, args: &PayloadArgs) -> Result<()> {
    let created = api.create::<T>(parse_payload::<T>(args)?).map_err(ledger_failure)?;
    emit_json(serde_json::json!({
        "table": T::KIND.as_str(),
        "success": created.success,
        "row": created.row,
    }))
}

fn run_update<T: MetricsTable>(api: &MetricsLedgerApi, args: &PayloadArgs) -> Result<()> {
    let ack = api.update::<T>(parse_payload::<T>(args)?).map_err(ledger_failure)?;
    emit_json(serde_json::json!({
        "table": T::KIND.as_str(),
        "success": ack.success,
    }))
}

fn run_delete<T: MetricsTable>(api: &MetricsLedgerApi, args: &DeleteArgs) -> Result<()> {
    let request = DeleteRequest {
        row_index: Some(args.row_index),
        date: args.date.clone(),
        unit_id: args.unit_id.clone(),
    };
    let ack = api.delete::<T>(&request).map_err(ledger_failure)?;
    emit_json(serde_json::json!({
        "table": T::KIND.as_str(),
        "success": ack.success,
    }))
}

fn run_units(command: &UnitsCommand, api: &MetricsLedgerApi) -> Result<()> {
    match command {
        UnitsCommand::List => {
            let units = api.list_units().map_err(ledger_failure)?;
            emit_json(serde_json::json!({
                "count": units.len(),
                "units": serde_json::to_value(&units).context("failed to serialize units")?,
            }))
        }
    }
}
