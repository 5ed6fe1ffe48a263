use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use due_sync_client::{HttpRequest, HttpResponse, RegistryClient, Transport};
use due_sync_core::payload::{ConcessionAct, FiscalRequirement};
use due_sync_core::{
    normalize, CancellationToken, Clock, DuePayload, ExternalRef, ManualClock, OverageOrigin,
    RecordId, RecordLink, StorageSink, SubResources, SyncConfig, SyncError, Table,
};
use due_sync_engine::{IngestionOrchestrator, RefreshOptions, RunReport, StopReason};
use due_sync_store_sqlite::SqliteStore;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

const NOW: OffsetDateTime = datetime!(2026-03-02 12:00 UTC);
const STALE_SYNC: &str = "2026-03-01T00:00:00Z";
const REGISTERED: &str = "2026-01-05T09:00:00.000-0300";
const REREGISTERED: &str = "2026-02-20T16:45:10.000-0300";
const SETTLED_OLD: &str = "2026-01-07T11:29:42.000-0300";
const SETTLED_RECENT: &str = "2026-02-28T10:00:00.000-0300";
const QUOTA_BODY: &str =
    r#"{"code":"PUCX-ER1001","message":"Limite de consultas excedido. Tente novamente após as 14:05:00."}"#;

#[derive(Default)]
struct RegistryState {
    lookups: BTreeMap<String, String>,
    details: BTreeMap<String, Value>,
    subresources: BTreeMap<(String, String), String>,
    /// API calls answered normally before the quota body is returned.
    allowance: Option<usize>,
    calls: Vec<String>,
    logins: usize,
}

/// In-process stand-in for the registry. Unknown declarations answer 404,
/// unknown sub-resources an empty list.
#[derive(Default)]
struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    fn link(&self, key: &ExternalRef, id: &str) {
        self.state.lock().lookups.insert(key.as_str().to_string(), id.to_string());
    }

    fn detail(&self, id: &str, body: Value) {
        self.state.lock().details.insert(id.to_string(), body);
    }

    fn subresource(&self, id: &str, path: &str, body: Value) {
        self.state.lock().subresources.insert((id.to_string(), path.to_string()), body.to_string());
    }

    fn allow(&self, allowance: Option<usize>) {
        self.state.lock().allowance = allowance;
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn calls_for(&self, id: &str) -> usize {
        let needle = format!("/{id}");
        self.state.lock().calls.iter().filter(|url| url.contains(&needle)).count()
    }
}

impl Transport for FakeRegistry {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
        let mut state = self.state.lock();
        if request.url.contains("/autenticar/") {
            state.logins += 1;
            return Ok(HttpResponse::new(200, "")
                .with_header("set-token", format!("Bearer tok-{}", state.logins))
                .with_header("x-csrf-token", "csrf"));
        }

        state.calls.push(request.url.clone());
        match state.allowance.as_mut() {
            Some(0) => return Ok(HttpResponse::new(200, QUOTA_BODY)),
            Some(left) => *left -= 1,
            None => {}
        }

        if let Some((_, key)) = request.url.split_once("?nota-fiscal=") {
            let body = state.lookups.get(key).map_or_else(
                || "[]".to_string(),
                |id| json!([{ "rel": id, "href": format!("https://registry.invalid/{id}") }]).to_string(),
            );
            return Ok(HttpResponse::new(200, body));
        }
        if let Some((_, id)) = request.url.split_once("/numero-da-due/") {
            return Ok(state
                .details
                .get(id)
                .map_or_else(|| HttpResponse::new(404, ""), |body| HttpResponse::new(200, body.to_string())));
        }
        let tail = request.url.split_once("/due/api/ext/due/").map_or("", |(_, tail)| tail);
        let (id, path) = tail.split_once('/').unwrap_or((tail, ""));
        let body = state
            .subresources
            .get(&(id.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_else(|| "[]".to_string());
        Ok(HttpResponse::new(200, body))
    }
}

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(name: &str) -> Self {
        Self { path: std::env::temp_dir().join(format!("duesync-{name}-{}.sqlite3", Ulid::new())) }
    }

    fn open(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.path)?;
        store.migrate()?;
        Ok(store)
    }

    fn reader(&self) -> Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

struct Harness {
    db: TempDb,
    store: SqliteStore,
    registry: Arc<FakeRegistry>,
    clock: Arc<ManualClock>,
    orchestrator: IngestionOrchestrator,
}

fn harness(name: &str, config: SyncConfig) -> Result<Harness> {
    let db = TempDb::new(name);
    let store = db.open()?;
    let registry = Arc::new(FakeRegistry::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let config = SyncConfig {
        client_id: Some("client".to_string()),
        client_secret: Some("secret".to_string()),
        ..config
    };
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let client = RegistryClient::new(&config, registry.clone(), Arc::clone(&dyn_clock))?;
    let orchestrator = IngestionOrchestrator::new(config, client, dyn_clock, CancellationToken::new());
    Ok(Harness { db, store, registry, clock, orchestrator })
}

fn without_subresources() -> SyncConfig {
    SyncConfig {
        fetch_suspension_acts: false,
        fetch_exemption_acts: false,
        fetch_fiscal_requirements: false,
        ..SyncConfig::default()
    }
}

fn due(n: usize) -> String {
    format!("26BR{n:010}")
}

fn invoice(n: usize) -> ExternalRef {
    ExternalRef::new(format!("{n:044}"))
}

fn detail(id: &str, situation: &str, registered: &str) -> Value {
    json!({
        "numero": id,
        "situacao": situation,
        "dataDeRegistro": registered,
        "dataDaAverbacao": SETTLED_OLD,
        "canal": "VERMELHO",
    })
}

fn seed(
    store: &mut SqliteStore,
    id: &str,
    situation: &str,
    settled_at: Option<&str>,
    subresources: &SubResources,
) -> Result<()> {
    let payload = DuePayload {
        numero: Some(id.to_string()),
        situacao: Some(situation.to_string()),
        data_de_registro: Some(REGISTERED.to_string()),
        data_da_averbacao: settled_at.map(str::to_string),
        canal: Some("VERDE".to_string()),
        ..DuePayload::default()
    };
    store.replace_records(&[normalize(&RecordId::new(id), &payload, subresources, STALE_SYNC)])?;
    Ok(())
}

fn principal_column(db: &TempDb, id: &str, column: &str) -> Result<Option<String>> {
    let conn = db.reader()?;
    Ok(conn.query_row(
        &format!("SELECT {column} FROM due_principal WHERE numero = ?1"),
        params![id],
        |row| row.get(0),
    )?)
}

fn child_values(db: &TempDb, table: Table, column: &str, id: &str) -> Result<Vec<String>> {
    let conn = db.reader()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {column} FROM {} WHERE numero_due = ?1 ORDER BY {column}",
        table.name()
    ))?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn synced_now(db: &TempDb) -> Result<i64> {
    let conn = db.reader()?;
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM due_principal WHERE data_ultima_atualizacao = '2026-03-02T12:00:00Z'",
        [],
        |row| row.get(0),
    )?)
}

/// Workers racing the quota signal may see the cooldown it started first, so
/// either origin is accepted; both carry the same instant.
fn rate_limited(report: &RunReport) -> Result<OffsetDateTime> {
    match &report.stop {
        Some(StopReason::RateLimited {
            retry_at,
            origin: OverageOrigin::QuotaExceeded | OverageOrigin::Cooldown,
        }) => Ok(*retry_at),
        other => Err(anyhow!("expected a rate-limit stop, got {other:?}")),
    }
}

#[test]
fn refresh_call_count_follows_the_plan() -> Result<()> {
    // Default flags: suspension acts and fiscal requirements, so k = 2.
    let mut h = harness("call-count", SyncConfig::default())?;
    let none = SubResources::default();

    for n in 0..30 {
        let id = due(n);
        seed(&mut h.store, &id, "AVERBADA_SEM_DIVERGENCIA", Some(SETTLED_OLD), &none)?;
        h.registry.detail(&id, detail(&id, "AVERBADA_SEM_DIVERGENCIA", REGISTERED));
    }
    for n in 30..35 {
        let id = due(n);
        seed(&mut h.store, &id, "AVERBADA_COM_DIVERGENCIA", Some(SETTLED_OLD), &none)?;
        h.registry.detail(&id, detail(&id, "AVERBADA_COM_DIVERGENCIA", REREGISTERED));
    }
    for n in 35..45 {
        let id = due(n);
        seed(&mut h.store, &id, "EM_CARGA", None, &none)?;
        h.registry.detail(&id, detail(&id, "EM_CARGA", REGISTERED));
    }
    for n in 45..48 {
        seed(&mut h.store, &due(n), "CANCELADA_PELO_EXPORTADOR", None, &none)?;
    }

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert!(report.is_complete(), "{report:?}");
    assert_eq!(report.candidates, 45);
    assert_eq!(report.unchanged, 30);
    assert_eq!(report.fetched, 15);
    assert_eq!(report.persisted, 15);
    assert_eq!(report.advanced, 30);
    assert_eq!(report.requests_sent, 30 + 5 * 3 + 10 * 3);
    assert_eq!(h.registry.calls().len(), 75);
    assert_eq!(report.network_logins, 1);
    for n in 45..48 {
        assert_eq!(h.registry.calls_for(&due(n)), 0);
    }
    Ok(())
}

#[test]
fn unchanged_settled_record_only_advances_last_sync() -> Result<()> {
    let mut h = harness("unchanged", SyncConfig::default())?;
    let id = due(1);
    seed(&mut h.store, &id, "AVERBADA_SEM_DIVERGENCIA", Some(SETTLED_OLD), &SubResources::default())?;
    h.registry.detail(&id, detail(&id, "AVERBADA_SEM_DIVERGENCIA", REGISTERED));

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.persisted, 0);
    assert_eq!(h.registry.calls().len(), 1);
    assert_eq!(principal_column(&h.db, &id, "canal")?.as_deref(), Some("VERDE"));
    assert_eq!(
        principal_column(&h.db, &id, "data_ultima_atualizacao")?.as_deref(),
        Some("2026-03-02T12:00:00Z")
    );

    // Synced just now, so a second run has nothing to do.
    h.registry.clear_calls();
    let again = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;
    assert_eq!(again.candidates, 0);
    assert!(h.registry.calls().is_empty());
    Ok(())
}

#[test]
fn changed_settled_record_replaces_child_rows() -> Result<()> {
    let mut h = harness("changed", SyncConfig::default())?;
    let id = due(7);
    let seeded = SubResources {
        suspension_acts: Some(vec![ConcessionAct::default()]),
        exemption_acts: None,
        fiscal_requirements: Some(vec![
            FiscalRequirement { numero: Some(json!("OLD-1")), ..FiscalRequirement::default() },
            FiscalRequirement { numero: Some(json!("OLD-2")), ..FiscalRequirement::default() },
        ]),
    };
    seed(&mut h.store, &id, "AVERBADA_SEM_DIVERGENCIA", Some(SETTLED_OLD), &seeded)?;
    h.registry.detail(&id, detail(&id, "AVERBADA_SEM_DIVERGENCIA", REREGISTERED));
    h.registry.subresource(&id, "exigencias-fiscais", json!([{ "numero": "NEW-1" }]));

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert_eq!(report.fetched, 1);
    assert_eq!(report.persisted, 1);
    assert_eq!(h.registry.calls().len(), 3);
    assert_eq!(
        child_values(&h.db, Table::FiscalRequirements, "numero_exigencia", &id)?,
        vec!["NEW-1".to_string()]
    );
    assert!(child_values(&h.db, Table::SuspensionActs, "numero_due", &id)?.is_empty());
    assert_eq!(principal_column(&h.db, &id, "canal")?.as_deref(), Some("VERMELHO"));
    assert_eq!(principal_column(&h.db, &id, "data_de_registro")?.as_deref(), Some(REREGISTERED));
    Ok(())
}

#[test]
fn quota_stop_persists_exactly_the_consolidated_records() -> Result<()> {
    let config = SyncConfig { fetch_concurrency: 4, ..without_subresources() };
    let mut h = harness("quota-stop", config)?;
    for n in 0..10 {
        let id = due(n);
        seed(&mut h.store, &id, "EM_CARGA", None, &SubResources::default())?;
        h.registry.detail(&id, detail(&id, "EM_CARGA", REREGISTERED));
    }
    h.registry.allow(Some(4));

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert_eq!(rate_limited(&report)?, datetime!(2026-03-02 17:05 UTC));
    assert_eq!(report.retry_at, Some(datetime!(2026-03-02 17:05 UTC)));
    assert_eq!(report.fetched, 4);
    assert_eq!(report.persisted, 4);
    assert_eq!(report.remaining, 6);
    assert!(report.failures.is_empty());
    assert_eq!(synced_now(&h.db)?, 4);
    assert!(report.governor.cooldown.active);

    // Calls stay blocked until the announced instant.
    h.registry.clear_calls();
    let blocked = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;
    assert!(matches!(
        blocked.stop,
        Some(StopReason::RateLimited { origin: OverageOrigin::Cooldown, .. })
    ));
    assert!(h.registry.calls().is_empty());
    assert_eq!(blocked.persisted, 0);

    h.clock.set(datetime!(2026-03-02 17:06 UTC));
    h.registry.allow(None);
    let resumed = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;
    assert!(resumed.is_complete(), "{resumed:?}");
    assert_eq!(resumed.fetched, 6);
    assert_eq!(h.registry.calls().len(), 6);
    Ok(())
}

#[test]
fn discovery_links_fetches_and_then_stays_quiet() -> Result<()> {
    let mut h = harness("discover", SyncConfig::default())?;
    let keys: Vec<ExternalRef> = (1..=4).map(invoice).collect();
    h.store.import_refs(&keys)?;
    h.registry.link(&keys[0], &due(1));
    h.registry.link(&keys[1], &due(2));
    h.registry.link(&keys[2], &due(1));
    h.registry.link(&keys[3], &due(3));
    for n in 1..=3 {
        h.registry.detail(&due(n), detail(&due(n), "EM_CARGA", REGISTERED));
    }

    let report = h.orchestrator.discover(&mut h.store)?;

    assert!(report.is_complete(), "{report:?}");
    assert_eq!(report.candidates, 4);
    assert_eq!(report.links_found, 4);
    assert_eq!(report.links_saved, 4);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.persisted, 3);
    assert_eq!(report.requests_sent, 4 + 3 * 3);
    assert_eq!(h.store.stats()?.orphans, 0);

    h.registry.clear_calls();
    let again = h.orchestrator.discover(&mut h.store)?;
    assert_eq!(again.candidates, 0);
    assert_eq!(again.links_found, 0);
    assert_eq!(again.requests_sent, 0);
    assert!(h.registry.calls().is_empty());
    Ok(())
}

#[test]
fn discovery_never_fetches_stored_or_cancelled_records() -> Result<()> {
    let mut h = harness("discover-stored", without_subresources())?;
    let cancelled = due(50);
    seed(&mut h.store, &cancelled, "CANCELADA_PELO_SISCOMEX", None, &SubResources::default())?;
    let keys = vec![invoice(50), invoice(51)];
    h.store.import_refs(&keys)?;
    h.registry.link(&keys[0], &cancelled);
    h.registry.link(&keys[1], &due(51));
    h.registry.detail(&due(51), detail(&due(51), "EM_CARGA", REGISTERED));

    let report = h.orchestrator.discover(&mut h.store)?;

    assert_eq!(report.links_saved, 2);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.fetched, 1);
    assert!(h.registry.calls().iter().all(|url| !url.contains("/numero-da-due/26BR0000000050")));

    let refresh = h.orchestrator.refresh(&mut h.store, RefreshOptions { force: true, limit: None })?;
    assert_eq!(refresh.candidates, 1);
    assert_eq!(h.registry.calls_for(&cancelled), 0);
    Ok(())
}

#[test]
fn lookup_stop_keeps_links_and_refresh_fetches_the_orphans() -> Result<()> {
    let config = SyncConfig { lookup_concurrency: 1, ..without_subresources() };
    let mut h = harness("lookup-stop", config)?;
    let keys = vec![invoice(10), invoice(11), invoice(12)];
    h.store.import_refs(&keys)?;
    for (key, n) in keys.iter().zip(10..) {
        h.registry.link(key, &due(n));
        h.registry.detail(&due(n), detail(&due(n), "EM_CARGA", REGISTERED));
    }
    h.registry.allow(Some(1));

    let report = h.orchestrator.discover(&mut h.store)?;

    let retry_at = rate_limited(&report)?;
    assert_eq!(report.links_saved, 1);
    assert_eq!(report.fetched, 0);
    assert_eq!(report.remaining, 2);
    assert_eq!(h.store.stats()?.orphans, 1);
    assert!(h.registry.calls().iter().all(|url| !url.contains("/numero-da-due/")));

    h.clock.set(retry_at + Duration::minutes(1));
    h.registry.allow(None);
    h.registry.clear_calls();
    let refresh = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;
    assert_eq!(refresh.breakdown.map(|b| b.orphans), Some(1));
    assert_eq!(refresh.persisted, 1);
    assert_eq!(refresh.requests_sent, 1);
    assert_eq!(h.store.stats()?.orphans, 0);

    let resumed = h.orchestrator.discover(&mut h.store)?;
    assert_eq!(resumed.links_saved, 2);
    assert_eq!(resumed.persisted, 2);
    Ok(())
}

#[test]
fn refresh_cap_follows_priority_order() -> Result<()> {
    let mut h = harness("cap", without_subresources())?;
    let orphan = due(90);
    h.store.save_links(&[RecordLink { external_ref: invoice(90), record_id: RecordId::new(&orphan) }])?;
    h.registry.detail(&orphan, detail(&orphan, "EM_CARGA", REGISTERED));
    for n in 91..93 {
        seed(&mut h.store, &due(n), "EM_CARGA", None, &SubResources::default())?;
        h.registry.detail(&due(n), detail(&due(n), "EM_CARGA", REGISTERED));
    }
    seed(&mut h.store, &due(93), "AVERBADA_SEM_DIVERGENCIA", Some(SETTLED_RECENT), &SubResources::default())?;
    seed(&mut h.store, &due(94), "AVERBADA_SEM_DIVERGENCIA", Some(SETTLED_OLD), &SubResources::default())?;

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions { force: false, limit: Some(2) })?;

    let breakdown = report.breakdown.ok_or_else(|| anyhow!("refresh reports a breakdown"))?;
    assert_eq!(breakdown.orphans, 1);
    assert_eq!(breakdown.pending, 1);
    assert_eq!(breakdown.settled_recent, 0);
    assert_eq!(breakdown.settled_old, 0);
    assert_eq!(breakdown.capped, 3);
    assert_eq!(report.persisted, 2);
    assert_eq!(h.registry.calls_for(&orphan), 1);
    assert_eq!(h.registry.calls_for(&due(91)), 1);
    assert_eq!(h.registry.calls_for(&due(92)), 0);
    Ok(())
}

#[test]
fn cancelled_run_dispatches_nothing() -> Result<()> {
    let mut h = harness("cancelled", without_subresources())?;
    seed(&mut h.store, &due(5), "EM_CARGA", None, &SubResources::default())?;
    h.orchestrator.cancellation().cancel();

    let report = h.orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert_eq!(report.stop, Some(StopReason::Cancelled));
    assert_eq!(report.remaining, 1);
    assert!(h.registry.calls().is_empty());
    assert_eq!(report.network_logins, 0);
    Ok(())
}

#[test]
fn missing_credentials_stop_the_run_before_any_call() -> Result<()> {
    let mut h = harness("no-credentials", without_subresources())?;
    seed(&mut h.store, &due(6), "EM_CARGA", None, &SubResources::default())?;
    let config = SyncConfig { client_id: None, ..without_subresources() };
    let dyn_clock: Arc<dyn Clock> = h.clock.clone();
    let client = RegistryClient::new(&config, h.registry.clone(), Arc::clone(&dyn_clock))?;
    let orchestrator = IngestionOrchestrator::new(config, client, dyn_clock, CancellationToken::new());

    let report = orchestrator.refresh(&mut h.store, RefreshOptions::default())?;

    assert!(matches!(
        report.stop,
        Some(StopReason::Fatal { code: SyncError::CONFIGURATION_INVALID, .. })
    ));
    assert_eq!(report.persisted, 0);
    assert!(h.registry.calls().is_empty());
    assert_eq!(h.registry.state.lock().logins, 0);
    Ok(())
}
