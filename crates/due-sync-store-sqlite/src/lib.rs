use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use due_sync_core::record::CANCELLED_SITUATIONS;
use due_sync_core::timestamp::parse_remote_timestamp;
use due_sync_core::{
    CandidateFilter, Classification, ExternalRef, NormalizedRecordSet, RecordId, RecordLink,
    Row, StorageSink, StoredRecord, Table,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Origin stamped on links resolved through the registry lookup.
pub const LINK_ORIGIN: &str = "SISCOMEX";

const IN_CLAUSE_CHUNK: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS nfe_sap (
  chave_nf TEXT PRIMARY KEY,
  data_importacao TEXT NOT NULL,
  ativo INTEGER NOT NULL DEFAULT 1 CHECK (ativo IN (0, 1))
);

CREATE TABLE IF NOT EXISTS nf_due_vinculo (
  chave_nf TEXT PRIMARY KEY,
  numero_due TEXT NOT NULL,
  data_vinculo TEXT NOT NULL,
  origem TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nf_due_vinculo_numero_due ON nf_due_vinculo(numero_due);

CREATE TABLE IF NOT EXISTS due_principal (
  numero TEXT PRIMARY KEY,
  chave_de_acesso TEXT,
  data_de_registro TEXT,
  bloqueio INTEGER,
  canal TEXT,
  embarque_em_recinto_alfandegado INTEGER,
  despacho_em_recinto_alfandegado INTEGER,
  forma_de_exportacao TEXT,
  impedido_de_embarque INTEGER,
  informacoes_complementares TEXT,
  ruc TEXT,
  situacao TEXT,
  situacao_do_tratamento_administrativo TEXT,
  tipo TEXT,
  tratamento_prioritario INTEGER,
  responsavel_pelo_acd TEXT,
  despacho_em_recinto_domiciliar INTEGER,
  data_de_criacao TEXT,
  data_do_cce TEXT,
  data_do_desembaraco TEXT,
  data_do_acd TEXT,
  data_da_averbacao TEXT,
  valor_total_mercadoria REAL,
  inclusao_nota_fiscal INTEGER,
  exigencia_ativa INTEGER,
  consorciada INTEGER,
  dat INTEGER,
  oea INTEGER,
  declarante_numero_do_documento TEXT,
  declarante_tipo_do_documento TEXT,
  declarante_nome TEXT,
  declarante_estrangeiro INTEGER,
  declarante_nacionalidade_codigo TEXT,
  declarante_nacionalidade_nome TEXT,
  declarante_nacionalidade_nome_resumido TEXT,
  moeda_codigo TEXT,
  pais_importador_codigo TEXT,
  recinto_aduaneiro_de_despacho_codigo TEXT,
  recinto_aduaneiro_de_embarque_codigo TEXT,
  unidade_local_de_despacho_codigo TEXT,
  unidade_local_de_embarque_codigo TEXT,
  declaracao_tributaria_divergente INTEGER,
  data_ultima_atualizacao TEXT
);

CREATE TABLE IF NOT EXISTS due_eventos_historico (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  data_e_hora_do_evento TEXT,
  evento TEXT,
  responsavel TEXT,
  informacoes_adicionais TEXT,
  detalhes TEXT,
  motivo TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_itens (
  id TEXT PRIMARY KEY,
  numero_due TEXT NOT NULL,
  numero INTEGER,
  quantidade_na_unidade_estatistica REAL,
  peso_liquido_total REAL,
  valor_da_mercadoria_na_condicao_de_venda REAL,
  valor_da_mercadoria_no_local_de_embarque REAL,
  valor_da_mercadoria_no_local_de_embarque_em_reais REAL,
  valor_da_mercadoria_na_condicao_de_venda_em_reais REAL,
  data_de_conversao TEXT,
  descricao_da_mercadoria TEXT,
  unidade_comercializada TEXT,
  nome_importador TEXT,
  endereco_importador TEXT,
  valor_total_calculado_item REAL,
  quantidade_na_unidade_comercializada REAL,
  ncm_codigo TEXT,
  ncm_descricao TEXT,
  ncm_unidade_medida_estatistica TEXT,
  exportador_numero_do_documento TEXT,
  exportador_tipo_do_documento TEXT,
  exportador_nome TEXT,
  exportador_estrangeiro INTEGER,
  exportador_nacionalidade_codigo TEXT,
  exportador_nacionalidade_nome TEXT,
  exportador_nacionalidade_nome_resumido TEXT,
  codigo_condicao_venda TEXT,
  exportacao_temporaria INTEGER,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_item_enquadramentos (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  due_item_id TEXT NOT NULL,
  numero_due TEXT NOT NULL,
  item_numero INTEGER,
  codigo TEXT,
  data_registro TEXT,
  descricao TEXT,
  grupo TEXT,
  tipo TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero),
  FOREIGN KEY (due_item_id) REFERENCES due_itens(id)
);

CREATE TABLE IF NOT EXISTS due_item_paises_destino (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  due_item_id TEXT NOT NULL,
  numero_due TEXT NOT NULL,
  item_numero INTEGER,
  codigo_pais TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero),
  FOREIGN KEY (due_item_id) REFERENCES due_itens(id)
);

CREATE TABLE IF NOT EXISTS due_situacoes_carga (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  codigo TEXT,
  descricao TEXT,
  carga_operada INTEGER,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_solicitacoes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  tipo_solicitacao TEXT,
  data_da_solicitacao TEXT,
  usuario_responsavel TEXT,
  codigo_do_status_da_solicitacao TEXT,
  status_da_solicitacao TEXT,
  data_de_apreciacao TEXT,
  motivo TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_declaracao_tributaria_compensacoes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  data_do_registro TEXT,
  numero_da_declaracao TEXT,
  valor_compensado REAL,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_declaracao_tributaria_recolhimentos (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  data_do_pagamento TEXT,
  data_do_registro TEXT,
  valor_da_multa REAL,
  valor_do_imposto_recolhido REAL,
  valor_do_juros_mora REAL,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_declaracao_tributaria_contestacoes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  indice INTEGER,
  data_do_registro TEXT,
  motivo TEXT,
  status TEXT,
  data_de_apreciacao TEXT,
  observacao TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_atos_concessorios_suspensao (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  ato_numero TEXT,
  tipo_codigo TEXT,
  tipo_descricao TEXT,
  item_numero INTEGER,
  item_ncm TEXT,
  beneficiario_cnpj TEXT,
  quantidade_exportada REAL,
  valor_com_cobertura_cambial REAL,
  valor_sem_cobertura_cambial REAL,
  item_de_due_numero TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_atos_concessorios_isencao (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  ato_numero TEXT,
  tipo_codigo TEXT,
  tipo_descricao TEXT,
  item_numero INTEGER,
  item_ncm TEXT,
  beneficiario_cnpj TEXT,
  quantidade_exportada REAL,
  valor_com_cobertura_cambial REAL,
  valor_sem_cobertura_cambial REAL,
  item_de_due_numero TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE TABLE IF NOT EXISTS due_exigencias_fiscais (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  numero_due TEXT NOT NULL,
  numero_exigencia TEXT,
  tipo_exigencia TEXT,
  data_criacao TEXT,
  data_limite TEXT,
  status TEXT,
  orgao_responsavel TEXT,
  descricao TEXT,
  valor_exigido REAL,
  valor_pago REAL,
  observacoes TEXT,
  FOREIGN KEY (numero_due) REFERENCES due_principal(numero)
);

CREATE INDEX IF NOT EXISTS idx_due_eventos_historico_numero_due ON due_eventos_historico(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_itens_numero_due ON due_itens(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_item_enquadramentos_numero_due ON due_item_enquadramentos(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_item_paises_destino_numero_due ON due_item_paises_destino(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_situacoes_carga_numero_due ON due_situacoes_carga(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_solicitacoes_numero_due ON due_solicitacoes(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_declaracao_tributaria_compensacoes_numero_due ON due_declaracao_tributaria_compensacoes(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_declaracao_tributaria_recolhimentos_numero_due ON due_declaracao_tributaria_recolhimentos(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_declaracao_tributaria_contestacoes_numero_due ON due_declaracao_tributaria_contestacoes(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_atos_concessorios_suspensao_numero_due ON due_atos_concessorios_suspensao(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_atos_concessorios_isencao_numero_due ON due_atos_concessorios_isencao(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_exigencias_fiscais_numero_due ON due_exigencias_fiscais(numero_due);
CREATE INDEX IF NOT EXISTS idx_due_principal_situacao ON due_principal(situacao);
CREATE INDEX IF NOT EXISTS idx_due_principal_data_atualizacao ON due_principal(data_ultima_atualizacao);
";

/// `SQLite` storage sink for declarations, invoice references and their links.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub external_refs: i64,
    pub active_external_refs: i64,
    pub links: i64,
    pub records: i64,
    pub cancelled_records: i64,
    pub orphans: i64,
    pub never_synced: i64,
    pub table_rows: BTreeMap<String, i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed declaration store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        Ok(Self { conn, path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.apply_migration_1()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<i64> {
        if table_exists(&self.conn, "due_principal")?
            && !table_has_column(&self.conn, "due_principal", "data_ultima_atualizacao")?
        {
            bail!("database schema is invalid: due_principal lacks data_ultima_atualizacao");
        }

        // Unversioned databases from earlier deployments are completed in place.
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        info!(path = %self.path.display(), "applied schema migration v1");
        Ok(1)
    }

    /// Run `SQLite` quick-check and foreign-key checks with schema metadata.
    ///
    /// # Errors
    /// Returns an error when integrity pragmas cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Seed invoice keys. Keys already present keep their import date.
    ///
    /// # Errors
    /// Returns an error when the write transaction fails.
    pub fn import_refs(&mut self, keys: &[ExternalRef]) -> Result<usize> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO nfe_sap(chave_nf, data_importacao, ativo)
                     VALUES (?1, ?2, 1)",
                )
                .context("failed to prepare reference import")?;
            for key in keys {
                inserted += stmt
                    .execute(params![key.as_str(), now])
                    .with_context(|| format!("failed to import reference {key}"))?;
            }
        }
        tx.commit().context("failed to commit reference import")?;
        Ok(inserted)
    }

    /// Row counts for status reporting.
    ///
    /// # Errors
    /// Returns an error when any count query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let cancelled = vec!["?"; CANCELLED_SITUATIONS.len()].join(", ");
        let mut table_rows = BTreeMap::new();
        for table in Table::ALL {
            table_rows.insert(
                table.name().to_string(),
                count(&self.conn, &format!("SELECT COUNT(*) FROM {}", table.name()), [])?,
            );
        }

        Ok(StoreStats {
            external_refs: count(&self.conn, "SELECT COUNT(*) FROM nfe_sap", [])?,
            active_external_refs: count(&self.conn, "SELECT COUNT(*) FROM nfe_sap WHERE ativo = 1", [])?,
            links: count(&self.conn, "SELECT COUNT(*) FROM nf_due_vinculo", [])?,
            records: count(&self.conn, "SELECT COUNT(*) FROM due_principal", [])?,
            cancelled_records: count(
                &self.conn,
                &format!("SELECT COUNT(*) FROM due_principal WHERE situacao IN ({cancelled})"),
                params_from_iter(CANCELLED_SITUATIONS.iter()),
            )?,
            orphans: count(
                &self.conn,
                "SELECT COUNT(DISTINCT v.numero_due)
                 FROM nf_due_vinculo v
                 LEFT JOIN due_principal p ON p.numero = v.numero_due
                 WHERE p.numero IS NULL",
                [],
            )?,
            never_synced: count(
                &self.conn,
                "SELECT COUNT(*) FROM due_principal WHERE data_ultima_atualizacao IS NULL",
                [],
            )?,
            table_rows,
        })
    }
}

impl StorageSink for SqliteStore {
    fn get_external_refs(&self) -> Result<Vec<ExternalRef>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chave_nf FROM nfe_sap WHERE ativo = 1 ORDER BY chave_nf ASC")
            .context("failed to prepare reference query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut refs = Vec::new();
        for row in rows {
            refs.push(ExternalRef::new(row?));
        }
        Ok(refs)
    }

    fn get_links(&self) -> Result<Vec<RecordLink>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chave_nf, numero_due FROM nf_due_vinculo ORDER BY chave_nf ASC")
            .context("failed to prepare link query")?;
        let rows = stmt.query_map([], |row| {
            Ok(RecordLink {
                external_ref: ExternalRef::new(row.get::<_, String>(0)?),
                record_id: RecordId::new(row.get::<_, String>(1)?),
            })
        })?;
        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    fn save_links(&mut self, links: &[RecordLink]) -> Result<usize> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start link transaction")?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO nf_due_vinculo(chave_nf, numero_due, data_vinculo, origem)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare link insert")?;
            for link in links {
                inserted += stmt
                    .execute(params![
                        link.external_ref.as_str(),
                        link.record_id.as_str(),
                        now,
                        LINK_ORIGIN
                    ])
                    .with_context(|| format!("failed to save link for {}", link.external_ref))?;
            }
        }
        tx.commit().context("failed to commit links")?;
        debug!(requested = links.len(), inserted, "saved links");
        Ok(inserted)
    }

    fn get_candidates(
        &self,
        classification: Classification,
        filter: &CandidateFilter,
    ) -> Result<Vec<StoredRecord>> {
        let offset = filter.detector.upstream_offset();
        let cancelled = vec!["?"; CANCELLED_SITUATIONS.len()].join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT numero, situacao, data_da_averbacao, data_de_registro, data_ultima_atualizacao
                 FROM due_principal
                 WHERE situacao IS NULL OR situacao NOT IN ({cancelled})"
            ))
            .context("failed to prepare candidate query")?;
        let mut rows = stmt.query(params_from_iter(CANCELLED_SITUATIONS.iter()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let numero: String = row.get(0)?;
            let situacao: Option<String> = row.get(1)?;
            let settled_raw: Option<String> = row.get(2)?;
            let remote_modified: Option<String> = row.get(3)?;
            let last_sync_raw: Option<String> = row.get(4)?;

            let mut record = StoredRecord::new(RecordId::new(numero), situacao.unwrap_or_default());
            record.settled_at =
                settled_raw.as_deref().and_then(|raw| parse_remote_timestamp(raw, offset));
            record.remote_modified = remote_modified.filter(|raw| !raw.trim().is_empty());
            record.last_sync = last_sync_raw
                .as_deref()
                .and_then(|raw| parse_remote_timestamp(raw, time::UtcOffset::UTC));
            if filter.admits(&record, classification) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.last_sync.cmp(&b.last_sync).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn get_orphans(&self) -> Result<Vec<RecordId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT v.numero_due, MIN(v.data_vinculo) AS first_linked
                 FROM nf_due_vinculo v
                 LEFT JOIN due_principal p ON p.numero = v.numero_due
                 WHERE p.numero IS NULL
                 GROUP BY v.numero_due
                 ORDER BY first_linked ASC, v.numero_due ASC",
            )
            .context("failed to prepare orphan query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut orphans = Vec::new();
        for row in rows {
            orphans.push(RecordId::new(row?));
        }
        Ok(orphans)
    }

    fn existing_records(&self, ids: &[RecordId]) -> Result<BTreeSet<RecordId>> {
        let mut found = BTreeSet::new();
        for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT numero FROM due_principal WHERE numero IN ({placeholders})"
                ))
                .context("failed to prepare existence query")?;
            let rows = stmt.query_map(params_from_iter(chunk.iter().map(RecordId::as_str)), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                found.insert(RecordId::new(row?));
            }
        }
        Ok(found)
    }

    fn upsert_batch(&mut self, table: Table, rows: &[Row], conflict_key: &[&str]) -> Result<usize> {
        let sql = upsert_sql(table, conflict_key)?;
        let tx = self.conn.transaction().context("failed to start upsert transaction")?;
        let written = write_rows(&tx, &sql, table, rows)?;
        tx.commit().with_context(|| format!("failed to commit upsert into {}", table.name()))?;
        Ok(written)
    }

    fn replace_records(&mut self, sets: &[NormalizedRecordSet]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start replace transaction")?;
        for set in sets {
            replace_record(&tx, set)?;
        }
        tx.commit().context("failed to commit replaced records")?;
        debug!(records = sets.len(), "replaced record sets");
        Ok(sets.len())
    }

    fn advance_last_sync(&mut self, ids: &[RecordId], at: OffsetDateTime) -> Result<usize> {
        let at = rfc3339(at)?;
        let tx = self.conn.transaction().context("failed to start last-sync transaction")?;
        let mut updated = 0;
        {
            let mut stmt = tx
                .prepare("UPDATE due_principal SET data_ultima_atualizacao = ?1 WHERE numero = ?2")
                .context("failed to prepare last-sync update")?;
            for id in ids {
                updated += stmt
                    .execute(params![at, id.as_str()])
                    .with_context(|| format!("failed to advance last sync of {id}"))?;
            }
        }
        tx.commit().context("failed to commit last-sync update")?;
        Ok(updated)
    }

    fn reconnect(&mut self) -> Result<()> {
        if is_in_memory(&self.path) {
            // Reopening would discard the database; only verify it still answers.
            self.conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .context("in-memory sqlite connection is unusable")?;
            return Ok(());
        }
        warn!(path = %self.path.display(), "reopening sqlite connection");
        self.conn = open_connection(&self.path)?;
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn is_in_memory(path: &Path) -> bool {
    path.as_os_str().is_empty() || path == Path::new(":memory:")
}

fn replace_record(tx: &Transaction<'_>, set: &NormalizedRecordSet) -> Result<()> {
    match set.rows(Table::Principal) {
        Some([_]) => {}
        Some(rows) => bail!("record set {} has {} principal rows", set.record_id, rows.len()),
        None => bail!("record set {} has no principal row", set.record_id),
    }

    // Children go before parents so foreign keys hold throughout.
    for row_set in set.row_sets.iter().rev().filter(|row_set| !row_set.table.is_principal()) {
        let table = row_set.table;
        tx.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", table.name(), table.record_column()),
            params![set.record_id.as_str()],
        )
        .with_context(|| format!("failed to clear {} for {}", table.name(), set.record_id))?;
    }

    for row_set in &set.row_sets {
        let sql = if row_set.table.is_principal() {
            upsert_sql(row_set.table, &[row_set.table.record_column()])?
        } else {
            insert_sql(row_set.table)
        };
        write_rows(tx, &sql, row_set.table, &row_set.rows)
            .with_context(|| format!("failed to write record {}", set.record_id))?;
    }
    Ok(())
}

fn insert_sql(table: Table) -> String {
    let columns = table.columns();
    let placeholders =
        (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
    format!("INSERT INTO {} ({}) VALUES ({placeholders})", table.name(), columns.join(", "))
}

fn upsert_sql(table: Table, conflict_key: &[&str]) -> Result<String> {
    if let Some(unknown) = conflict_key.iter().find(|key| !table.columns().contains(*key)) {
        bail!("{unknown} is not a column of {}", table.name());
    }
    if conflict_key.is_empty() {
        return Ok(insert_sql(table));
    }

    let updates = table
        .columns()
        .iter()
        .filter(|column| !conflict_key.contains(*column))
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    Ok(format!("{} ON CONFLICT({}) {action}", insert_sql(table), conflict_key.join(", ")))
}

fn write_rows(tx: &Transaction<'_>, sql: &str, table: Table, rows: &[Row]) -> Result<usize> {
    let width = table.columns().len();
    let mut stmt = tx
        .prepare_cached(sql)
        .with_context(|| format!("failed to prepare write into {}", table.name()))?;
    for row in rows {
        if row.len() != width {
            bail!("row for {} has {} values; expected {width}", table.name(), row.len());
        }
        stmt.execute(params_from_iter(row.iter().map(sql_value)))
            .with_context(|| format!("failed to write row into {}", table.name()))?;
    }
    Ok(rows.len())
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn count<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<i64> {
    conn.query_row(sql, params, |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to run count query: {sql}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "due_principal")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "due_principal", "data_ultima_atualizacao")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: due_principal lacks data_ultima_atualizacao"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    due_sync_core::timestamp::rfc3339(value).context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::thread;

    use due_sync_core::{normalize, ChangeDetector, DuePayload, SubResources};
    use due_sync_core::payload::FiscalRequirement;
    use serde_json::json;
    use time::macros::{datetime, offset};
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    fn migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn payload(value: serde_json::Value) -> Result<DuePayload> {
        Ok(serde_json::from_value(value)?)
    }

    fn record_set(id: &str, value: serde_json::Value, synced_at: &str) -> Result<NormalizedRecordSet> {
        Ok(normalize(&RecordId::new(id), &payload(value)?, &SubResources::default(), synced_at))
    }

    fn rows_for(store: &SqliteStore, table: Table, id: &str) -> Result<i64> {
        count(
            &store.conn,
            &format!("SELECT COUNT(*) FROM {} WHERE {} = ?1", table.name(), table.record_column()),
            params![id],
        )
    }

    fn filter(now: OffsetDateTime, stale_before: Option<OffsetDateTime>) -> CandidateFilter {
        CandidateFilter { detector: ChangeDetector::new(7, offset!(-3)), now, stale_before }
    }

    #[test]
    fn migrate_is_idempotent_and_reports_clean_integrity() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn unversioned_database_is_inferred_then_completed() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(
            "CREATE TABLE due_principal (numero TEXT PRIMARY KEY, situacao TEXT,
                 data_de_registro TEXT, data_da_averbacao TEXT, data_ultima_atualizacao TEXT);",
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert!(table_exists(&store.conn, "nf_due_vinculo")?);
        assert!(!store.schema_status()?.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn replacing_a_record_replaces_children_instead_of_merging() -> Result<()> {
        let mut store = migrated()?;
        let first = record_set(
            "24BR0000000001",
            json!({
                "numero": "24BR0000000001",
                "situacao": "EM_CARGA",
                "itens": [
                    {"numero": 1, "listaDeEnquadramentos": [{"codigo": 80000}]},
                    {"numero": 2, "listaDeEnquadramentos": [{"codigo": 80001}]}
                ],
                "eventosDoHistorico": [{"evento": "Registro"}, {"evento": "Desembaraco"}]
            }),
            "2026-03-01T10:00:00Z",
        )?;
        store.replace_records(&[first])?;
        assert_eq!(rows_for(&store, Table::Items, "24BR0000000001")?, 2);
        assert_eq!(rows_for(&store, Table::ItemFrameworks, "24BR0000000001")?, 2);

        let second = record_set(
            "24BR0000000001",
            json!({
                "numero": "24BR0000000001",
                "situacao": "AVERBADA_SEM_DIVERGENCIA",
                "itens": [{"numero": 1}],
                "eventosDoHistorico": [{"evento": "Averbacao"}]
            }),
            "2026-03-02T10:00:00Z",
        )?;
        store.replace_records(&[second])?;

        assert_eq!(rows_for(&store, Table::Principal, "24BR0000000001")?, 1);
        assert_eq!(rows_for(&store, Table::Items, "24BR0000000001")?, 1);
        assert_eq!(rows_for(&store, Table::ItemFrameworks, "24BR0000000001")?, 0);
        assert_eq!(rows_for(&store, Table::HistoryEvents, "24BR0000000001")?, 1);
        let situacao: String = store.conn.query_row(
            "SELECT situacao FROM due_principal WHERE numero = ?1",
            params!["24BR0000000001"],
            |row| row.get(0),
        )?;
        assert_eq!(situacao, "AVERBADA_SEM_DIVERGENCIA");
        assert!(store.integrity_check()?.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn unrequested_subresources_keep_their_rows() -> Result<()> {
        let mut store = migrated()?;
        let id = RecordId::new("24BR0000000002");
        let body = payload(json!({"numero": "24BR0000000002", "situacao": "EM_CARGA"}))?;
        let with_requirements = SubResources {
            fiscal_requirements: Some(vec![FiscalRequirement::default(), FiscalRequirement::default()]),
            ..SubResources::default()
        };
        store.replace_records(&[normalize(&id, &body, &with_requirements, "2026-03-01T10:00:00Z")])?;
        assert_eq!(rows_for(&store, Table::FiscalRequirements, id.as_str())?, 2);

        store.replace_records(&[normalize(&id, &body, &SubResources::default(), "2026-03-02T10:00:00Z")])?;
        assert_eq!(rows_for(&store, Table::FiscalRequirements, id.as_str())?, 2);

        let emptied = SubResources { fiscal_requirements: Some(Vec::new()), ..SubResources::default() };
        store.replace_records(&[normalize(&id, &body, &emptied, "2026-03-03T10:00:00Z")])?;
        assert_eq!(rows_for(&store, Table::FiscalRequirements, id.as_str())?, 0);
        Ok(())
    }

    #[test]
    fn failed_batch_writes_nothing() -> Result<()> {
        let mut store = migrated()?;
        let good = record_set("24BR0000000003", json!({"situacao": "EM_CARGA"}), "2026-03-01T10:00:00Z")?;
        let mut broken = good.clone();
        broken.record_id = RecordId::new("24BR0000000004");
        broken.row_sets.retain(|set| !set.table.is_principal());

        assert!(store.replace_records(&[good, broken]).is_err());
        assert_eq!(store.stats()?.records, 0);
        Ok(())
    }

    #[test]
    fn links_are_immutable_and_orphans_are_reported() -> Result<()> {
        let mut store = migrated()?;
        let key = ExternalRef::new("1".repeat(ExternalRef::KEY_LENGTH));
        let link = RecordLink { external_ref: key.clone(), record_id: RecordId::new("24BR0000000005") };
        assert_eq!(store.save_links(&[link.clone()])?, 1);

        let rebind = RecordLink { external_ref: key, record_id: RecordId::new("24BR9999999999") };
        assert_eq!(store.save_links(&[rebind])?, 0);
        assert_eq!(store.get_links()?, vec![link]);
        assert_eq!(store.get_orphans()?, vec![RecordId::new("24BR0000000005")]);

        store.replace_records(&[record_set(
            "24BR0000000005",
            json!({"situacao": "EM_CARGA"}),
            "2026-03-01T10:00:00Z",
        )?])?;
        assert!(store.get_orphans()?.is_empty());
        Ok(())
    }

    #[test]
    fn candidates_skip_cancelled_and_put_never_synced_first() -> Result<()> {
        let mut store = migrated()?;
        let now = datetime!(2026-03-10 12:00 UTC);
        store.replace_records(&[
            record_set("A", json!({"situacao": "EM_CARGA"}), "2026-03-09T12:00:00Z")?,
            record_set("B", json!({"situacao": "DESEMBARACADA"}), "2026-03-01T12:00:00Z")?,
            record_set("C", json!({"situacao": "CANCELADA_PELO_EXPORTADOR"}), "2026-01-01T12:00:00Z")?,
            record_set(
                "D",
                json!({"situacao": "AVERBADA_SEM_DIVERGENCIA", "dataDaAverbacao": "2026-01-05T10:00:00.000-0300"}),
                "2026-03-01T12:00:00Z",
            )?,
            record_set("E", json!({"situacao": "REGISTRADA"}), "2026-03-02T12:00:00Z")?,
        ])?;
        store.conn.execute(
            "UPDATE due_principal SET data_ultima_atualizacao = NULL WHERE numero = 'E'",
            [],
        )?;

        let pending = store.get_candidates(Classification::Pending, &filter(now, None))?;
        let ids: Vec<&str> = pending.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["E", "B", "A"]);

        let stale = store.get_candidates(
            Classification::Pending,
            &filter(now, Some(now - Duration::hours(24))),
        )?;
        assert_eq!(stale.len(), 2);

        let old = store.get_candidates(Classification::SettledOld, &filter(now, None))?;
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].settled_at, Some(datetime!(2026-01-05 13:00 UTC)));

        assert!(store.get_candidates(Classification::Cancelled, &filter(now, None))?.is_empty());
        assert_eq!(store.stats()?.cancelled_records, 1);
        Ok(())
    }

    #[test]
    fn advancing_last_sync_touches_only_the_timestamp() -> Result<()> {
        let mut store = migrated()?;
        store.replace_records(&[record_set(
            "24BR0000000006",
            json!({"situacao": "AVERBADA_SEM_DIVERGENCIA", "dataDeRegistro": "2026-01-07T11:29:42.000-0300",
                   "itens": [{"numero": 1}]}),
            "2026-03-01T10:00:00Z",
        )?])?;

        let at = datetime!(2026-03-05 08:00 UTC);
        let ids = [RecordId::new("24BR0000000006"), RecordId::new("missing")];
        assert_eq!(store.advance_last_sync(&ids, at)?, 1);

        let (registro, synced): (String, String) = store.conn.query_row(
            "SELECT data_de_registro, data_ultima_atualizacao FROM due_principal WHERE numero = ?1",
            params!["24BR0000000006"],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(registro, "2026-01-07T11:29:42.000-0300");
        assert_eq!(synced, "2026-03-05T08:00:00Z");
        assert_eq!(rows_for(&store, Table::Items, "24BR0000000006")?, 1);
        Ok(())
    }

    #[test]
    fn upsert_batch_updates_on_conflict_and_rejects_bad_rows() -> Result<()> {
        let mut store = migrated()?;
        let set = record_set("24BR0000000007", json!({"situacao": "EM_CARGA"}), "2026-03-01T10:00:00Z")?;
        let Some(principal) = set.rows(Table::Principal) else {
            return Err(anyhow!("principal row missing"));
        };
        let mut row = principal[0].clone();
        store.upsert_batch(Table::Principal, &[row.clone()], &["numero"])?;
        row[11] = json!("DESEMBARACADA");
        store.upsert_batch(Table::Principal, &[row.clone()], &["numero"])?;

        assert_eq!(store.stats()?.records, 1);
        let situacao: String = store.conn.query_row(
            "SELECT situacao FROM due_principal WHERE numero = '24BR0000000007'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(situacao, "DESEMBARACADA");

        assert!(store.upsert_batch(Table::Principal, &[row], &["nope"]).is_err());
        assert!(store.upsert_batch(Table::Principal, &[vec![json!("short")]], &["numero"]).is_err());
        Ok(())
    }

    #[test]
    fn existing_records_and_refs() -> Result<()> {
        let mut store = migrated()?;
        let keys = [
            ExternalRef::new("2".repeat(ExternalRef::KEY_LENGTH)),
            ExternalRef::new("3".repeat(ExternalRef::KEY_LENGTH)),
        ];
        assert_eq!(store.import_refs(&keys)?, 2);
        assert_eq!(store.import_refs(&keys)?, 0);
        assert_eq!(store.get_external_refs()?, keys.to_vec());

        store.replace_records(&[record_set("X1", json!({"situacao": "EM_CARGA"}), "2026-03-01T10:00:00Z")?])?;
        let found = store.existing_records(&[RecordId::new("X1"), RecordId::new("X2")])?;
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![RecordId::new("X1")]);
        Ok(())
    }

    #[test]
    fn reconnect_keeps_file_backed_data() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("duesync-reconnect-{}.sqlite3", Ulid::new()));
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.replace_records(&[record_set("R1", json!({"situacao": "EM_CARGA"}), "2026-03-01T10:00:00Z")?])?;
            store.reconnect()?;
            assert_eq!(store.stats()?.records, 1);
        }

        // A second process-style connection sees committed data.
        let reader_path = db_path.clone();
        let handle = thread::spawn(move || -> Result<i64> {
            let store = SqliteStore::open(&reader_path)?;
            Ok(store.stats()?.records)
        });
        let Ok(records) = handle.join() else {
            return Err(anyhow!("reader thread panicked"));
        };
        assert_eq!(records?, 1);

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
        Ok(())
    }
}
