use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::payload::{
    CodeRef, ConcessionAct, DuePayload, Nationality, Party, SubResources, TaxDeclaration,
};
use crate::record::RecordId;

/// Flat tables a declaration is split into. The principal table comes first.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Principal,
    HistoryEvents,
    Items,
    ItemFrameworks,
    ItemDestinations,
    CargoSituations,
    Requests,
    TaxCompensations,
    TaxPayments,
    TaxDisputes,
    SuspensionActs,
    ExemptionActs,
    FiscalRequirements,
}

const PRINCIPAL_COLUMNS: &[&str] = &[
    "numero",
    "chave_de_acesso",
    "data_de_registro",
    "bloqueio",
    "canal",
    "embarque_em_recinto_alfandegado",
    "despacho_em_recinto_alfandegado",
    "forma_de_exportacao",
    "impedido_de_embarque",
    "informacoes_complementares",
    "ruc",
    "situacao",
    "situacao_do_tratamento_administrativo",
    "tipo",
    "tratamento_prioritario",
    "responsavel_pelo_acd",
    "despacho_em_recinto_domiciliar",
    "data_de_criacao",
    "data_do_cce",
    "data_do_desembaraco",
    "data_do_acd",
    "data_da_averbacao",
    "valor_total_mercadoria",
    "inclusao_nota_fiscal",
    "exigencia_ativa",
    "consorciada",
    "dat",
    "oea",
    "declarante_numero_do_documento",
    "declarante_tipo_do_documento",
    "declarante_nome",
    "declarante_estrangeiro",
    "declarante_nacionalidade_codigo",
    "declarante_nacionalidade_nome",
    "declarante_nacionalidade_nome_resumido",
    "moeda_codigo",
    "pais_importador_codigo",
    "recinto_aduaneiro_de_despacho_codigo",
    "recinto_aduaneiro_de_embarque_codigo",
    "unidade_local_de_despacho_codigo",
    "unidade_local_de_embarque_codigo",
    "declaracao_tributaria_divergente",
    "data_ultima_atualizacao",
];

const HISTORY_EVENT_COLUMNS: &[&str] = &[
    "numero_due",
    "data_e_hora_do_evento",
    "evento",
    "responsavel",
    "informacoes_adicionais",
    "detalhes",
    "motivo",
];

const ITEM_COLUMNS: &[&str] = &[
    "id",
    "numero_due",
    "numero",
    "quantidade_na_unidade_estatistica",
    "peso_liquido_total",
    "valor_da_mercadoria_na_condicao_de_venda",
    "valor_da_mercadoria_no_local_de_embarque",
    "valor_da_mercadoria_no_local_de_embarque_em_reais",
    "valor_da_mercadoria_na_condicao_de_venda_em_reais",
    "data_de_conversao",
    "descricao_da_mercadoria",
    "unidade_comercializada",
    "nome_importador",
    "endereco_importador",
    "valor_total_calculado_item",
    "quantidade_na_unidade_comercializada",
    "ncm_codigo",
    "ncm_descricao",
    "ncm_unidade_medida_estatistica",
    "exportador_numero_do_documento",
    "exportador_tipo_do_documento",
    "exportador_nome",
    "exportador_estrangeiro",
    "exportador_nacionalidade_codigo",
    "exportador_nacionalidade_nome",
    "exportador_nacionalidade_nome_resumido",
    "codigo_condicao_venda",
    "exportacao_temporaria",
];

const ITEM_FRAMEWORK_COLUMNS: &[&str] = &[
    "due_item_id",
    "numero_due",
    "item_numero",
    "codigo",
    "data_registro",
    "descricao",
    "grupo",
    "tipo",
];

const ITEM_DESTINATION_COLUMNS: &[&str] =
    &["due_item_id", "numero_due", "item_numero", "codigo_pais"];

const CARGO_SITUATION_COLUMNS: &[&str] = &["numero_due", "codigo", "descricao", "carga_operada"];

const REQUEST_COLUMNS: &[&str] = &[
    "numero_due",
    "tipo_solicitacao",
    "data_da_solicitacao",
    "usuario_responsavel",
    "codigo_do_status_da_solicitacao",
    "status_da_solicitacao",
    "data_de_apreciacao",
    "motivo",
];

const TAX_COMPENSATION_COLUMNS: &[&str] =
    &["numero_due", "data_do_registro", "numero_da_declaracao", "valor_compensado"];

const TAX_PAYMENT_COLUMNS: &[&str] = &[
    "numero_due",
    "data_do_pagamento",
    "data_do_registro",
    "valor_da_multa",
    "valor_do_imposto_recolhido",
    "valor_do_juros_mora",
];

const TAX_DISPUTE_COLUMNS: &[&str] = &[
    "numero_due",
    "indice",
    "data_do_registro",
    "motivo",
    "status",
    "data_de_apreciacao",
    "observacao",
];

const CONCESSION_ACT_COLUMNS: &[&str] = &[
    "numero_due",
    "ato_numero",
    "tipo_codigo",
    "tipo_descricao",
    "item_numero",
    "item_ncm",
    "beneficiario_cnpj",
    "quantidade_exportada",
    "valor_com_cobertura_cambial",
    "valor_sem_cobertura_cambial",
    "item_de_due_numero",
];

const FISCAL_REQUIREMENT_COLUMNS: &[&str] = &[
    "numero_due",
    "numero_exigencia",
    "tipo_exigencia",
    "data_criacao",
    "data_limite",
    "status",
    "orgao_responsavel",
    "descricao",
    "valor_exigido",
    "valor_pago",
    "observacoes",
];

impl Table {
    pub const ALL: [Self; 13] = [
        Self::Principal,
        Self::HistoryEvents,
        Self::Items,
        Self::ItemFrameworks,
        Self::ItemDestinations,
        Self::CargoSituations,
        Self::Requests,
        Self::TaxCompensations,
        Self::TaxPayments,
        Self::TaxDisputes,
        Self::SuspensionActs,
        Self::ExemptionActs,
        Self::FiscalRequirements,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Principal => "due_principal",
            Self::HistoryEvents => "due_eventos_historico",
            Self::Items => "due_itens",
            Self::ItemFrameworks => "due_item_enquadramentos",
            Self::ItemDestinations => "due_item_paises_destino",
            Self::CargoSituations => "due_situacoes_carga",
            Self::Requests => "due_solicitacoes",
            Self::TaxCompensations => "due_declaracao_tributaria_compensacoes",
            Self::TaxPayments => "due_declaracao_tributaria_recolhimentos",
            Self::TaxDisputes => "due_declaracao_tributaria_contestacoes",
            Self::SuspensionActs => "due_atos_concessorios_suspensao",
            Self::ExemptionActs => "due_atos_concessorios_isencao",
            Self::FiscalRequirements => "due_exigencias_fiscais",
        }
    }

    #[must_use]
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Principal => PRINCIPAL_COLUMNS,
            Self::HistoryEvents => HISTORY_EVENT_COLUMNS,
            Self::Items => ITEM_COLUMNS,
            Self::ItemFrameworks => ITEM_FRAMEWORK_COLUMNS,
            Self::ItemDestinations => ITEM_DESTINATION_COLUMNS,
            Self::CargoSituations => CARGO_SITUATION_COLUMNS,
            Self::Requests => REQUEST_COLUMNS,
            Self::TaxCompensations => TAX_COMPENSATION_COLUMNS,
            Self::TaxPayments => TAX_PAYMENT_COLUMNS,
            Self::TaxDisputes => TAX_DISPUTE_COLUMNS,
            Self::SuspensionActs | Self::ExemptionActs => CONCESSION_ACT_COLUMNS,
            Self::FiscalRequirements => FISCAL_REQUIREMENT_COLUMNS,
        }
    }

    /// Column holding the declaration number.
    #[must_use]
    pub fn record_column(self) -> &'static str {
        match self {
            Self::Principal => "numero",
            _ => "numero_due",
        }
    }

    #[must_use]
    pub fn is_principal(self) -> bool {
        matches!(self, Self::Principal)
    }
}

/// Values aligned with [`Table::columns`].
pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSet {
    pub table: Table,
    pub rows: Vec<Row>,
}

/// Every row derived from one declaration fetch. Persisting it replaces all
/// prior rows of the listed tables for `record_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecordSet {
    pub record_id: RecordId,
    pub row_sets: Vec<RowSet>,
}

impl NormalizedRecordSet {
    #[must_use]
    pub fn rows(&self, table: Table) -> Option<&[Row]> {
        self.row_sets.iter().find(|set| set.table == table).map(|set| set.rows.as_slice())
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.row_sets.iter().map(|set| set.rows.len()).sum()
    }
}

fn text(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |v| Value::String(v.clone()))
}

fn flag(value: Option<bool>) -> Value {
    value.map_or(Value::Null, Value::Bool)
}

fn number(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::from)
}

fn raw(value: Option<&Value>) -> Value {
    value.cloned().unwrap_or(Value::Null)
}

fn code(value: Option<&CodeRef>) -> Value {
    raw(value.and_then(|c| c.codigo.as_ref()))
}

fn party_columns(party: Option<&Party>) -> [Value; 7] {
    let nationality: Option<&Nationality> = party.and_then(|p| p.nacionalidade.as_ref());
    [
        text(party.and_then(|p| p.numero_do_documento.as_ref())),
        text(party.and_then(|p| p.tipo_do_documento.as_ref())),
        text(party.and_then(|p| p.nome.as_ref())),
        flag(party.and_then(|p| p.estrangeiro)),
        raw(nationality.and_then(|n| n.codigo.as_ref())),
        text(nationality.and_then(|n| n.nome.as_ref())),
        text(nationality.and_then(|n| n.nome_resumido.as_ref())),
    ]
}

/// Flattens one declaration and its sub-resources into row sets.
///
/// `synced_at` is stamped into the principal row as the local last-sync time.
#[must_use]
pub fn normalize(
    record_id: &RecordId,
    payload: &DuePayload,
    subresources: &SubResources,
    synced_at: &str,
) -> NormalizedRecordSet {
    let id = Value::String(record_id.as_str().to_string());
    let mut row_sets = Vec::with_capacity(Table::ALL.len());

    let mut principal = vec![
        id.clone(),
        text(payload.chave_de_acesso.as_ref()),
        text(payload.data_de_registro.as_ref()),
        flag(payload.bloqueio),
        text(payload.canal.as_ref()),
        flag(payload.embarque_em_recinto_alfandegado),
        flag(payload.despacho_em_recinto_alfandegado),
        text(payload.forma_de_exportacao.as_ref()),
        flag(payload.impedido_de_embarque),
        text(payload.informacoes_complementares.as_ref()),
        text(payload.ruc.as_ref()),
        text(payload.situacao.as_ref()),
        text(payload.situacao_do_tratamento_administrativo.as_ref()),
        text(payload.tipo.as_ref()),
        flag(payload.tratamento_prioritario),
        text(payload.responsavel_pelo_acd.as_ref()),
        flag(payload.despacho_em_recinto_domiciliar),
        text(payload.data_de_criacao.as_ref()),
        text(payload.data_do_cce.as_ref()),
        text(payload.data_do_desembaraco.as_ref()),
        text(payload.data_do_acd.as_ref()),
        text(payload.data_da_averbacao.as_ref()),
        number(payload.valor_total_mercadoria),
        flag(payload.inclusao_nota_fiscal),
        flag(payload.exigencia_ativa),
        flag(payload.consorciada),
        flag(payload.dat),
        flag(payload.oea),
    ];
    principal.extend(party_columns(payload.declarante.as_ref()));
    principal.extend([
        code(payload.moeda.as_ref()),
        code(payload.pais_importador.as_ref()),
        code(payload.recinto_aduaneiro_de_despacho.as_ref()),
        code(payload.recinto_aduaneiro_de_embarque.as_ref()),
        code(payload.unidade_local_de_despacho.as_ref()),
        code(payload.unidade_local_de_embarque.as_ref()),
        flag(payload.declaracao_tributaria.as_ref().and_then(|t| t.divergente)),
        Value::String(synced_at.to_string()),
    ]);
    row_sets.push(RowSet { table: Table::Principal, rows: vec![principal] });

    let events = payload
        .eventos_do_historico
        .iter()
        .map(|event| {
            vec![
                id.clone(),
                text(event.data_e_hora_do_evento.as_ref()),
                text(event.evento.as_ref()),
                text(event.responsavel.as_ref()),
                text(event.informacoes_adicionais.as_ref()),
                text(event.detalhes.as_ref()),
                text(event.motivo.as_ref()),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::HistoryEvents, rows: events });

    let mut items = Vec::with_capacity(payload.itens.len());
    let mut frameworks = Vec::new();
    let mut destinations = Vec::new();
    let mut seen_items = BTreeSet::new();
    for item in &payload.itens {
        let item_number = item.numero.unwrap_or(0);
        if !seen_items.insert(item_number) {
            warn!(
                record = %record_id,
                item_id = %format!("{record_id}_{item_number}"),
                "duplicate item number; keeping the first occurrence"
            );
            continue;
        }
        let item_id = Value::String(format!("{record_id}_{item_number}"));
        let ncm = item.ncm.as_ref();

        let mut row = vec![
            item_id.clone(),
            id.clone(),
            Value::from(item_number),
            number(item.quantidade_na_unidade_estatistica),
            number(item.peso_liquido_total),
            number(item.valor_da_mercadoria_na_condicao_de_venda),
            number(item.valor_da_mercadoria_no_local_de_embarque),
            number(item.valor_da_mercadoria_no_local_de_embarque_em_reais),
            number(item.valor_da_mercadoria_na_condicao_de_venda_em_reais),
            text(item.data_de_conversao.as_ref()),
            text(item.descricao_da_mercadoria.as_ref()),
            text(item.unidade_comercializada.as_ref()),
            text(item.nome_importador.as_ref()),
            text(item.endereco_importador.as_ref()),
            number(item.valor_total_calculado_item),
            number(item.quantidade_na_unidade_comercializada),
            raw(ncm.and_then(|n| n.codigo.as_ref())),
            text(ncm.and_then(|n| n.descricao.as_ref())),
            text(ncm.and_then(|n| n.unidade_medida_estatistica.as_ref())),
        ];
        row.extend(party_columns(item.exportador.as_ref()));
        row.push(code(item.codigo_condicao_venda.as_ref()));
        row.push(flag(item.exportacao_temporaria.as_ref().and_then(|t| t.temporaria)));
        items.push(row);

        frameworks.extend(item.lista_de_enquadramentos.iter().map(|framework| {
            vec![
                item_id.clone(),
                id.clone(),
                Value::from(item_number),
                raw(framework.codigo.as_ref()),
                text(framework.data_registro.as_ref()),
                text(framework.descricao.as_ref()),
                raw(framework.grupo.as_ref()),
                raw(framework.tipo.as_ref()),
            ]
        }));
        destinations.extend(item.lista_pais_destino.iter().map(|country| {
            vec![item_id.clone(), id.clone(), Value::from(item_number), code(Some(country))]
        }));
    }
    row_sets.push(RowSet { table: Table::Items, rows: items });
    row_sets.push(RowSet { table: Table::ItemFrameworks, rows: frameworks });
    row_sets.push(RowSet { table: Table::ItemDestinations, rows: destinations });

    let cargo = payload
        .situacoes_da_carga
        .iter()
        .map(|situation| {
            vec![
                id.clone(),
                raw(situation.codigo.as_ref()),
                text(situation.descricao.as_ref()),
                flag(situation.carga_operada),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::CargoSituations, rows: cargo });

    let requests = payload
        .solicitacoes
        .iter()
        .map(|request| {
            vec![
                id.clone(),
                text(request.tipo_solicitacao.as_ref()),
                text(request.data_da_solicitacao.as_ref()),
                text(request.usuario_responsavel.as_ref()),
                raw(request.codigo_do_status_da_solicitacao.as_ref()),
                text(request.status_da_solicitacao.as_ref()),
                text(request.data_de_apreciacao.as_ref()),
                text(request.motivo.as_ref()),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::Requests, rows: requests });

    let no_tax = TaxDeclaration::default();
    let tax = payload.declaracao_tributaria.as_ref().unwrap_or(&no_tax);
    let compensations = tax
        .compensacoes
        .iter()
        .map(|entry| {
            vec![
                id.clone(),
                text(entry.data_do_registro.as_ref()),
                text(entry.numero_da_declaracao.as_ref()),
                number(entry.valor_compensado),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::TaxCompensations, rows: compensations });

    let payments = tax
        .recolhimentos
        .iter()
        .map(|entry| {
            vec![
                id.clone(),
                text(entry.data_do_pagamento.as_ref()),
                text(entry.data_do_registro.as_ref()),
                number(entry.valor_da_multa),
                number(entry.valor_do_imposto_recolhido),
                number(entry.valor_do_juros_mora),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::TaxPayments, rows: payments });

    let disputes = tax
        .contestacoes
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            vec![
                id.clone(),
                Value::from(index),
                text(entry.data_do_registro.as_ref()),
                text(entry.motivo.as_ref()),
                text(entry.status.as_ref()),
                text(entry.data_de_apreciacao.as_ref()),
                text(entry.observacao.as_ref()),
            ]
        })
        .collect();
    row_sets.push(RowSet { table: Table::TaxDisputes, rows: disputes });

    if let Some(acts) = subresources.suspension_acts.as_ref() {
        row_sets.push(RowSet { table: Table::SuspensionActs, rows: concession_rows(&id, acts) });
    }
    if let Some(acts) = subresources.exemption_acts.as_ref() {
        row_sets.push(RowSet { table: Table::ExemptionActs, rows: concession_rows(&id, acts) });
    }
    if let Some(requirements) = subresources.fiscal_requirements.as_ref() {
        let rows = requirements
            .iter()
            .map(|requirement| {
                vec![
                    id.clone(),
                    raw(requirement.numero.as_ref()),
                    text(requirement.tipo.as_ref()),
                    text(requirement.data_criacao.as_ref()),
                    text(requirement.data_limite.as_ref()),
                    text(requirement.status.as_ref()),
                    text(requirement.orgao_responsavel.as_ref()),
                    text(requirement.descricao.as_ref()),
                    number(requirement.valor_exigido),
                    number(requirement.valor_pago),
                    text(requirement.observacoes.as_ref()),
                ]
            })
            .collect();
        row_sets.push(RowSet { table: Table::FiscalRequirements, rows });
    }

    NormalizedRecordSet { record_id: record_id.clone(), row_sets }
}

fn concession_rows(id: &Value, acts: &[ConcessionAct]) -> Vec<Row> {
    acts.iter()
        .map(|act| {
            let kind = act.tipo.as_ref();
            let item = act.item.as_ref();
            vec![
                id.clone(),
                raw(act.numero.as_ref()),
                raw(kind.and_then(|k| k.codigo.as_ref())),
                text(kind.and_then(|k| k.descricao.as_ref())),
                raw(item.and_then(|i| i.numero.as_ref())),
                raw(item.and_then(|i| i.ncm.as_ref())),
                text(act.beneficiario.as_ref().and_then(|b| b.cnpj.as_ref())),
                number(act.quantidade_exportada),
                number(act.valor_com_cobertura_cambial),
                number(act.valor_sem_cobertura_cambial),
                raw(act.item_de_due.as_ref().and_then(|i| i.numero.as_ref())),
            ]
        })
        .collect()
}
